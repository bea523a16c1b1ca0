//! Page-aligned anonymous memory mappings that back the pointer chain. Pages are zero and are not
//! faulted in until first touched, so hugepage advice given right after allocation still applies.
use crate::sysinfo;
use log::warn;
use std::io;
use std::ptr::{self, NonNull};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("`alignment_bytes` ({0}) must be a power of 2 and a multiple of {ptr}", ptr = std::mem::size_of::<usize>())]
    InvalidAlignment(usize),
    #[error("failed to allocate {size} bytes aligned to {align}")]
    Allocation { size: usize, align: usize },
}

/// Hugepage policy advised to the kernel for a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HugepagePolicy {
    Huge,
    NoHuge,
}

/// Owned anonymous mapping aligned to a caller-chosen power of two, unmapped on drop
#[derive(Debug)]
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    len: usize,
    /// Bytes mapped at `ptr`; zero when nothing was mapped (zero-sized request)
    mapped: usize,
}

/// Unmap `len` bytes at `addr`, warning on failure
fn unmap(addr: *mut u8, len: usize) {
    // SAFETY: callers pass a page-aligned range that they own and never use again.
    if unsafe { libc::munmap(addr.cast::<libc::c_void>(), len) } != 0 {
        warn!("munmap({:p}, {}) failed: {}", addr, len, io::Error::last_os_error());
    }
}

impl AlignedBuffer {
    /// Map `size_bytes` (rounded up to a multiple of `alignment_bytes` and of the page size) of
    /// zeroed memory starting at an `alignment_bytes` boundary
    pub fn allocate(size_bytes: usize, alignment_bytes: usize) -> Result<Self, AllocError> {
        if !alignment_bytes.is_power_of_two() || alignment_bytes % std::mem::size_of::<usize>() != 0 {
            return Err(AllocError::InvalidAlignment(alignment_bytes));
        }
        let alloc_err = AllocError::Allocation {
            size: size_bytes,
            align: alignment_bytes,
        };

        if size_bytes == 0 {
            return Ok(AlignedBuffer {
                ptr: NonNull::new(alignment_bytes as *mut u8).ok_or(alloc_err)?,
                len: 0,
                mapped: 0,
            });
        }

        let page_size = sysinfo::get_page_size().map_err(|_| alloc_err.clone())?;
        let map_align = alignment_bytes.max(page_size);
        let rounded = size_bytes
            .checked_next_multiple_of(map_align)
            .ok_or(alloc_err.clone())?;
        // over-map so an aligned start always exists, then trim both ends
        let request = rounded.checked_add(map_align).ok_or(alloc_err.clone())?;

        // SAFETY: fresh private anonymous mapping; no existing memory is affected.
        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                request,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            warn!("mmap of {} bytes failed: {}", request, io::Error::last_os_error());
            return Err(alloc_err);
        }

        let base = raw.cast::<u8>();
        let head = (base as usize).next_multiple_of(map_align) - base as usize;
        let tail = request - head - rounded;
        // SAFETY: `head + rounded + tail == request`, all inside the mapping just created.
        let aligned = unsafe { base.add(head) };
        if head > 0 {
            unmap(base, head);
        }
        if tail > 0 {
            // SAFETY: see above.
            unmap(unsafe { aligned.add(rounded) }, tail);
        }

        Ok(AlignedBuffer {
            ptr: NonNull::new(aligned).ok_or(alloc_err)?,
            len: size_bytes,
            mapped: rounded,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: `ptr` is valid for `len` zero-initialized bytes (or dangling and aligned when
        // `len` is zero) and uniquely owned by `self`.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Advise the kernel of the hugepage policy for this buffer. Best effort: the caller decides
    /// whether a failure matters.
    pub fn advise(&self, policy: HugepagePolicy) -> io::Result<()> {
        if self.mapped == 0 {
            return Ok(());
        }
        advise_region(self.ptr.as_ptr(), self.mapped, policy)
    }

    /// Same as [`AlignedBuffer::advise`], logging a warning instead of returning the error
    pub fn advise_or_warn(&self, policy: HugepagePolicy) {
        if let Err(e) = self.advise(policy) {
            let name = match policy {
                HugepagePolicy::Huge => "MADV_HUGEPAGE",
                HugepagePolicy::NoHuge => "MADV_NOHUGEPAGE",
            };
            warn!("madvise({}) failed: {}", name, e);
        }
    }
}

#[cfg(target_os = "linux")]
fn advise_region(addr: *mut u8, len: usize, policy: HugepagePolicy) -> io::Result<()> {
    let advice = match policy {
        HugepagePolicy::Huge => libc::MADV_HUGEPAGE,
        HugepagePolicy::NoHuge => libc::MADV_NOHUGEPAGE,
    };
    // SAFETY: the range is a live mapping owned by the caller; madvise only changes paging hints.
    let ret = unsafe { libc::madvise(addr.cast::<libc::c_void>(), len, advice) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn advise_region(_addr: *mut u8, _len: usize, _policy: HugepagePolicy) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "hugepage advice is only available on Linux",
    ))
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        if self.mapped > 0 {
            unmap(self.ptr.as_ptr(), self.mapped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn honours_alignment() {
        for align in [8, 64, 4096] {
            let buffer = AlignedBuffer::allocate(100, align).unwrap();
            assert_eq!(buffer.as_ptr() as usize % align, 0);
            assert_eq!(buffer.len(), 100);
        }
    }

    #[test]
    fn memory_is_zeroed() {
        let mut buffer = AlignedBuffer::allocate(4096, 64).unwrap();
        assert!(buffer.as_mut_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn rejects_non_power_of_two() {
        assert_eq!(
            AlignedBuffer::allocate(64, 48).unwrap_err(),
            AllocError::InvalidAlignment(48)
        );
        assert_eq!(AlignedBuffer::allocate(64, 0).unwrap_err(), AllocError::InvalidAlignment(0));
    }

    #[test]
    fn rejects_sub_pointer_alignment() {
        assert_eq!(AlignedBuffer::allocate(64, 2).unwrap_err(), AllocError::InvalidAlignment(2));
    }

    /// Pages of `buffer` currently backed by physical memory
    #[cfg(target_os = "linux")]
    fn resident_pages(buffer: &AlignedBuffer) -> usize {
        let page_size = sysinfo::get_page_size().unwrap();
        let mut residency = vec![0u8; buffer.len().div_ceil(page_size)];
        // SAFETY: the range is a live, page-aligned mapping and `residency` has one byte per page.
        let ret = unsafe {
            libc::mincore(
                buffer.as_ptr() as *mut libc::c_void,
                buffer.len(),
                residency.as_mut_ptr(),
            )
        };
        assert_eq!(ret, 0, "mincore failed: {}", io::Error::last_os_error());
        residency.iter().filter(|&&page| page & 1 != 0).count()
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn pages_untouched_until_chain_built() {
        let page_size = sysinfo::get_page_size().unwrap();
        let size = 64 * 1024 * 1024;
        let mut buffer = AlignedBuffer::allocate(size, page_size).unwrap();
        assert_eq!(resident_pages(&buffer), 0);

        buffer.advise_or_warn(HugepagePolicy::NoHuge);
        assert_eq!(resident_pages(&buffer), 0);

        let num_elements = size / page_size;
        let chain = crate::chain::build_chain(Some(buffer.as_mut_slice()), num_elements, page_size, 1)
            .unwrap()
            .unwrap();
        assert_eq!(chain.len(), num_elements);
        assert_eq!(resident_pages(&buffer), num_elements);
    }

    #[test]
    fn alignment_above_page_size() {
        let align = 2 * 1024 * 1024;
        let buffer = AlignedBuffer::allocate(3 * 4096, align).unwrap();
        assert_eq!(buffer.as_ptr() as usize % align, 0);
    }

    #[test]
    fn zero_size_is_empty() {
        let mut buffer = AlignedBuffer::allocate(0, 4096).unwrap();
        assert!(buffer.is_empty());
        assert!(buffer.as_mut_slice().is_empty());
        assert!(buffer.advise(HugepagePolicy::NoHuge).is_ok());
    }
}
