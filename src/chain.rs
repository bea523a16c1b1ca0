//! # Chain
//!
//! Builds a randomized cyclic pointer chain inside a caller-owned memory region. The region is
//! treated as an arena of fixed-stride slots; the first pointer-sized field of every slot holds the
//! address of the next slot in a seeded random order. Visiting slots in random order defeats the
//! hardware stride prefetchers and spatial locality, so each step of a traversal is a genuine
//! dependent load. The chain is a single cycle over every slot, so a traversal of any length just
//! keeps going around it.
use log::debug;
use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use std::hint::black_box;
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::ptr;

/// Address stored in the leading field of each slot
type SlotPtr = *const u8;

const POINTER_ALIGN: usize = align_of::<SlotPtr>();
const POINTER_WIDTH: usize = size_of::<SlotPtr>();

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("`buffer` must be aligned to {align} bytes (base address {addr:#x})")]
    Alignment { addr: usize, align: usize },
    #[error("`padded_bytes_per_element` ({stride}) must be a multiple of {align}")]
    StrideAlignment { stride: usize, align: usize },
    #[error("`padded_bytes_per_element` ({stride}) must be at least {min}")]
    StrideTooSmall { stride: usize, min: usize },
    #[error("region of {len} bytes cannot hold {num_elements} elements of {stride} bytes")]
    RegionTooSmall {
        len: usize,
        num_elements: usize,
        stride: usize,
    },
}

/// Generate a permutation of `0..num_elements` using a seeded Fisher-Yates shuffle. The same seed and
/// count always produce the same order.
pub fn permutation(num_elements: usize, seed: u64) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..num_elements).collect();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    indices.shuffle(&mut rng);
    indices
}

/// A cyclic pointer chain living inside a borrowed region.
///
/// The chain holds the region's exclusive borrow, so nothing can rewrite the slots while it is
/// being traversed.
#[derive(Debug)]
pub struct PointerChain<'a> {
    entry: SlotPtr,
    num_elements: usize,
    _region: PhantomData<&'a mut [u8]>,
}

impl PointerChain<'_> {
    /// Address of the first slot visited by a traversal
    pub fn entry(&self) -> SlotPtr {
        self.entry
    }

    /// Number of slots in the cycle
    pub fn len(&self) -> usize {
        self.num_elements
    }

    pub fn is_empty(&self) -> bool {
        self.num_elements == 0
    }

    /// Follow the chain for `loads` dependent loads starting at the entry, returning the slot the
    /// traversal stopped on.
    ///
    /// Never inlined, and every step is a volatile read, so the compiler can neither drop the loop
    /// nor hoist or vectorize the loads.
    #[inline(never)]
    pub fn walk(&self, loads: usize) -> SlotPtr {
        let mut current = self.entry;
        for _ in 0..loads {
            // SAFETY: `current` always points at a slot of the borrowed region, whose leading field
            // was written by `build_chain` with the address of another slot in that region.
            current = unsafe { ptr::read_volatile(current.cast::<SlotPtr>()) };
        }
        black_box(current)
    }
}

fn check_layout(base: usize, region_len: usize, num_elements: usize, stride: usize) -> Result<(), ChainError> {
    if base % POINTER_ALIGN != 0 {
        return Err(ChainError::Alignment {
            addr: base,
            align: POINTER_ALIGN,
        });
    }
    if stride % POINTER_ALIGN != 0 {
        return Err(ChainError::StrideAlignment {
            stride,
            align: POINTER_ALIGN,
        });
    }
    if stride < POINTER_WIDTH {
        return Err(ChainError::StrideTooSmall {
            stride,
            min: POINTER_WIDTH,
        });
    }
    match num_elements.checked_mul(stride) {
        Some(needed) if needed <= region_len => Ok(()),
        _ => Err(ChainError::RegionTooSmall {
            len: region_len,
            num_elements,
            stride,
        }),
    }
}

/// Link `num_elements` slots of `padded_bytes_per_element` bytes inside `buffer` into a single cycle
/// in seeded random order, returning the chain's entry.
///
/// A missing buffer or zero elements yields `Ok(None)` without touching memory: there is nothing to
/// traverse.
pub fn build_chain(
    buffer: Option<&mut [u8]>,
    num_elements: usize,
    padded_bytes_per_element: usize,
    seed: u64,
) -> Result<Option<PointerChain<'_>>, ChainError> {
    let Some(region) = buffer else {
        return Ok(None);
    };
    if num_elements == 0 {
        return Ok(None);
    }

    let base = region.as_mut_ptr();
    check_layout(base as usize, region.len(), num_elements, padded_bytes_per_element)?;

    let indices = permutation(num_elements, seed);
    let slot = |index: usize| -> *mut u8 {
        // SAFETY: `check_layout` guarantees `index * stride` stays inside the region.
        unsafe { base.add(index * padded_bytes_per_element) }
    };

    // Link elements according to the shuffled indices, then close the cycle
    for (i, &current) in indices.iter().enumerate() {
        let next = indices[(i + 1) % num_elements];
        // SAFETY: slot addresses are pointer-aligned (aligned base, aligned stride) and at least one
        // pointer wide, all inside the exclusively borrowed region.
        unsafe { slot(current).cast::<SlotPtr>().write(slot(next).cast_const()) };
    }

    debug!(
        "Built pointer chain over {} elements (stride {} bytes, seed {})",
        num_elements, padded_bytes_per_element, seed
    );

    Ok(Some(PointerChain {
        entry: slot(indices[0]).cast_const(),
        num_elements,
        _region: PhantomData,
    }))
}
