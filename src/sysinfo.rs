//! OS queries for memory geometry: cache line size, base page size and hugepage size.
use log::debug;
use std::fs;
use std::io;
use std::sync::OnceLock;

const CACHE_LINE_PATH: &str = "/sys/devices/system/cpu/cpu0/cache/index0/coherency_line_size";
const MEMINFO_PATH: &str = "/proc/meminfo";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("Failed to get the cache line size: {0}")]
    CacheLine(String),
    #[error("Failed to get the page size")]
    PageSize,
    #[error("Failed to read /proc/meminfo to get the hugepage size: {0}")]
    MeminfoUnreadable(String),
    #[error("Could not find 'Hugepagesize' entry in /proc/meminfo")]
    HugepageEntryMissing,
    #[error("Malformed 'Hugepagesize' entry in /proc/meminfo: '{0}'")]
    HugepageEntryMalformed(String),
    #[error("Unknown unit for Hugepagesize in /proc/meminfo: {0}")]
    HugepageUnit(String),
}

/// L1 data cache line size in bytes. Reads sysfs first and falls back to `sysconf` where sysfs
/// lacks the cache hierarchy (common in containers).
pub fn get_cache_line_bytes() -> Result<usize, QueryError> {
    resolve_cache_line(fs::read_to_string(CACHE_LINE_PATH), sysconf_cache_line)
}

/// Pick the cache line size from the sysfs contents, or from `fallback` when those are missing or
/// not a positive integer
pub fn resolve_cache_line(
    sysfs: io::Result<String>,
    fallback: impl FnOnce() -> Option<usize>,
) -> Result<usize, QueryError> {
    let sysfs_err = match sysfs {
        Ok(raw) => match raw.trim().parse::<usize>() {
            Ok(bytes) if bytes > 0 => return Ok(bytes),
            _ => format!("unexpected value '{}'", raw.trim()),
        },
        Err(e) => e.to_string(),
    };
    match fallback() {
        Some(bytes) => {
            debug!("Cache line size from sysconf ({} B); sysfs: {}", bytes, sysfs_err);
            Ok(bytes)
        }
        None => Err(QueryError::CacheLine(sysfs_err)),
    }
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
fn sysconf_cache_line() -> Option<usize> {
    // SAFETY: sysconf has no memory-safety preconditions.
    let bytes = unsafe { libc::sysconf(libc::_SC_LEVEL1_DCACHE_LINESIZE) };
    (bytes > 0).then_some(bytes as usize)
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
fn sysconf_cache_line() -> Option<usize> {
    None
}

/// Base OS page size in bytes
pub fn get_page_size() -> Result<usize, QueryError> {
    // SAFETY: sysconf has no memory-safety preconditions.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size < 1 {
        return Err(QueryError::PageSize);
    }
    Ok(page_size as usize)
}

/// Default hugepage size in bytes, read from `/proc/meminfo` on first use and cached for the rest of
/// the process.
pub fn get_hugepage_size() -> Result<usize, QueryError> {
    static HUGEPAGE_SIZE: OnceLock<Result<usize, QueryError>> = OnceLock::new();
    HUGEPAGE_SIZE
        .get_or_init(|| {
            let meminfo =
                fs::read_to_string(MEMINFO_PATH).map_err(|e| QueryError::MeminfoUnreadable(e.to_string()))?;
            parse_hugepage_size(&meminfo)
        })
        .clone()
}

/// Extract the `Hugepagesize:` entry (e.g. `Hugepagesize:    2048 kB`) from meminfo text
pub fn parse_hugepage_size(meminfo: &str) -> Result<usize, QueryError> {
    const KB: usize = 1024;
    const MB: usize = 1024 * 1024;

    let line = meminfo
        .lines()
        .find(|line| line.starts_with("Hugepagesize:"))
        .ok_or(QueryError::HugepageEntryMissing)?;

    let mut fields = line.split_whitespace().skip(1);
    let value = fields
        .next()
        .and_then(|v| v.parse::<usize>().ok())
        .ok_or_else(|| QueryError::HugepageEntryMalformed(line.to_string()))?;

    match fields.next() {
        Some("kB") => Ok(value * KB),
        Some("MB") => Ok(value * MB),
        Some(unit) => Err(QueryError::HugepageUnit(unit.to_string())),
        None => Err(QueryError::HugepageEntryMalformed(line.to_string())),
    }
}
