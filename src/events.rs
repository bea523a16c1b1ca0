//! # Events
//!
//! Resolves human readable hardware event names into `perf_event_attr` encodings. Three forms are
//! accepted:
//! - generic kernel events, e.g. `CYCLES`, `L1-DCACHE-LOAD-MISSES`, `DTLB-LOAD-MISSES`
//!   (case-insensitive)
//! - PMU events exported through sysfs, `pmu::event[:term=value...]`, e.g.
//!   `cpu::mem_load_retired.l3_miss` or `cpu::event=0xd1,umask=0x20`
//! - raw hex configs, e.g. `r01d1`
use std::fs;
use std::path::{Path, PathBuf};

pub const PERF_TYPE_HARDWARE: u32 = 0;
pub const PERF_TYPE_HW_CACHE: u32 = 3;
pub const PERF_TYPE_RAW: u32 = 4;

const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;
const PERF_COUNT_HW_INSTRUCTIONS: u64 = 1;
const PERF_COUNT_HW_CACHE_REFERENCES: u64 = 2;
const PERF_COUNT_HW_CACHE_MISSES: u64 = 3;
const PERF_COUNT_HW_BRANCH_MISSES: u64 = 5;
const PERF_COUNT_HW_REF_CPU_CYCLES: u64 = 9;

const PERF_COUNT_HW_CACHE_L1D: u64 = 0;
const PERF_COUNT_HW_CACHE_LL: u64 = 2;
const PERF_COUNT_HW_CACHE_DTLB: u64 = 3;
const PERF_COUNT_HW_CACHE_NODE: u64 = 6;
const PERF_COUNT_HW_CACHE_OP_READ: u64 = 0;
const PERF_COUNT_HW_CACHE_RESULT_ACCESS: u64 = 0;
const PERF_COUNT_HW_CACHE_RESULT_MISS: u64 = 1;

const SYSFS_PMU_ROOT: &str = "/sys/bus/event_source/devices";

/// Kernel encoding of one event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventSpec {
    pub type_: u32,
    pub config: u64,
    pub config1: u64,
    pub config2: u64,
}

impl EventSpec {
    fn hardware(config: u64) -> Self {
        EventSpec {
            type_: PERF_TYPE_HARDWARE,
            config,
            ..Default::default()
        }
    }

    fn cache_read(cache: u64, result: u64) -> Self {
        EventSpec {
            type_: PERF_TYPE_HW_CACHE,
            config: cache | (PERF_COUNT_HW_CACHE_OP_READ << 8) | (result << 16),
            ..Default::default()
        }
    }
}

/// Names of the five events forming a measurement group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSet {
    pub cycles: String,
    pub l1d_miss: String,
    pub l2_miss: String,
    pub l3_miss: String,
    pub tlb_miss: String,
}

impl Default for EventSet {
    fn default() -> Self {
        // Generic kernel events only expose the last level cache, so L2 and L3 share it unless a
        // PMU-specific event is configured.
        EventSet {
            cycles: "CYCLES".to_string(),
            l1d_miss: "L1-DCACHE-LOAD-MISSES".to_string(),
            l2_miss: "LLC-LOAD-MISSES".to_string(),
            l3_miss: "LLC-LOAD-MISSES".to_string(),
            tlb_miss: "DTLB-LOAD-MISSES".to_string(),
        }
    }
}

impl EventSet {
    /// Follower events in open order
    pub fn followers(&self) -> [&str; 4] {
        [
            self.l1d_miss.as_str(),
            self.l2_miss.as_str(),
            self.l3_miss.as_str(),
            self.tlb_miss.as_str(),
        ]
    }
}

fn generic_event(name: &str) -> Option<EventSpec> {
    let spec = match name.to_ascii_uppercase().as_str() {
        "CYCLES" | "CPU-CYCLES" => EventSpec::hardware(PERF_COUNT_HW_CPU_CYCLES),
        "REF-CYCLES" => EventSpec::hardware(PERF_COUNT_HW_REF_CPU_CYCLES),
        "INSTRUCTIONS" => EventSpec::hardware(PERF_COUNT_HW_INSTRUCTIONS),
        "CACHE-REFERENCES" => EventSpec::hardware(PERF_COUNT_HW_CACHE_REFERENCES),
        "CACHE-MISSES" => EventSpec::hardware(PERF_COUNT_HW_CACHE_MISSES),
        "BRANCH-MISSES" => EventSpec::hardware(PERF_COUNT_HW_BRANCH_MISSES),
        "L1-DCACHE-LOADS" => EventSpec::cache_read(PERF_COUNT_HW_CACHE_L1D, PERF_COUNT_HW_CACHE_RESULT_ACCESS),
        "L1-DCACHE-LOAD-MISSES" => EventSpec::cache_read(PERF_COUNT_HW_CACHE_L1D, PERF_COUNT_HW_CACHE_RESULT_MISS),
        "LLC-LOADS" => EventSpec::cache_read(PERF_COUNT_HW_CACHE_LL, PERF_COUNT_HW_CACHE_RESULT_ACCESS),
        "LLC-LOAD-MISSES" => EventSpec::cache_read(PERF_COUNT_HW_CACHE_LL, PERF_COUNT_HW_CACHE_RESULT_MISS),
        "DTLB-LOADS" => EventSpec::cache_read(PERF_COUNT_HW_CACHE_DTLB, PERF_COUNT_HW_CACHE_RESULT_ACCESS),
        "DTLB-LOAD-MISSES" => EventSpec::cache_read(PERF_COUNT_HW_CACHE_DTLB, PERF_COUNT_HW_CACHE_RESULT_MISS),
        "NODE-LOAD-MISSES" => EventSpec::cache_read(PERF_COUNT_HW_CACHE_NODE, PERF_COUNT_HW_CACHE_RESULT_MISS),
        _ => return None,
    };
    Some(spec)
}

fn raw_event(name: &str) -> Option<EventSpec> {
    let hex = name.strip_prefix('r')?;
    let config = u64::from_str_radix(hex, 16).ok()?;
    Some(EventSpec {
        type_: PERF_TYPE_RAW,
        config,
        ..Default::default()
    })
}

/// Parse an integer in sysfs notation (`0x` hex, leading `0` octal, else decimal)
fn parse_u64_base0(input: &str) -> Option<u64> {
    let value = input.trim();
    if value.is_empty() {
        return None;
    }
    let (radix, digits) = if let Some(rest) = value.strip_prefix("0x").or(value.strip_prefix("0X")) {
        (16, rest)
    } else if value.len() > 1 && value.starts_with('0') {
        (8, &value[1..])
    } else {
        (10, value)
    };
    u64::from_str_radix(digits, radix).ok()
}

/// Which attr field a format term lands in, and at which bit ranges
#[derive(Debug, PartialEq, Eq)]
struct TermFormat {
    field: u8,
    ranges: Vec<(u32, u32)>,
}

/// Parse a sysfs format line such as `config:8-15` or `config1:0-7,32-35`
fn parse_term_format(format: &str) -> Option<TermFormat> {
    let (field, bits) = format.trim().split_once(':')?;
    let field = match field {
        "config" => 0,
        "config1" => 1,
        "config2" => 2,
        _ => return None,
    };
    let ranges = bits
        .split(',')
        .map(|range| -> Option<(u32, u32)> {
            match range.split_once('-') {
                Some((lo, hi)) => Some((lo.parse().ok()?, hi.parse().ok()?)),
                None => {
                    let bit = range.parse().ok()?;
                    Some((bit, bit))
                }
            }
        })
        .collect::<Option<Vec<_>>>()?;
    if ranges.iter().any(|&(lo, hi)| lo > hi || hi > 63) {
        return None;
    }
    Some(TermFormat { field, ranges })
}

/// Scatter `value` across the bit ranges of `format` into `spec`
fn apply_term(spec: &mut EventSpec, format: &TermFormat, mut value: u64) {
    let target = match format.field {
        0 => &mut spec.config,
        1 => &mut spec.config1,
        _ => &mut spec.config2,
    };
    for &(lo, hi) in &format.ranges {
        let width = hi - lo + 1;
        let mask = if width == 64 { u64::MAX } else { (1u64 << width) - 1 };
        *target |= (value & mask) << lo;
        value = if width == 64 { 0 } else { value >> width };
    }
}

/// Build an event spec from a PMU's `type` and a `term=value,...` list, looking up each term's
/// format with `lookup_format`.
fn spec_from_terms<F>(type_: u32, terms: &str, lookup_format: F) -> Option<EventSpec>
where
    F: Fn(&str) -> Option<String>,
{
    let mut spec = EventSpec {
        type_,
        ..Default::default()
    };
    let mut any = false;
    for term in terms.split([',', ':']).map(str::trim).filter(|t| !t.is_empty()) {
        let (key, value) = match term.split_once('=') {
            Some((key, value)) => (key.trim(), parse_u64_base0(value)?),
            // bare flag terms such as `any` or `edge` mean 1
            None => (term, 1),
        };
        let format = parse_term_format(&lookup_format(key)?)?;
        apply_term(&mut spec, &format, value);
        any = true;
    }
    any.then_some(spec)
}

fn sysfs_event(pmu: &str, event: &str, root: &Path) -> Option<EventSpec> {
    let pmu_dir: PathBuf = root.join(pmu);
    let type_: u32 = fs::read_to_string(pmu_dir.join("type")).ok()?.trim().parse().ok()?;
    let lookup_format = |key: &str| fs::read_to_string(pmu_dir.join("format").join(key)).ok();

    // `pmu::event:modifier=value` -> named event plus extra terms; `pmu::term=value,...` -> terms
    let (base, extra) = match event.split_once(':') {
        Some((base, extra)) => (base, extra),
        None => (event, ""),
    };
    let terms = if base.contains('=') {
        event.to_string()
    } else {
        let named = fs::read_to_string(pmu_dir.join("events").join(base)).ok()?;
        let named = named.lines().next().unwrap_or("").trim().to_string();
        if extra.is_empty() { named } else { format!("{named},{extra}") }
    };
    spec_from_terms(type_, &terms, lookup_format)
}

/// Resolve an event name against the running system, returning `None` if the event is unknown
pub fn resolve(name: &str) -> Option<EventSpec> {
    resolve_with_root(name, Path::new(SYSFS_PMU_ROOT))
}

fn resolve_with_root(name: &str, root: &Path) -> Option<EventSpec> {
    if let Some(spec) = generic_event(name) {
        return Some(spec);
    }
    if let Some((pmu, event)) = name.split_once("::") {
        return sysfs_event(pmu, event, root);
    }
    raw_event(name)
}
