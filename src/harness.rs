//! # Harness
//!
//! Drives one benchmark configuration end to end: allocates and advises a page-aligned buffer,
//! links a randomized pointer chain through it, opens a hardware counter group and repeatedly walks
//! the chain while sampling counter deltas. Only the fastest measured trial is kept, since
//! interrupts, preemption and unrelated system activity can only ever add cycles to a trial.
use crate::buffer::{AlignedBuffer, AllocError, HugepagePolicy};
use crate::chain::{ChainError, PointerChain, build_chain};
use crate::events::EventSet;
use crate::perf::{CounterBackend, CounterError, CounterGroup};
use crate::sysinfo::{self, QueryError};
use log::{debug, error, warn};
use std::hint::black_box;

pub const NUM_LOGICAL_LOADS: usize = 1_000_000;
pub const NUM_TRIALS: usize = 10;
pub const NUM_WARMUPS: usize = 3;
pub const RAND_SEED: u64 = 12345;

/// Tunables shared by every configuration of a sweep
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessSettings {
    pub num_logical_loads: usize,
    pub num_trials: usize,
    pub num_warmups: usize,
    pub seed: u64,
    pub events: EventSet,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        HarnessSettings {
            num_logical_loads: NUM_LOGICAL_LOADS,
            num_trials: NUM_TRIALS,
            num_warmups: NUM_WARMUPS,
            seed: RAND_SEED,
            events: EventSet::default(),
        }
    }
}

/// One point of the sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BenchmarkConfig {
    pub buffer_size_bytes: usize,
    pub padded_bytes_per_element: usize,
    pub use_hugepage: bool,
}

/// Measurement of one configuration. Miss counts belong to the same trial as `cycle_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BenchmarkResult {
    pub buffer_size: usize,
    pub padded_element_size: usize,
    pub page_size: usize,
    pub num_logical_loads: usize,
    pub cycle_count: u64,
    pub l1d_miss_count: u64,
    pub l2_miss_count: u64,
    pub l3_miss_count: u64,
    pub tlb_miss_count: u64,
}

impl BenchmarkResult {
    /// Result with no measured trial: maximal cycle count and no misses
    pub fn sentinel(config: &BenchmarkConfig, page_size: usize, num_logical_loads: usize) -> Self {
        BenchmarkResult {
            buffer_size: config.buffer_size_bytes,
            padded_element_size: config.padded_bytes_per_element,
            page_size,
            num_logical_loads,
            cycle_count: u64::MAX,
            l1d_miss_count: 0,
            l2_miss_count: 0,
            l3_miss_count: 0,
            tlb_miss_count: 0,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.cycle_count == u64::MAX
    }

    /// Average cycles per dependent load
    pub fn cycles_per_load(&self) -> f64 {
        self.cycle_count as f64 / self.num_logical_loads as f64
    }

    fn rate(&self, misses: u64) -> f64 {
        100.0 * misses as f64 / self.num_logical_loads as f64
    }

    /// Misses per hundred loads, in L1D, L2, L3, TLB order
    pub fn miss_rates(&self) -> [f64; 4] {
        [
            self.rate(self.l1d_miss_count),
            self.rate(self.l2_miss_count),
            self.rate(self.l3_miss_count),
            self.rate(self.tlb_miss_count),
        ]
    }

    /// Pages spanned by the buffer
    pub fn page_entries(&self) -> usize {
        self.buffer_size.div_ceil(self.page_size.max(1))
    }
}

/// Cycle and miss deltas observed across one chain walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrialSample {
    pub cycles: u64,
    pub l1d_misses: u64,
    pub l2_misses: u64,
    pub l3_misses: u64,
    pub tlb_misses: u64,
}

/// Keeps the measured trial with the fewest cycles, ignoring the leading warmup trials
#[derive(Debug, Clone)]
pub struct MinimumSelector {
    warmups: usize,
    seen: usize,
    best: Option<TrialSample>,
}

impl MinimumSelector {
    pub fn new(warmups: usize) -> Self {
        MinimumSelector {
            warmups,
            seen: 0,
            best: None,
        }
    }

    pub fn record(&mut self, sample: TrialSample) {
        let index = self.seen;
        self.seen += 1;
        if index < self.warmups {
            return;
        }
        // strictly smaller: ties keep the earlier trial
        if self.best.is_none_or(|best| sample.cycles < best.cycles) {
            self.best = Some(sample);
        }
    }

    pub fn best(&self) -> Option<TrialSample> {
        self.best
    }
}

/// Why a configuration produced no result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Buffer size is not an exact multiple of the element stride
    SizeNotMultiple {
        buffer_size_bytes: usize,
        padded_bytes_per_element: usize,
    },
    /// A counter of the group could not be opened, enabled or read
    Counters(CounterError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Measured(BenchmarkResult),
    Skipped(SkipReason),
}

/// Errors that abort the whole sweep
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum HarnessError {
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error(transparent)]
    Chain(#[from] ChainError),
}

/// Run all warmup and measured trials over `chain`, returning the fastest measured trial. Counter
/// reads bracket the walk: misses then cycles before it, cycles then misses (reversed) after it.
pub fn run_trials<B: CounterBackend>(
    group: &mut CounterGroup<'_, B>,
    chain: &PointerChain<'_>,
    settings: &HarnessSettings,
) -> Result<Option<TrialSample>, CounterError> {
    let mut selector = MinimumSelector::new(settings.num_warmups);

    for _ in 0..settings.num_warmups + settings.num_trials {
        let start_misses = group.read_misses()?;
        let start_cycles = group.read_cycles()?;

        black_box(chain.walk(settings.num_logical_loads));

        let end_cycles = group.read_cycles()?;
        let end_misses = group.read_misses_reversed()?;

        let misses = end_misses.since(&start_misses);
        selector.record(TrialSample {
            cycles: end_cycles.wrapping_sub(start_cycles),
            l1d_misses: misses.l1d,
            l2_misses: misses.l2,
            l3_misses: misses.l3,
            tlb_misses: misses.tlb,
        });
    }

    Ok(selector.best())
}

/// Measure one configuration.
///
/// Returns `Ok(Outcome::Skipped(..))` for problems that only affect this configuration and `Err`
/// for problems that should stop the sweep.
pub fn run_benchmark<B: CounterBackend>(
    config: &BenchmarkConfig,
    settings: &HarnessSettings,
    backend: &mut B,
) -> Result<Outcome, HarnessError> {
    let BenchmarkConfig {
        buffer_size_bytes,
        padded_bytes_per_element,
        use_hugepage,
    } = *config;

    if padded_bytes_per_element == 0 || buffer_size_bytes % padded_bytes_per_element != 0 {
        error!(
            "`buffer_size_in_bytes` ({}) must be a multiple of `padded_bytes_per_element` ({})",
            buffer_size_bytes, padded_bytes_per_element
        );
        return Ok(Outcome::Skipped(SkipReason::SizeNotMultiple {
            buffer_size_bytes,
            padded_bytes_per_element,
        }));
    }
    let num_elements = buffer_size_bytes / padded_bytes_per_element;

    let (page_size, policy) = if use_hugepage {
        (sysinfo::get_hugepage_size()?, HugepagePolicy::Huge)
    } else {
        (sysinfo::get_page_size()?, HugepagePolicy::NoHuge)
    };

    debug!(
        "Benchmark: buffer {} bytes, stride {} bytes, page {} bytes ({} elements)",
        buffer_size_bytes, padded_bytes_per_element, page_size, num_elements
    );

    let mut buffer = AlignedBuffer::allocate(buffer_size_bytes, page_size)?;
    buffer.advise_or_warn(policy);

    let sentinel = BenchmarkResult::sentinel(config, page_size, settings.num_logical_loads);
    let Some(chain) = build_chain(
        Some(buffer.as_mut_slice()),
        num_elements,
        padded_bytes_per_element,
        settings.seed,
    )?
    else {
        warn!("Nothing to traverse for a {} byte buffer", buffer_size_bytes);
        return Ok(Outcome::Measured(sentinel));
    };

    let mut group = match CounterGroup::open(backend, &settings.events) {
        Ok(group) => group,
        Err(e) => return Ok(Outcome::Skipped(SkipReason::Counters(e))),
    };
    if let Err(e) = group.enable() {
        error!("{}", e);
        return Ok(Outcome::Skipped(SkipReason::Counters(e)));
    }

    let best = run_trials(&mut group, &chain, settings);
    // disable and close before releasing the buffer
    drop(group);
    let best = match best {
        Ok(best) => best,
        Err(e) => {
            error!("{}", e);
            return Ok(Outcome::Skipped(SkipReason::Counters(e)));
        }
    };

    let result = match best {
        Some(trial) => BenchmarkResult {
            cycle_count: trial.cycles,
            l1d_miss_count: trial.l1d_misses,
            l2_miss_count: trial.l2_misses,
            l3_miss_count: trial.l3_misses,
            tlb_miss_count: trial.tlb_misses,
            ..sentinel
        },
        None => sentinel,
    };
    Ok(Outcome::Measured(result))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(cycles: u64, tag: u64) -> TrialSample {
        TrialSample {
            cycles,
            l1d_misses: tag,
            l2_misses: tag + 1,
            l3_misses: tag + 2,
            tlb_misses: tag + 3,
        }
    }

    #[test]
    fn selector_ignores_warmups() {
        let mut selector = MinimumSelector::new(3);
        selector.record(sample(1, 0));
        selector.record(sample(2, 0));
        selector.record(sample(3, 0));
        assert_eq!(selector.best(), None);

        selector.record(sample(100, 7));
        assert_eq!(selector.best(), Some(sample(100, 7)));
    }

    #[test]
    fn selector_keeps_minimum_with_its_misses() {
        let mut selector = MinimumSelector::new(0);
        for (i, cycles) in [50, 30, 45, 28, 60].into_iter().enumerate() {
            selector.record(sample(cycles, 10 * i as u64));
        }
        assert_eq!(selector.best(), Some(sample(28, 30)));
    }

    #[test]
    fn selector_ties_keep_first() {
        let mut selector = MinimumSelector::new(0);
        selector.record(sample(40, 1));
        selector.record(sample(40, 2));
        assert_eq!(selector.best(), Some(sample(40, 1)));
    }

    #[test]
    fn derived_metrics() {
        let config = BenchmarkConfig {
            buffer_size_bytes: 10_000,
            padded_bytes_per_element: 64,
            use_hugepage: false,
        };
        let result = BenchmarkResult {
            cycle_count: 4_000,
            l1d_miss_count: 1_000,
            l2_miss_count: 500,
            l3_miss_count: 0,
            tlb_miss_count: 10,
            ..BenchmarkResult::sentinel(&config, 4096, 1_000)
        };
        assert_eq!(result.cycles_per_load(), 4.0);
        assert_eq!(result.miss_rates(), [100.0, 50.0, 0.0, 1.0]);
        assert_eq!(result.page_entries(), 3);
        assert!(!result.is_sentinel());
    }
}
