//! Memory Latency Measurement via Pointer Chasing
//!
//! Sweeps buffer sizes from 16 KiB to 1 GiB, walking a randomized pointer chain through each buffer
//! while sampling hardware counters. Prints one CSV record per configuration to stdout; diagnostics
//! go to stderr through `log`.
use clap::Parser;
use log::{error, info, warn};
use memory_latency_rs::events::EventSet;
use memory_latency_rs::harness::{self, HarnessSettings, Outcome};
use memory_latency_rs::perf::PerfEventBackend;
use memory_latency_rs::report::{CsvWriter, summary_table};
use memory_latency_rs::sweep::SweepConfig;
use memory_latency_rs::{format_size, sysinfo};
use std::io;
use std::process::ExitCode;

// use faster/smaller `mimalloc` allocator
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "memory_latency")]
#[command(about = "Measure memory access latency and cache/TLB misses across working-set sizes")]
struct Args {
    /// Smallest buffer size in bytes
    #[arg(long, default_value_t = 16 * 1024)]
    min_size: usize,

    /// Largest buffer size in bytes
    #[arg(long, default_value_t = 1024 * 1024 * 1024)]
    max_size: usize,

    /// Dependent loads per trial
    #[arg(long, default_value_t = harness::NUM_LOGICAL_LOADS)]
    loads: usize,

    /// Measured trials per configuration
    #[arg(long, default_value_t = harness::NUM_TRIALS)]
    trials: usize,

    /// Unmeasured warmup trials per configuration
    #[arg(long, default_value_t = harness::NUM_WARMUPS)]
    warmups: usize,

    /// Seed of the chain permutation
    #[arg(long, default_value_t = harness::RAND_SEED)]
    seed: u64,

    /// CPU core to pin the measuring thread to
    #[arg(long)]
    cpu_core: Option<usize>,

    /// Group leader event
    #[arg(long, default_value = "CYCLES")]
    cycles_event: String,

    #[arg(long, default_value = "L1-DCACHE-LOAD-MISSES")]
    l1d_event: String,

    #[arg(long, default_value = "LLC-LOAD-MISSES")]
    l2_event: String,

    #[arg(long, default_value = "LLC-LOAD-MISSES")]
    l3_event: String,

    #[arg(long, default_value = "DTLB-LOAD-MISSES")]
    tlb_event: String,

    /// Log a latency / miss-rate table after the sweep
    #[arg(long)]
    summary: bool,
}

impl Args {
    fn settings(&self) -> HarnessSettings {
        HarnessSettings {
            num_logical_loads: self.loads,
            num_trials: self.trials,
            num_warmups: self.warmups,
            seed: self.seed,
            events: EventSet {
                cycles: self.cycles_event.clone(),
                l1d_miss: self.l1d_event.clone(),
                l2_miss: self.l2_event.clone(),
                l3_miss: self.l3_event.clone(),
                tlb_miss: self.tlb_event.clone(),
            },
        }
    }
}

/// Pin to the requested core and raise priority; both are best effort
fn prepare_thread(cpu_core: Option<usize>) {
    if let Some(cpu_num) = cpu_core {
        let core_num = core_affinity::CoreId { id: cpu_num };
        if !core_affinity::set_for_current(core_num) {
            warn!("Couldn't pin measurement to CPU core {} (NOTE: this is expected on macOS)", cpu_num);
        }
    }

    if thread_priority::set_current_thread_priority(thread_priority::ThreadPriority::Max).is_err() {
        warn!("Couldn't set measurement thread to maximum priority");
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut csv = CsvWriter::new(io::stdout().lock());
    if let Err(e) = csv.write_header() {
        error!("Failed to write CSV header: {}", e);
        return ExitCode::FAILURE;
    }

    let geometry = sysinfo::get_cache_line_bytes().and_then(|line| Ok((line, sysinfo::get_page_size()?)));
    let (cache_line_bytes, page_size) = match geometry {
        Ok(geometry) => geometry,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let sweep = SweepConfig {
        min_size: args.min_size,
        max_size: args.max_size,
        ..SweepConfig::new(cache_line_bytes, page_size)
    };
    let settings = args.settings();

    info!(
        "Sweeping {} .. {} (cache line {} B, page {} B), {} warmups + {} trials of {} loads",
        format_size(sweep.min_size as f32),
        format_size(sweep.max_size as f32),
        cache_line_bytes,
        page_size,
        settings.num_warmups,
        settings.num_trials,
        settings.num_logical_loads
    );

    prepare_thread(args.cpu_core);

    let mut backend = PerfEventBackend;
    let mut results = Vec::new();
    for config in sweep.configs() {
        match harness::run_benchmark(&config, &settings, &mut backend) {
            Ok(Outcome::Measured(result)) => {
                if let Err(e) = csv.write_row(&result) {
                    error!("Failed to write CSV row: {}", e);
                    return ExitCode::FAILURE;
                }
                results.push(result);
            }
            Ok(Outcome::Skipped(reason)) => {
                warn!("Skipped {:?}: {:?}", config, reason);
            }
            Err(e) => {
                error!("{}", e);
                return ExitCode::FAILURE;
            }
        }
    }

    if args.summary {
        info!("Sweep summary\n{}", summary_table(&results));
    }

    ExitCode::SUCCESS
}
