use clap::{Parser as ClapParser, Subcommand, ValueEnum};
use log::LevelFilter;
use thiserror::Error;

use heap::{
    BridgePolicy, DeleteStrategy, HeapSettings, InitialCount, NonHeapPolicy,
    SettingsError,
};
use rcheap::{StressConfig, run_chain, run_scenario, run_stress};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Size of the counted space in MiB
    #[arg(long, global = true, default_value_t = 64)]
    counted_mib: usize,

    /// Size of the traced space in MiB, 0 disables it
    #[arg(long, global = true, default_value_t = 16)]
    traced_mib: usize,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = Strategy::Deferred
    )]
    strategy: Strategy,

    #[arg(long, global = true, value_enum, default_value_t = Initial::Zero)]
    initial_count: Initial,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = Bridge::Remembered
    )]
    bridge: Bridge,

    /// Count stores into non-heap slots
    #[arg(long, global = true)]
    count_non_heap: bool,

    /// Sweep the counted space for cells the zero-count table missed
    #[arg(long, global = true)]
    counted_sweep: bool,

    /// KiB allocated between collections
    #[arg(long, global = true, default_value_t = 8 * 1024)]
    trigger_kib: usize,

    /// Log collection phases (-v) and per-object events (-vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store A into two slots of a root, clear both and collect
    Scenario,
    /// Several mutators allocating, linking and unlinking
    Stress {
        #[arg(long, default_value_t = 4)]
        threads: usize,
        #[arg(long, default_value_t = 100_000)]
        iterations: usize,
        /// Slots of each mutator's holder object
        #[arg(long, default_value_t = 64)]
        slots: usize,
        #[arg(long, default_value_t = 1)]
        seed: u64,
    },
    /// Cut a long chain at its head and time the cascade
    Chain {
        #[arg(long, default_value_t = 1_000_000)]
        length: usize,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Strategy {
    Eager,
    Deferred,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Initial {
    Zero,
    One,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Bridge {
    Remembered,
    Baseline,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("invalid heap settings: {0}")]
    Settings(#[from] SettingsError),
    #[error("--threads must be at least 1")]
    NoThreads,
    #[error("--slots must be at least 1")]
    NoSlots,
}

impl Cli {
    fn settings(&self) -> HeapSettings {
        HeapSettings {
            counted_size: self.counted_mib * 1024 * 1024,
            traced_size: self.traced_mib * 1024 * 1024,
            initial_count: match self.initial_count {
                Initial::Zero => InitialCount::Zero,
                Initial::One => InitialCount::One,
            },
            delete_strategy: match self.strategy {
                Strategy::Eager => DeleteStrategy::Eager,
                Strategy::Deferred => DeleteStrategy::Deferred,
            },
            non_heap_policy: if self.count_non_heap {
                NonHeapPolicy::Counted
            } else {
                NonHeapPolicy::Uncounted
            },
            bridge_policy: match self.bridge {
                Bridge::Remembered => BridgePolicy::Remembered,
                Bridge::Baseline => BridgePolicy::Baseline,
            },
            bytes_before_gc: self.trigger_kib * 1024,
            counted_sweep: self.counted_sweep,
            ..Default::default()
        }
    }
}

fn main() -> Result<(), CliError> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    let settings = cli.settings();
    settings.validate()?;

    match cli.command {
        Command::Scenario => {
            let report = run_scenario(settings)?;
            for (step, count) in &report.steps {
                println!("{step:<18} count {count}");
            }
            println!("A freed:          {}", report.a_freed);
            println!("child freed:      {}", report.child_freed);
            println!("cycles:           {}", report.stats.cycles);
        }
        Command::Stress {
            threads,
            iterations,
            slots,
            seed,
        } => {
            if threads == 0 {
                return Err(CliError::NoThreads);
            }
            if slots == 0 {
                return Err(CliError::NoSlots);
            }

            let config = StressConfig {
                threads,
                iterations,
                slots,
                seed,
            };
            let report = run_stress(settings, config)?;
            let total = report.stats.total;
            println!("allocations:      {}", report.allocations);
            println!("elapsed:          {:?}", report.elapsed);
            println!("cycles:           {}", report.stats.cycles);
            println!(
                "freed cells:      {} ({} bytes)",
                total.freed_cells, total.freed_bytes
            );
            println!("eagerly freed:    {}", report.stats.eager_freed);
            println!("resurrected:      {}", total.resurrected);
            println!("traced swept:     {}", total.traced_swept);
            println!("count mismatches: {}", report.mismatches.len());
            println!(
                "left over:        {} counted cells, {} traced cells",
                report.counted.cells,
                report.traced.map_or(0, |usage| usage.cells)
            );
        }
        Command::Chain { length } => {
            let report = run_chain(settings, length)?;
            println!(
                "freed {} of {} links in {:?}",
                report.freed_cells, report.length, report.elapsed
            );
        }
    }
    Ok(())
}
