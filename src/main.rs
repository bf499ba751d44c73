mod sim;

use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use rotation_drill::RotationError;
use rotation_drill::logging::init_tracing;

#[derive(Parser, Debug)]
#[command(
    name = "rotation_drill",
    version,
    about = "Slotted round-robin rendezvous drill",
    after_help = "Without a command, runs the shooting-drill demo (4 lanes, 5 ranks).\nSet RUST_LOG to control log output on stderr."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one rotation and print a summary.
    Run(RunArgs),
    /// Benchmark a single configuration and print CSV.
    Bench {
        /// Slot count (default 4).
        slots: Option<usize>,
        /// Group count (default 5).
        groups: Option<usize>,
        /// Run budget in milliseconds (default 500).
        duration_ms: Option<u64>,
        /// Fixed work per task in milliseconds (default 2).
        work_ms: Option<u64>,
        #[command(flatten)]
        flags: BenchFlags,
    },
    /// Sweep several configurations and print CSV.
    Stress {
        /// Comma-separated slot counts (default 1,2,4,8).
        #[arg(long, value_delimiter = ',')]
        slot_sets: Option<Vec<usize>>,
        /// Comma-separated group counts (default 1,3,5).
        #[arg(long, value_delimiter = ',')]
        group_sets: Option<Vec<usize>>,
        #[arg(long)]
        duration_ms: Option<u64>,
        #[arg(long)]
        work_ms: Option<u64>,
        #[command(flatten)]
        flags: BenchFlags,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(long, default_value_t = 4)]
    slots: usize,
    #[arg(long, default_value_t = 5)]
    groups: usize,
    #[arg(long, default_value_t = 2000)]
    duration_ms: u64,
    /// Upper bound of each task's random pause.
    #[arg(long, default_value_t = 100)]
    max_pause_ms: u64,
    /// Stop after this many completed rounds.
    #[arg(long)]
    round_limit: Option<u64>,
}

#[derive(Args, Debug)]
struct BenchFlags {
    /// Report group atomicity and rotation order violations on stderr.
    #[arg(long)]
    validate: bool,
    /// Interrupt slot 0 halfway through the budget.
    #[arg(long)]
    interrupt: bool,
}

/// Construction errors are operator mistakes (exit 2); aborted runs exit 1.
fn exit_code_for(err: &anyhow::Error) -> ExitCode {
    match err.downcast_ref::<RotationError>() {
        Some(rotation) if !rotation.is_runtime() => ExitCode::from(2),
        _ => ExitCode::FAILURE,
    }
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let result = match cli.command {
        None => sim::run_demo(),
        Some(Command::Run(args)) => sim::run_once(
            args.slots,
            args.groups,
            args.duration_ms,
            args.max_pause_ms,
            args.round_limit,
        ),
        Some(Command::Bench {
            slots,
            groups,
            duration_ms,
            work_ms,
            flags,
        }) => sim::run_benchmark(
            slots,
            groups,
            duration_ms,
            work_ms,
            flags.validate,
            flags.interrupt,
        ),
        Some(Command::Stress {
            slot_sets,
            group_sets,
            duration_ms,
            work_ms,
            flags,
        }) => sim::run_stress(
            slot_sets,
            group_sets,
            duration_ms,
            work_ms,
            flags.validate,
            flags.interrupt,
        ),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_code_for(&err)
        }
    }
}
