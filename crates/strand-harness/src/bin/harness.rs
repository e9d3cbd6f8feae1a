//! CLI entrypoint for the strand scenario harness.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use strand_harness::structured_log::{LogEmitter, validate_log_file};
use strand_harness::{HarnessError, LockOrderConfig, SpawnConfig, run_lock_order, run_spawn};

/// Scenario tooling for strand-core.
#[derive(Debug, Parser)]
#[command(name = "strand-harness")]
#[command(about = "End-to-end scenarios for the strand thread runtime")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create threads from concurrent creators and check registry accounting.
    Spawn {
        /// Host threads creating runtime threads at once.
        #[arg(long, default_value_t = 4)]
        creators: usize,
        /// Runtime threads per creator.
        #[arg(long, default_value_t = 8)]
        threads: usize,
        /// Stack size in KiB (runtime default when omitted).
        #[arg(long)]
        stack_kib: Option<usize>,
        /// JSONL output path (stdout when omitted).
        #[arg(long)]
        output: Option<PathBuf>,
        /// Run identifier embedded in trace ids.
        #[arg(long, default_value = "run")]
        run_id: String,
    },
    /// Exercise the lock-order observer with a consistent order and an inversion.
    LockOrder {
        /// Runtime worker threads.
        #[arg(long, default_value_t = 4)]
        workers: usize,
        /// Lock/unlock rounds per worker.
        #[arg(long, default_value_t = 1000)]
        iterations: usize,
        /// Skip the inverted acquisition.
        #[arg(long)]
        no_inversion: bool,
        /// Capture call stacks for each acquisition.
        #[arg(long)]
        capture_stacks: bool,
        /// JSONL output path (stdout when omitted).
        #[arg(long)]
        output: Option<PathBuf>,
        /// Run identifier embedded in trace ids.
        #[arg(long, default_value = "run")]
        run_id: String,
    },
    /// Validate a JSONL scenario log.
    ValidateLog {
        /// Log file to check.
        #[arg(long)]
        log: PathBuf,
    },
}

fn emitter_for(
    output: Option<&PathBuf>,
    scenario: &str,
    run_id: &str,
) -> std::io::Result<LogEmitter> {
    match output {
        Some(path) => LogEmitter::to_file(path, scenario, run_id),
        None => Ok(LogEmitter::to_stdout(scenario, run_id)),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Spawn {
            creators,
            threads,
            stack_kib,
            output,
            run_id,
        } => {
            let config = SpawnConfig {
                creators,
                threads_per_creator: threads,
                stack_size: stack_kib.map(|k| k * 1024),
            };
            let mut emitter = emitter_for(output.as_ref(), "spawn", &run_id)?;
            let summary = run_spawn(&config, &mut emitter)?;
            eprintln!(
                "spawn: {:?} ({} threads)",
                summary.outcome, summary.threads
            );
            summary.into_result()?;
        }
        Command::LockOrder {
            workers,
            iterations,
            no_inversion,
            capture_stacks,
            output,
            run_id,
        } => {
            let config = LockOrderConfig {
                workers,
                iterations,
                inversion: !no_inversion,
                capture_stacks,
            };
            let mut emitter = emitter_for(output.as_ref(), "lock-order", &run_id)?;
            let summary = run_lock_order(&config, &mut emitter)?;
            eprintln!(
                "lock-order: {:?} ({} predicted deadlock(s))",
                summary.outcome, summary.predicted_deadlocks
            );
            summary.into_result()?;
        }
        Command::ValidateLog { log } => {
            let (lines, errors) = validate_log_file(&log)?;
            for err in &errors {
                eprintln!("{err}");
            }
            if !errors.is_empty() {
                return Err(HarnessError::InvalidLog {
                    path: log,
                    lines,
                    errors: errors.len(),
                }
                .into());
            }
            eprintln!("{}: {lines} valid record(s)", log.display());
        }
    }

    Ok(())
}
