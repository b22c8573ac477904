mod config;
mod executors;
mod notify;
mod partition;
mod provider;
mod reassemble;
mod sync;
mod worker;

use clap::{ArgAction, Parser, Subcommand};
use config::{ConfigErrors, JobConfig};
use executors::{ExecutorError, Executors};
use notify::Notifier;
use partition::{partitions, PartitionError};
use provider::{exec::ExecScorer, grid::GridMasks, ProviderError, UnitProvider};
use reassemble::{ReassembleError, Reassembly};
use std::{path::PathBuf, process::ExitCode};
use sync::{
    heartbeat::{survey, Liveness},
    rate::RateEstimator,
    SyncError,
};
use thiserror::Error;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use worker::Context;

#[derive(Debug, Parser)]
#[command(name = "searchlight", version, about)]
struct Cli {
    /// Job configuration (YAML)
    #[arg(short, long, default_value = "searchlight.yaml")]
    config: PathBuf,

    /// Raise the log level, repeat for more detail; RUST_LOG takes precedence
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Process partitions, a single one if `--core` is given
    Run {
        /// Partition to process in this process
        #[arg(long)]
        core: Option<usize>,
        /// Override `ncores` from the configuration
        #[arg(long)]
        ncores: Option<usize>,
    },
    /// Merge whatever partial results are present in the run directory
    Reassemble {
        /// Run the configured notifier afterwards
        #[arg(long)]
        notify: bool,
    },
    /// Show the barrier, the rate estimate and the liveness of every worker
    Status,
    /// Print the unit range of every partition
    Partition,
}

#[derive(Error, Debug)]
enum RunnerError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Partition(#[from] PartitionError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Reassemble(#[from] ReassembleError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("Failed to create run directory: {0}")]
    RunDir(#[from] std::io::Error),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match execute(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!("{error}");

            ExitCode::FAILURE
        }
    }
}

fn execute(cli: Cli) -> Result<(), RunnerError> {
    let mut config = JobConfig::load(&cli.config)?;

    if let Command::Run {
        ncores: Some(ncores),
        ..
    } = cli.command
    {
        config.ncores = ncores;
    }

    if config.preflight_checks() {
        return Err(ConfigErrors::Preflight.into());
    }

    let masks = GridMasks::load(&config.masks)?;
    let scorer = ExecScorer::load(&config.scorer);
    let notifier = Notifier::load(&config.notify);
    let context = Context::new(&config, &masks, &scorer, &notifier);

    match cli.command {
        Command::Run { core, .. } => {
            context.run_dir.create()?;

            let reports = Executors::load(&context, core)?.execute()?;

            for report in reports.iter() {
                info!(
                    core = report.core,
                    units = report.units,
                    elapsed = ?report.elapsed,
                    outcome = ?report.outcome,
                    "Worker finished"
                );
            }
        }
        Command::Reassemble { notify } => match context.reassembler().run(notify)? {
            Reassembly::Complete { units, volume, .. } => {
                info!("Wrote {units} units to {}", volume.display())
            }
            Reassembly::Incomplete => warn!("Nothing was reassembled"),
        },
        Command::Status => print_status(&context)?,
        Command::Partition => {
            for partition in partitions(masks.units().len(), config.ncores)? {
                println!(
                    "core {:>4}: {:>8}..{:<8} ({} units)",
                    partition.core,
                    partition.range.start,
                    partition.range.end,
                    partition.len()
                );
            }
        }
    }

    Ok(())
}

fn print_status(context: &Context) -> Result<(), RunnerError> {
    let config = context.config;

    match context.progress().recorded()? {
        Some(recorded) => println!("barrier ({:?}): {recorded} recorded", config.barrier),
        None => println!("barrier ({:?}): empty", config.barrier),
    }

    match RateEstimator::new(&context.run_dir).read()? {
        Some(record) => println!(
            "{}\nremaining: {} ({}s)",
            record.message,
            record.eta,
            record.eta.as_seconds()
        ),
        None => println!("no rate recorded"),
    }

    let stale_after = config.heartbeat.stale_after();

    for (core, liveness) in survey(&context.run_dir, config.ncores, stale_after)?
        .into_iter()
        .enumerate()
    {
        match liveness {
            Liveness::Finished(heartbeat) => {
                println!("core {core}: finished on {}", heartbeat.host)
            }
            Liveness::Alive { heartbeat, age } => println!(
                "core {core}: {}/{} units on {} (pid {}), {}s ago",
                heartbeat.units_done,
                heartbeat.units_total,
                heartbeat.host,
                heartbeat.pid,
                age.as_secs()
            ),
            Liveness::Stale { heartbeat, age } => {
                warn!(core, host = %heartbeat.host, pid = heartbeat.pid, "Worker looks stalled");
                println!(
                    "core {core}: STALE, {}/{} units, last heartbeat {}s ago",
                    heartbeat.units_done,
                    heartbeat.units_total,
                    age.as_secs()
                )
            }
            Liveness::Missing => println!("core {core}: no heartbeat"),
        }
    }

    Ok(())
}
