use crate::{
    notify::{Completion, Notifier},
    provider::{ProviderError, UnitProvider, Volume},
    sync::util::{write_atomic, RunDir},
};
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use std::{fs, path::PathBuf};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// Per-worker files removed once the job has been reassembled
pub const SCRATCH_PATTERNS: [&str; 5] = [
    "r_all*.txt",
    "weights[0-9]*.txt",
    "heartbeat*.txt",
    "rate.txt",
    ".*.tmp",
];

#[derive(Error, Debug)]
pub enum ReassembleError {
    #[error("Failed to read or write merged results: {0}")]
    Io(#[from] std::io::Error),
    #[error("Value {position} of the merged results is not a number: {value:?}")]
    InvalidScalar { position: usize, value: String },
    #[error("Merged {found} values but the mask selects {expected} units")]
    LengthMismatch { expected: usize, found: usize },
    #[error("Failed to rebuild volume: {0}")]
    Provider(#[from] ProviderError),
    #[error("Failed to serialize volume: {0}")]
    Serialize(#[from] serde_yaml::Error),
    #[error("Globs were invalid")]
    InvalidGlobs(#[from] globset::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reassembly {
    /// no worker files were found, nothing was written
    Incomplete,
    Complete {
        workers: usize,
        units: usize,
        volume: PathBuf,
    },
}

/// Concatenated results of all workers found in the run directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Merged {
    pub workers: usize,
    pub scalars: String,
    pub weights: String,
}

/// Collect the result files of cores 0, 1, ... up to the first core with a
/// missing file.
///
/// Streams are joined with `,` (scalars) and `\n` (weight rows), which is the
/// same as appending a separator after every stream and stripping the last one.
pub fn merge(run_dir: &RunDir) -> Result<Option<Merged>, ReassembleError> {
    let mut scalars = Vec::new();
    let mut weights = Vec::new();

    loop {
        let core = scalars.len();
        let (scalar_path, weight_path) = (run_dir.scalars(core), run_dir.weights(core));

        if !(scalar_path.is_file() && weight_path.is_file()) {
            break;
        }

        scalars.push(fs::read_to_string(scalar_path)?);
        weights.push(fs::read_to_string(weight_path)?);
    }

    if scalars.is_empty() {
        return Ok(None);
    }

    Ok(Some(Merged {
        workers: scalars.len(),
        scalars: scalars.join(","),
        weights: weights.join("\n"),
    }))
}

/// Parse a comma separated stream of scalars in order
pub fn parse_scalars(stream: &str) -> Result<Vec<f64>, ReassembleError> {
    if stream.trim().is_empty() {
        return Ok(Vec::new());
    }

    stream
        .split(',')
        .enumerate()
        .map(|(position, value)| {
            value
                .trim()
                .parse::<f64>()
                .map_err(|_| ReassembleError::InvalidScalar {
                    position,
                    value: value.to_owned(),
                })
        })
        .collect()
}

fn scratch_globs() -> Result<GlobSet, ReassembleError> {
    let mut builder = GlobSetBuilder::new();

    for pattern in SCRATCH_PATTERNS {
        builder.add(Glob::new(pattern)?);
    }

    Ok(builder.build()?)
}

/// Remove the per-worker files from the top level of the run directory
pub fn remove_scratch(run_dir: &RunDir) -> Result<usize, ReassembleError> {
    let globs = scratch_globs()?;
    let mut removed = 0;

    for entry in WalkBuilder::new(run_dir.root())
        .max_depth(Some(1))
        .standard_filters(false)
        .build()
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(error) => {
                warn!("Failed to list run directory: {error}");
                continue;
            }
        };

        if entry.file_type().map_or(false, |kind| kind.is_file())
            && globs.is_match(entry.file_name())
        {
            fs::remove_file(entry.path())?;
            debug!(path = ?entry.path(), "Removed scratch file");
            removed += 1;
        }
    }

    Ok(removed)
}

/// Merges every worker's partial results into one ordered output
pub struct ResultReassembler<'a> {
    run_dir: &'a RunDir,
    provider: &'a dyn UnitProvider,
    notifier: &'a Notifier,
    cleanup: bool,
}

impl<'a> ResultReassembler<'a> {
    pub fn new(
        run_dir: &'a RunDir,
        provider: &'a dyn UnitProvider,
        notifier: &'a Notifier,
        cleanup: bool,
    ) -> Self {
        Self {
            run_dir,
            provider,
            notifier,
            cleanup,
        }
    }

    #[instrument(skip(self), level = "info")]
    pub fn run(&self, notify: bool) -> Result<Reassembly, ReassembleError> {
        info!(run_dir = ?self.run_dir.root(), "Merging data to one file");

        let merged = match merge(self.run_dir)? {
            Some(merged) => merged,
            None => {
                error!(run_dir = ?self.run_dir.root(), "Data not merged, no worker results found");

                return Ok(Reassembly::Incomplete);
            }
        };

        write_atomic(&self.run_dir.merged_scalars(), &merged.scalars)?;
        write_atomic(&self.run_dir.merged_weights(), &merged.weights)?;

        let values = parse_scalars(&merged.scalars)?;
        let expected = self.provider.units().len();

        if values.len() != expected {
            error!(
                workers = merged.workers,
                expected,
                found = values.len(),
                "Merged results do not cover the unit space"
            );

            return Err(ReassembleError::LengthMismatch {
                expected,
                found: values.len(),
            });
        }

        let volume: Volume = self.provider.inverse_transform(&values)?;
        let volume_path = self.run_dir.volume();
        write_atomic(&volume_path, &serde_yaml::to_string(&volume)?)?;

        info!(
            "Finished reassembly (reassembled {} partitions, {} units)",
            merged.workers,
            values.len()
        );

        if notify {
            self.notifier.notify(&Completion {
                run_dir: self.run_dir.root(),
                workers: merged.workers,
                units: values.len(),
            });
        }

        if self.cleanup {
            let removed = remove_scratch(self.run_dir)?;
            info!("Cleaned up {removed} scratch files");
        }

        Ok(Reassembly::Complete {
            workers: merged.workers,
            units: values.len(),
            volume: volume_path,
        })
    }
}
