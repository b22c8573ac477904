use crate::{
    config::JobConfig,
    notify::Notifier,
    partition::{partition, PartitionError, WorkerPartition},
    provider::{ProviderError, ScoreRequest, Scorer, UnitProvider},
    reassemble::{ReassembleError, Reassembly, ResultReassembler},
    sync::{
        heartbeat::Heartbeat,
        progress::{BarrierOutcome, ProgressTracker},
        rate::RateEstimator,
        util::RunDir,
        SyncError,
    },
};
use itertools::Itertools;
use std::{
    fs::File,
    io::Write,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, info, instrument};

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Invalid partition: {0}")]
    Partition(#[from] PartitionError),
    #[error("Failed to write results: {0}")]
    Io(#[from] std::io::Error),
    #[error("Shared state failure: {0}")]
    Sync(#[from] SyncError),
    #[error("Unit {unit} failed: {source}")]
    Unit { unit: usize, source: ProviderError },
    #[error("Reassembly failed: {0}")]
    Reassemble(#[from] ReassembleError),
}

/// Everything the workers of one job share
pub struct Context<'a> {
    pub config: &'a JobConfig,
    pub run_dir: RunDir,
    pub provider: &'a dyn UnitProvider,
    pub scorer: &'a dyn Scorer,
    pub notifier: &'a Notifier,
}

impl<'a> Context<'a> {
    pub fn new(
        config: &'a JobConfig,
        provider: &'a dyn UnitProvider,
        scorer: &'a dyn Scorer,
        notifier: &'a Notifier,
    ) -> Self {
        Self {
            config,
            run_dir: RunDir::new(&config.run_dir),
            provider,
            scorer,
            notifier,
        }
    }

    pub fn progress(&self) -> ProgressTracker {
        ProgressTracker::new(&self.run_dir, self.config.ncores, self.config.barrier)
    }

    pub fn reassembler(&self) -> ResultReassembler {
        ResultReassembler::new(
            &self.run_dir,
            self.provider,
            self.notifier,
            self.config.cleanup,
        )
    }
}

/// What a worker did, returned once its partition is done
#[derive(Debug)]
pub struct WorkerReport {
    pub core: usize,
    pub units: usize,
    pub elapsed: Duration,
    pub outcome: BarrierOutcome,
    /// only set for the worker that tripped the barrier
    pub reassembly: Option<Reassembly>,
}

/// Processes one partition and takes part in the completion barrier
pub struct WorkerLoop<'a> {
    context: &'a Context<'a>,
    partition: WorkerPartition,
}

/// shortest representation that parses back to the same value
fn format_value(value: f64) -> String {
    format!("{value:?}")
}

impl<'a> WorkerLoop<'a> {
    pub fn new(context: &'a Context<'a>, core: usize) -> Result<Self, WorkerError> {
        let partition = partition(context.provider.units().len(), context.config.ncores, core)?;

        Ok(Self { context, partition })
    }

    #[instrument(skip(self), fields(core = self.partition.core), level = "info")]
    pub fn run(&self) -> Result<WorkerReport, WorkerError> {
        let context = self.context;
        let config = context.config;
        let run_dir = &context.run_dir;
        let core = self.partition.core;
        let total = self.partition.len();
        let rate = RateEstimator::new(run_dir);

        info!(
            "This core will be doing {total} units out of {} total ({:?})",
            context.provider.units().len(),
            self.partition.range
        );

        // restart safe for this worker only, earlier results of this partition are discarded
        let mut scalars = File::create(run_dir.scalars(core))?;
        let mut weights = File::create(run_dir.weights(core))?;
        Heartbeat::new(core, 0, total, false).write(run_dir)?;

        let start = Instant::now();

        for (i, unit) in self.partition.range.clone().enumerate() {
            let selection = &context.provider.units()[unit];
            let result = context
                .scorer
                .score_and_weights(&ScoreRequest {
                    unit,
                    center: selection.center,
                    voxels: &selection.voxels,
                    labels: &config.model.labels,
                    algorithm: &config.model.algorithm,
                    cv: &config.model.cv,
                })
                .map_err(|source| WorkerError::Unit { unit, source })?;

            let last = i + 1 == total;
            let score = format_value(result.sanitized_score());
            let row = result.weights.iter().copied().map(format_value).join(",");

            if last {
                scalars.write_all(score.as_bytes())?;
                weights.write_all(row.as_bytes())?;
            } else {
                scalars.write_all(format!("{score},").as_bytes())?;
                weights.write_all(format!("{row}\n").as_bytes())?;
            }
            scalars.flush()?;
            weights.flush()?;

            debug!(unit, score = %score, "Finished unit");

            if i % config.rate.interval == 0 {
                rate.estimate(core, start.elapsed(), i + 1, total)?;
                Heartbeat::new(core, i + 1, total, false).write(run_dir)?;

                // keeps the estimate from being pinned by an early slow start forever
                if core == 0 && i % config.rate.refresh_interval == 0 {
                    rate.clear()?;
                }
            }
        }

        scalars.sync_all()?;
        weights.sync_all()?;

        let elapsed = start.elapsed();
        info!(units = total, elapsed = ?elapsed, "Finished partition");
        Heartbeat::new(core, total, total, true).write(run_dir)?;

        let outcome = context.progress().complete(core)?;
        let reassembly = match outcome {
            BarrierOutcome::Tripped => Some(context.reassembler().run(true)?),
            BarrierOutcome::Waiting { .. } => None,
        };

        Ok(WorkerReport {
            core,
            units: total,
            elapsed,
            outcome,
            reassembly,
        })
    }
}

#[cfg(test)]
pub mod tests {
    use super::{format_value, Context, WorkerError, WorkerLoop};
    use crate::{
        config::JobConfig,
        notify::Notifier,
        provider::{
            grid::{GridMasks, MaskImage},
            ProviderError, ScoreRequest, Scorer, UnitResult,
        },
        sync::{heartbeat::Heartbeat, progress::BarrierOutcome, rate::RateEstimator},
    };
    use std::{fs, path::Path};

    /// score is the unit's x coordinate, NaN for every unit divisible by 4;
    /// weights are the unit index and the selection size
    pub struct CoordinateScorer;

    impl Scorer for CoordinateScorer {
        fn score_and_weights(&self, request: &ScoreRequest) -> Result<UnitResult, ProviderError> {
            Ok(UnitResult {
                score: if request.unit % 4 == 0 && request.unit > 0 {
                    f64::NAN
                } else {
                    request.center[0] as f64 + 0.5
                },
                weights: vec![request.unit as f64, request.voxels.len() as f64],
            })
        }
    }

    pub struct FailingScorer;

    impl Scorer for FailingScorer {
        fn score_and_weights(&self, request: &ScoreRequest) -> Result<UnitResult, ProviderError> {
            if request.unit == 4 {
                Err(ProviderError::ScorerTimeout)
            } else {
                Ok(UnitResult {
                    score: 1.0,
                    weights: vec![],
                })
            }
        }
    }

    /// `n` units along the x axis
    pub fn line(n: usize) -> GridMasks {
        let mask = MaskImage {
            dims: [n, 1, 1],
            voxels: vec![1; n],
        };

        GridMasks::build(&mask, &mask, 1.0).unwrap()
    }

    pub fn job(run_dir: &Path, ncores: usize, extra: &str) -> JobConfig {
        serde_yaml::from_str(&format!(
            "run_dir: {}
ncores: {ncores}
masks:
  brain: brain.yaml
scorer:
  exec: score.sh
{extra}",
            run_dir.display()
        ))
        .unwrap()
    }

    #[test]
    fn values_use_round_trip_formatting() {
        assert_eq!(format_value(0.0), "0.0");
        assert_eq!(format_value(-2.5), "-2.5");
        assert_eq!(format_value(0.1).parse::<f64>().unwrap(), 0.1);
    }

    #[test]
    fn partition_files_have_no_trailing_separators() {
        let dir = tempfile::tempdir().unwrap();
        let config = job(dir.path(), 3, "");
        let masks = line(10);
        let notifier = Notifier::Null;
        let context = Context::new(&config, &masks, &CoordinateScorer, &notifier);

        let report = WorkerLoop::new(&context, 2).unwrap().run().unwrap();

        assert_eq!(report.units, 4);
        assert_eq!(report.outcome, BarrierOutcome::Waiting { recorded: 1 });
        assert!(report.reassembly.is_none());
        // unit 8 is NaN and stored as 0.0
        assert_eq!(
            fs::read_to_string(context.run_dir.scalars(2)).unwrap(),
            "6.5,7.5,0.0,9.5"
        );
        assert_eq!(
            fs::read_to_string(context.run_dir.weights(2)).unwrap(),
            "6.0,3.0\n7.0,3.0\n8.0,3.0\n9.0,2.0"
        );
    }

    #[test]
    fn restart_discards_previous_results() {
        let dir = tempfile::tempdir().unwrap();
        let config = job(dir.path(), 2, "");
        let masks = line(4);
        let notifier = Notifier::Null;
        let context = Context::new(&config, &masks, &CoordinateScorer, &notifier);
        fs::write(context.run_dir.scalars(0), "stale,values,").unwrap();

        WorkerLoop::new(&context, 0).unwrap().run().unwrap();

        assert_eq!(
            fs::read_to_string(context.run_dir.scalars(0)).unwrap(),
            "0.5,1.5"
        );
    }

    #[test]
    fn progress_is_reported_on_cadence() {
        let dir = tempfile::tempdir().unwrap();
        let config = job(dir.path(), 2, "rate:\n  interval: 2\n  refresh_interval: 100\n");
        let masks = line(10);
        let notifier = Notifier::Null;
        let context = Context::new(&config, &masks, &CoordinateScorer, &notifier);

        WorkerLoop::new(&context, 1).unwrap().run().unwrap();

        let record = RateEstimator::new(&context.run_dir).read().unwrap().unwrap();
        assert!(record.message.starts_with("Core 1 is slowest"));

        let heartbeat = Heartbeat::read(&context.run_dir, 1).unwrap().unwrap();
        assert!(heartbeat.finished);
        assert_eq!(heartbeat.units_done, 5);
    }

    #[test]
    fn core_zero_clears_the_rate_record() {
        let dir = tempfile::tempdir().unwrap();
        // the first unit both reports and refreshes, nothing else reports afterwards
        let config = job(dir.path(), 2, "rate:\n  interval: 7\n  refresh_interval: 1\n");
        let masks = line(4);
        let notifier = Notifier::Null;
        let context = Context::new(&config, &masks, &CoordinateScorer, &notifier);

        WorkerLoop::new(&context, 0).unwrap().run().unwrap();

        assert_eq!(RateEstimator::new(&context.run_dir).read().unwrap(), None);
    }

    #[test]
    fn scorer_failures_stop_the_worker() {
        let dir = tempfile::tempdir().unwrap();
        let config = job(dir.path(), 1, "");
        let masks = line(6);
        let notifier = Notifier::Null;
        let context = Context::new(&config, &masks, &FailingScorer, &notifier);

        let error = WorkerLoop::new(&context, 0).unwrap().run().unwrap_err();

        assert!(matches!(error, WorkerError::Unit { unit: 4, .. }));
        // nothing was recorded for the barrier
        assert_eq!(context.progress().recorded().unwrap(), None);
    }

    #[test]
    fn too_many_cores_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = job(dir.path(), 5, "");
        let masks = line(3);
        let notifier = Notifier::Null;
        let context = Context::new(&config, &masks, &CoordinateScorer, &notifier);

        assert!(matches!(
            WorkerLoop::new(&context, 0),
            Err(WorkerError::Partition(_))
        ));
    }
}
