use super::{
    locking::LockedFile,
    util::{read_record, RunDir},
    BarrierMode, SyncError,
};
use std::path::PathBuf;
use tracing::{info, instrument, warn};

/// Result of reporting a finished partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierOutcome {
    /// other partitions are still running, `recorded` was stored
    Waiting { recorded: usize },
    /// this was the last partition, the record was reset
    Tripped,
}

/// Value stored in `progress.txt` after one more completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Record(usize),
    Trip,
}

impl BarrierMode {
    /// advance the counter given the currently `recorded` value (`None` when empty)
    pub fn advance(self, recorded: Option<usize>, ncores: usize) -> Step {
        match self {
            Self::Exact => {
                let finished = recorded.unwrap_or(0) + 1;

                if finished >= ncores {
                    Step::Trip
                } else {
                    Step::Record(finished)
                }
            }
            // the first completion only writes the baseline, so the threshold is
            // `ncores - 2` recorded completions; with a single worker it never trips
            Self::Literal => match recorded {
                None => Step::Record(0),
                Some(count) if count + 2 >= ncores => Step::Trip,
                Some(count) => Step::Record(count + 1),
            },
        }
    }
}

/// Shared completion counter acting as a one-shot barrier.
///
/// The read-modify-write happens under an exclusive lock on `progress.txt`,
/// so completions are counted exactly once even when workers finish at the
/// same moment.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    path: PathBuf,
    ncores: usize,
    mode: BarrierMode,
}

impl ProgressTracker {
    pub fn new(run_dir: &RunDir, ncores: usize, mode: BarrierMode) -> Self {
        Self {
            path: run_dir.progress(),
            ncores,
            mode,
        }
    }

    /// report `core` as finished
    #[instrument(skip(self), level = "info")]
    pub fn complete(&self, core: usize) -> Result<BarrierOutcome, SyncError> {
        let mut file = LockedFile::open(&self.path)?;
        let recorded = self.parse(&file.read_to_string()?);

        match self.mode.advance(recorded, self.ncores) {
            Step::Trip => {
                file.replace("")?;
                info!(core, ncores = self.ncores, "All partitions finished");

                Ok(BarrierOutcome::Tripped)
            }
            Step::Record(recorded) => {
                file.replace(&recorded.to_string())?;
                info!(core, recorded, ncores = self.ncores, "Recorded finished partition");

                Ok(BarrierOutcome::Waiting { recorded })
            }
        }
    }

    /// currently recorded value, without taking the lock
    pub fn recorded(&self) -> Result<Option<usize>, SyncError> {
        Ok(read_record(&self.path)?.and_then(|contents| self.parse(&contents)))
    }

    fn parse(&self, contents: &str) -> Option<usize> {
        let trimmed = contents.trim();

        if trimmed.is_empty() {
            return None;
        }

        match trimmed.parse() {
            Ok(count) => Some(count),
            Err(error) => {
                warn!(path = ?self.path, contents = trimmed, error = ?error, "Treating malformed progress record as empty");

                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{BarrierOutcome, ProgressTracker, Step};
    use crate::sync::{util::RunDir, BarrierMode};
    use std::{fs, sync::Arc, thread};

    /// finish `ncores` workers one after another, return the 1-based completions that tripped
    fn serialized(mode: BarrierMode, ncores: usize) -> Vec<usize> {
        let dir = tempfile::tempdir().unwrap();
        let tracker = ProgressTracker::new(&RunDir::new(dir.path()), ncores, mode);

        (0..ncores)
            .filter(|&core| tracker.complete(core).unwrap() == BarrierOutcome::Tripped)
            .map(|core| core + 1)
            .collect()
    }

    #[test]
    fn exact_trips_once_on_last_completion() {
        for ncores in 1..=9 {
            assert_eq!(serialized(BarrierMode::Exact, ncores), vec![ncores]);
        }
    }

    #[test]
    fn literal_threshold_is_pinned() {
        // one worker writes the baseline and never trips
        assert!(serialized(BarrierMode::Literal, 1).is_empty());

        for ncores in 2..=9 {
            assert_eq!(serialized(BarrierMode::Literal, ncores), vec![ncores]);
        }

        assert_eq!(BarrierMode::Literal.advance(None, 4), Step::Record(0));
        assert_eq!(BarrierMode::Literal.advance(Some(0), 4), Step::Record(1));
        // trips after ncores - 2 recorded completions
        assert_eq!(BarrierMode::Literal.advance(Some(2), 4), Step::Trip);
    }

    #[test]
    fn barrier_resets_the_record() {
        let dir = tempfile::tempdir().unwrap();
        let run_dir = RunDir::new(dir.path());
        let tracker = ProgressTracker::new(&run_dir, 2, BarrierMode::Exact);

        assert_eq!(tracker.recorded().unwrap(), None);
        assert_eq!(
            tracker.complete(1).unwrap(),
            BarrierOutcome::Waiting { recorded: 1 }
        );
        assert_eq!(tracker.recorded().unwrap(), Some(1));
        assert_eq!(tracker.complete(0).unwrap(), BarrierOutcome::Tripped);
        assert_eq!(fs::read_to_string(run_dir.progress()).unwrap(), "");
    }

    #[test]
    fn malformed_record_counts_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let run_dir = RunDir::new(dir.path());
        fs::write(run_dir.progress(), "three").unwrap();

        let tracker = ProgressTracker::new(&run_dir, 3, BarrierMode::Exact);

        assert_eq!(tracker.recorded().unwrap(), None);
        assert_eq!(
            tracker.complete(0).unwrap(),
            BarrierOutcome::Waiting { recorded: 1 }
        );
    }

    #[test]
    fn concurrent_completions_trip_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let ncores = 16;
        let tracker = Arc::new(ProgressTracker::new(
            &RunDir::new(dir.path()),
            ncores,
            BarrierMode::Exact,
        ));

        let tripped = (0..ncores)
            .map(|core| {
                let tracker = Arc::clone(&tracker);

                thread::spawn(move || tracker.complete(core).unwrap())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|outcome| *outcome == BarrierOutcome::Tripped)
            .count();

        assert_eq!(tripped, 1);
    }
}
