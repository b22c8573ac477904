use super::{
    util::{hostname, read_record, unix_now, write_atomic, RunDir},
    SyncError,
};
use serde::{Deserialize, Serialize};
use std::{process, time::Duration};
use tracing::warn;

/// Bumped whenever the layout of `Heartbeat` changes
pub const HEARTBEAT_VERSION: u32 = 1;

/// Last sign of life of one worker, stored as YAML in `heartbeat{core}.txt`
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Heartbeat {
    pub version: u32,
    pub core: usize,
    pub host: String,
    pub pid: u32,
    pub units_done: usize,
    pub units_total: usize,
    pub timestamp: f64,
    pub finished: bool,
}

impl Heartbeat {
    pub fn new(core: usize, units_done: usize, units_total: usize, finished: bool) -> Self {
        Self {
            version: HEARTBEAT_VERSION,
            core,
            host: hostname(),
            pid: process::id(),
            units_done,
            units_total,
            timestamp: unix_now(),
            finished,
        }
    }

    pub fn write(&self, run_dir: &RunDir) -> Result<(), SyncError> {
        write_atomic(&run_dir.heartbeat(self.core), &serde_yaml::to_string(self)?)?;

        Ok(())
    }

    /// heartbeat of `core`, missing, malformed and foreign versions count as absent
    pub fn read(run_dir: &RunDir, core: usize) -> Result<Option<Self>, SyncError> {
        let path = run_dir.heartbeat(core);
        let contents = match read_record(&path)? {
            Some(contents) => contents,
            None => return Ok(None),
        };

        match serde_yaml::from_str::<Self>(&contents) {
            Ok(heartbeat) if heartbeat.version == HEARTBEAT_VERSION => Ok(Some(heartbeat)),
            Ok(heartbeat) => {
                warn!(path = ?path, version = heartbeat.version, "Ignoring heartbeat with unknown version");

                Ok(None)
            }
            Err(error) => {
                warn!(path = ?path, error = %error, "Ignoring malformed heartbeat");

                Ok(None)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Liveness {
    Finished(Heartbeat),
    Alive { heartbeat: Heartbeat, age: Duration },
    Stale { heartbeat: Heartbeat, age: Duration },
    Missing,
}

impl Liveness {
    pub fn classify(heartbeat: Option<Heartbeat>, now: f64, stale_after: Duration) -> Self {
        match heartbeat {
            None => Self::Missing,
            Some(heartbeat) if heartbeat.finished => Self::Finished(heartbeat),
            Some(heartbeat) => {
                // a timestamp too far in the past to represent is as stale as it gets
                let age = Duration::try_from_secs_f64((now - heartbeat.timestamp).max(0.0))
                    .unwrap_or(Duration::MAX);

                if age > stale_after {
                    Self::Stale { heartbeat, age }
                } else {
                    Self::Alive { heartbeat, age }
                }
            }
        }
    }
}

/// liveness of every core in `0..ncores`
pub fn survey(
    run_dir: &RunDir,
    ncores: usize,
    stale_after: Duration,
) -> Result<Vec<Liveness>, SyncError> {
    let now = unix_now();

    (0..ncores)
        .map(|core| {
            Heartbeat::read(run_dir, core)
                .map(|heartbeat| Liveness::classify(heartbeat, now, stale_after))
        })
        .collect()
}
