//! Coordination over a shared filesystem.
//!
//! Workers never talk to each other directly. Everything they share lives in
//! the run directory: a completion counter (`progress.txt`), the slowest
//! observed processing rate (`rate.txt`) and one heartbeat per worker.

pub mod heartbeat;
pub mod locking;
pub mod progress;
pub mod rate;
pub mod util;


use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("I/O on shared file failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to lock {path:?}: {errno}")]
    Lock {
        path: PathBuf,
        errno: nix::errno::Errno,
    },
    #[error("Failed to serialize shared record: {0}")]
    Serialize(#[from] serde_yaml::Error),
}

/// Rule used to decide that the last worker has finished
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BarrierMode {
    /// count every completion, trip once `ncores` completions are recorded
    #[default]
    Exact,
    /// the historic `c + 2 >= ncores` arithmetic, where the first completion
    /// only writes the baseline `0`
    Literal,
}
