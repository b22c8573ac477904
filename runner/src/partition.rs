//! Deterministic split of the flat unit index space.
//!
//! Every worker derives its own range from `(n, ncores, core)` alone, there
//! is no shared partition table. Core `i` owns
//! `[floor(i * n / ncores), floor((i + 1) * n / ncores))`; the last upper bound
//! is exactly `n`, so remainders end up spread over the trailing partitions.

use std::ops::Range;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PartitionError {
    #[error("there are no units to distribute")]
    NoUnits,
    #[error("ncores must be greater than 0")]
    NoWorkers,
    #[error("core {core} is out of range for {ncores} cores")]
    CoreOutOfRange { core: usize, ncores: usize },
    #[error("{ncores} cores for {n} units would leave workers without work")]
    MoreWorkersThanUnits { n: usize, ncores: usize },
}

/// Contiguous slice of units owned by one worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPartition {
    pub core: usize,
    pub range: Range<usize>,
}

impl WorkerPartition {
    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

fn bound(i: usize, n: usize, ncores: usize) -> usize {
    // widened so `i * n` cannot overflow, the quotient is at most `n`
    (i as u128 * n as u128 / ncores as u128) as usize
}

fn validate(n: usize, ncores: usize) -> Result<(), PartitionError> {
    if n == 0 {
        Err(PartitionError::NoUnits)
    } else if ncores == 0 {
        Err(PartitionError::NoWorkers)
    } else if ncores > n {
        Err(PartitionError::MoreWorkersThanUnits { n, ncores })
    } else {
        Ok(())
    }
}

/// partition of `core` out of `ncores` over `n` units
pub fn partition(n: usize, ncores: usize, core: usize) -> Result<WorkerPartition, PartitionError> {
    validate(n, ncores)?;

    if core >= ncores {
        return Err(PartitionError::CoreOutOfRange { core, ncores });
    }

    Ok(WorkerPartition {
        core,
        range: bound(core, n, ncores)..bound(core + 1, n, ncores),
    })
}

/// all partitions in core order
pub fn partitions(n: usize, ncores: usize) -> Result<Vec<WorkerPartition>, PartitionError> {
    validate(n, ncores)?;

    (0..ncores).map(|core| partition(n, ncores, core)).collect()
}
