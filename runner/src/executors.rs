mod local;
mod single;

use crate::{
    config::ConfigErrors,
    worker::{Context, WorkerError, WorkerReport},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Worker {core} failed: {source}")]
    Worker { core: usize, source: WorkerError },
    #[error("Failed to build thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// How the workers of a job are started
///
/// `single` runs one partition in this process, the way a batch system would
/// start one process per core. `local` runs every partition on a thread pool,
/// still coordinating only through the run directory.
pub enum Executors<'a> {
    Local(local::LocalExecutor<'a>),
    Single(single::SingleExecutor<'a>),
}

impl<'a> Executors<'a> {
    /// an explicit `core` always selects the single executor
    pub fn load(context: &'a Context<'a>, core: Option<usize>) -> Result<Self, ConfigErrors> {
        if let Some(core) = core {
            return Ok(Self::Single(single::SingleExecutor::load(context, core)));
        }

        match context.config.executor.name.as_str() {
            "local" => Ok(Self::Local(local::LocalExecutor::load(context))),
            "single" => Ok(Self::Single(single::SingleExecutor::load(context, 0))),
            _ => Err(ConfigErrors::UnsupportedExecutor(
                context.config.executor.name.clone(),
            )),
        }
    }

    pub fn execute(&mut self) -> Result<Vec<WorkerReport>, ExecutorError> {
        match self {
            Self::Local(executor) => executor.execute(),
            Self::Single(executor) => executor.execute().map(|report| vec![report]),
        }
    }
}
