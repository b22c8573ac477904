use super::ExecutorError;
use crate::worker::{Context, WorkerLoop, WorkerReport};
use tracing::instrument;

/// Runs exactly one partition in the current process
pub struct SingleExecutor<'a> {
    context: &'a Context<'a>,
    core: usize,
}

impl<'a> SingleExecutor<'a> {
    pub fn load(context: &'a Context<'a>, core: usize) -> Self {
        Self { context, core }
    }

    #[instrument(skip(self), fields(core = self.core), level = "info")]
    pub fn execute(&mut self) -> Result<WorkerReport, ExecutorError> {
        WorkerLoop::new(self.context, self.core)
            .and_then(|worker| worker.run())
            .map_err(|source| ExecutorError::Worker {
                core: self.core,
                source,
            })
    }
}
