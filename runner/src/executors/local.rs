use super::ExecutorError;
use crate::worker::{Context, WorkerLoop, WorkerReport};
use rayon::{prelude::*, ThreadPoolBuilder};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info, instrument, warn};

/// Executor that runs every partition on a local thread pool
pub struct LocalExecutor<'a> {
    context: &'a Context<'a>,
}

impl<'a> LocalExecutor<'a> {
    pub fn load(context: &'a Context<'a>) -> Self {
        Self { context }
    }

    fn thread_number(&self) -> usize {
        let config = self.context.config;

        config
            .executor
            .threads
            .unwrap_or_else(|| num_cpus::get().min(config.ncores))
            .max(1)
    }

    /// execute all partitions concurrently, each worker takes part in the barrier
    #[instrument(skip(self), level = "info")]
    pub fn execute(&mut self) -> Result<Vec<WorkerReport>, ExecutorError> {
        let ncores = self.context.config.ncores;
        let pin = self.context.config.executor.pin;
        let thread_number = self.thread_number();

        debug!("Starting thread pool with {thread_number} threads");

        let pool = ThreadPoolBuilder::new()
            .num_threads(thread_number)
            .thread_name(|index| format!("searchlight-{index}"))
            .build()?;

        // general counter to provide progress output
        let finished = AtomicUsize::new(0);

        let reports = pool.install(|| {
            (0..ncores)
                .into_par_iter()
                .map(|core| {
                    if pin {
                        pin_thread();
                    }

                    let report = WorkerLoop::new(self.context, core)
                        .and_then(|worker| worker.run())
                        .map_err(|source| ExecutorError::Worker { core, source })?;

                    info!(
                        "Done with {}/{ncores} partitions",
                        finished.fetch_add(1, Ordering::SeqCst) + 1
                    );

                    Ok(report)
                })
                .collect::<Result<Vec<_>, ExecutorError>>()
        })?;

        info!("Done with processing");

        Ok(reports)
    }
}

/// pin the current pool thread to one cpu, failures only cost performance
fn pin_thread() {
    let cores = affinity::get_core_num();

    if let Some(index) = rayon::current_thread_index() {
        match affinity::set_thread_affinity([index % cores.max(1)]) {
            Ok(()) => debug!(cpu = index % cores.max(1), "Pinned worker thread"),
            Err(error) => warn!("Failed to pin worker thread: {error}"),
        }
    }
}
