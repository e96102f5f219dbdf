use std::time::Instant;

use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, info};

use crate::consts::WORKER_CPU_DIVISOR;
use crate::error::{CnmfError, Result};

/// Default worker count: half the available CPUs, at least one.
pub fn default_worker_count() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cpus / WORKER_CPU_DIVISOR).max(1)
}

/// A bounded rayon pool owned by one extraction run.
///
/// Started right before the first numeric stage and torn down when the
/// handle is dropped, on success and on error alike. Work submitted through
/// [`WorkerPool::install`] (including nested `par_iter` calls) runs on this
/// pool's threads and never on the global rayon pool.
pub struct WorkerPool {
    pool: ThreadPool,
    workers: usize,
    started: Instant,
}

impl WorkerPool {
    pub fn start(workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(CnmfError::InvalidParameter(
                "worker pool needs at least one worker".into(),
            ));
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("cnmf-worker-{i}"))
            .build()
            .map_err(|e| CnmfError::WorkerPool(e.to_string()))?;
        info!(workers, "Worker pool started");
        Ok(Self {
            pool,
            workers,
            started: Instant::now(),
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `op` inside the pool.
    pub fn install<R, F>(&self, op: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(op)
    }

    /// Shut the pool down explicitly. Equivalent to dropping the handle.
    pub fn stop(self) {}
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        debug!(
            workers = self.workers,
            alive_s = self.started.elapsed().as_secs_f64(),
            "Worker pool stopped"
        );
    }
}
