// Copyright (c) 2021-2024 Espresso Systems (espressosys.com)
// This file is part of the Reliquary repository.

// You should have received a copy of the MIT License
// along with the Reliquary repository. If not, see <https://mit-license.org/>.

//! A bounded pool for protocol work spawned off the event loops.
//!
//! Every spawned job waits for a permit before it runs, so at most `size` jobs make progress at
//! once. Jobs are tracked in a [`JoinSet`] so that shutdown can either wait for them or abort them.

use std::{future::Future, sync::Arc};

use parking_lot::Mutex;
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::error;

/// Bounded set of in-flight jobs
#[derive(Clone, Debug)]
pub struct WorkerPool {
    /// One permit per job allowed to run
    permits: Arc<Semaphore>,
    /// Spawned jobs, running or waiting for a permit
    jobs: Arc<Mutex<JoinSet<()>>>,
}

impl WorkerPool {
    /// Create a pool running at most `size` jobs at once. A size of zero is treated as one.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size.max(1))),
            jobs: Arc::new(Mutex::new(JoinSet::new())),
        }
    }

    /// Queue a job. It starts once a permit is free.
    ///
    /// Jobs queued after [`WorkerPool::shutdown`] never run.
    pub fn spawn<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let mut jobs = self.jobs.lock();
        while let Some(finished) = jobs.try_join_next() {
            log_join_error(finished);
        }
        jobs.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            job.await;
        });
    }

    /// Number of jobs that have not been reaped yet
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Wait until every queued job, including jobs queued while waiting, has finished
    pub async fn drain(&self) {
        loop {
            let mut jobs = std::mem::take(&mut *self.jobs.lock());
            if jobs.is_empty() {
                return;
            }
            while let Some(finished) = jobs.join_next().await {
                log_join_error(finished);
            }
        }
    }

    /// Refuse new work and abort everything in flight
    pub async fn shutdown(&self) {
        self.permits.close();
        let mut jobs = std::mem::take(&mut *self.jobs.lock());
        jobs.shutdown().await;
    }
}

/// Report a job that panicked. Cancellation is expected during shutdown.
fn log_join_error(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!("Worker job panicked: {e}");
        }
    }
}
