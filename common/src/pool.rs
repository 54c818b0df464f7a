//! Worker pools with explicit lifetimes.
//!
//! Pools are owned by whoever creates them. `shutdown` cancels every worker
//! and waits for them; dropping a pool aborts whatever is still running.
//! Work submitted to a pool must therefore leave shared state consistent at
//! every await point.

use crate::error::{Result, ShuffleError};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Builds the pools used by the tracker, the split servers and the reducers.
pub struct ThreadPoolFactory;

impl ThreadPoolFactory {
    /// A pool running at most `workers` jobs at once. Extra jobs queue.
    pub fn new_fixed_pool<T: Send + 'static>(name: &str, workers: usize) -> WorkerPool<T> {
        WorkerPool::new(name, Some(workers.max(1)), CancellationToken::new())
    }

    /// An elastic pool, one worker per submitted job.
    pub fn new_cached_pool<T: Send + 'static>(name: &str) -> WorkerPool<T> {
        WorkerPool::new(name, None, CancellationToken::new())
    }

    /// A fixed pool cancelled together with `parent`.
    pub fn new_child_fixed_pool<T: Send + 'static>(
        name: &str,
        workers: usize,
        parent: &CancellationToken,
    ) -> WorkerPool<T> {
        WorkerPool::new(name, Some(workers.max(1)), parent.child_token())
    }

    /// A cached pool cancelled together with `parent`.
    pub fn new_child_cached_pool<T: Send + 'static>(
        name: &str,
        parent: &CancellationToken,
    ) -> WorkerPool<T> {
        WorkerPool::new(name, None, parent.child_token())
    }
}

/// A set of spawned jobs sharing one cancellation token.
pub struct WorkerPool<T> {
    name: String,
    permits: Option<Arc<Semaphore>>,
    tasks: JoinSet<Option<T>>,
    cancel: CancellationToken,
}

impl<T: Send + 'static> WorkerPool<T> {
    fn new(name: &str, workers: Option<usize>, cancel: CancellationToken) -> Self {
        Self {
            name: name.to_string(),
            permits: workers.map(|n| Arc::new(Semaphore::new(n))),
            tasks: JoinSet::new(),
            cancel,
        }
    }

    /// Number of jobs spawned and not yet reaped.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Submit a job. On a fixed pool the job waits for a free worker first.
    pub fn spawn<F>(&mut self, job: F)
    where
        F: Future<Output = T> + Send + 'static,
    {
        let permits = self.permits.clone();
        let cancel = self.cancel.clone();
        self.tasks.spawn(async move {
            let _permit = match permits {
                Some(permits) => tokio::select! {
                    _ = cancel.cancelled() => return None,
                    permit = permits.acquire_owned() => Some(permit.ok()?),
                },
                None => None,
            };
            tokio::select! {
                _ = cancel.cancelled() => None,
                out = job => Some(out),
            }
        });
    }

    /// Drop bookkeeping for jobs that already finished, returning their outputs.
    pub fn reap(&mut self) -> Vec<T> {
        let mut done = Vec::new();
        while let Some(joined) = self.tasks.try_join_next() {
            match joined {
                Ok(Some(out)) => done.push(out),
                Ok(None) => {}
                Err(e) => warn!("worker in pool {} ended abnormally: {}", self.name, e),
            }
        }
        done
    }

    /// Wait for every job and collect the outputs of those that ran to the end.
    ///
    /// A panicking job is reported as an internal error once all other jobs
    /// have been joined.
    pub async fn join(&mut self) -> Result<Vec<T>> {
        let mut outputs = Vec::with_capacity(self.tasks.len());
        let mut failure = None;
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(Some(out)) => outputs.push(out),
                Ok(None) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    warn!("worker in pool {} panicked: {}", self.name, e);
                    failure.get_or_insert_with(|| {
                        ShuffleError::internal_error(format!(
                            "worker in pool {} panicked: {}",
                            self.name, e
                        ))
                    });
                }
            }
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(outputs),
        }
    }

    /// Wait for the next job to run to the end.
    ///
    /// Cancelled jobs are skipped. Returns `None` once the pool is empty.
    pub async fn join_next(&mut self) -> Option<Result<T>> {
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(Some(out)) => return Some(Ok(out)),
                Ok(None) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    return Some(Err(ShuffleError::internal_error(format!(
                        "worker in pool {} panicked: {}",
                        self.name, e
                    ))));
                }
            }
        }
        None
    }

    /// Cancel every job and wait until all of them have stopped.
    pub async fn shutdown(mut self) {
        debug!("shutting down pool {} ({} jobs)", self.name, self.tasks.len());
        self.cancel.cancel();
        while self.tasks.join_next().await.is_some() {}
    }
}
