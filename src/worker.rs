//! Bounded pool for running server handlers off the read loop.
//!
//! Capacity is a semaphore: a stream is only accepted once a permit has been
//! taken, so a saturated pool rejects new streams up front instead of
//! queueing unbounded work.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::error::Result;

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Tasks spawned.
    pub submitted: u64,
    /// Tasks currently running.
    pub active: u64,
    /// Tasks that returned `Ok`.
    pub completed: u64,
    /// Tasks that returned `Err` or panicked.
    pub failed: u64,
    /// Submissions refused because the pool was full.
    pub rejected: u64,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    active: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

/// A slot in the pool, reserved before the task exists.
#[derive(Debug)]
pub struct WorkerPermit {
    _permit: OwnedSemaphorePermit,
}

/// Semaphore-bounded task spawner with liveness and error counters.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    counters: Arc<Counters>,
    capacity: usize,
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            counters: Arc::new(Counters::default()),
            capacity,
        }
    }

    /// Reserve a slot without waiting. `None` (and a rejection count) when full.
    pub fn try_reserve(&self) -> Option<WorkerPermit> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Some(WorkerPermit { _permit: permit }),
            Err(_) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Run `task` on the runtime, holding `permit` until it finishes.
    pub fn spawn<F>(&self, permit: WorkerPermit, task: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let counters = self.counters.clone();
        counters.submitted.fetch_add(1, Ordering::Relaxed);
        counters.active.fetch_add(1, Ordering::Relaxed);

        let inner = tokio::spawn(task);
        tokio::spawn(async move {
            // Permit is held until the task completes
            let _permit = permit;
            let outcome = inner.await;
            counters.active.fetch_sub(1, Ordering::Relaxed);
            match outcome {
                Ok(Ok(())) => {
                    counters.completed.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(e)) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(error = %e, "worker task failed");
                }
                Err(e) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(error = %e, "worker task panicked");
                }
            }
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free slots.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            active: self.counters.active.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StreamwireError;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_counters_track_outcomes() {
        let pool = WorkerPool::new(4);

        let ok = pool.spawn(pool.try_reserve().unwrap(), async { Ok(()) });
        let failed = pool.spawn(pool.try_reserve().unwrap(), async {
            Err(StreamwireError::Cancelled)
        });
        ok.await.unwrap();
        failed.await.unwrap();

        let stats = pool.stats();
        assert_eq!(stats.submitted, 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.active, 0);
        assert_eq!(pool.available(), 4);
    }

    #[tokio::test]
    async fn test_saturated_pool_rejects() {
        let pool = WorkerPool::new(1);
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let running = pool.spawn(pool.try_reserve().unwrap(), async move {
            let _ = release_rx.await;
            Ok(())
        });

        assert!(pool.try_reserve().is_none());
        assert_eq!(pool.stats().rejected, 1);
        assert_eq!(pool.stats().active, 1);

        release_tx.send(()).unwrap();
        running.await.unwrap();
        assert!(pool.try_reserve().is_some());
    }
}
