use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio_util::task::TaskTracker;

use super::dispatcher::{ItemProcessor, QueueEntry};
use crate::error::{PacsError, Result};

struct InFlight<E: QueueEntry> {
    entry: E,
    processor: Arc<dyn ItemProcessor<E>>,
    started_at: Instant,
}

type Registry<E> = Arc<Mutex<HashMap<<E as QueueEntry>::Key, InFlight<E>>>>;

fn lock<E: QueueEntry>(
    registry: &Mutex<HashMap<E::Key, InFlight<E>>>,
) -> MutexGuard<'_, HashMap<E::Key, InFlight<E>>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes an entry from the in-flight registry when its job ends, including
/// by panic.
struct InFlightGuard<E: QueueEntry> {
    registry: Registry<E>,
    key: E::Key,
}

impl<E: QueueEntry> Drop for InFlightGuard<E> {
    fn drop(&mut self) {
        lock::<E>(&self.registry).remove(&self.key);
    }
}

/// Runs at most `concurrency` jobs at once on the tokio runtime and keeps
/// track of what each slot is doing.
pub struct WorkerPool<E: QueueEntry> {
    name: String,
    concurrency: usize,
    in_flight: Registry<E>,
    tracker: TaskTracker,
}

impl<E: QueueEntry> fmt::Debug for WorkerPool<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let active = self
            .in_flight
            .try_lock()
            .map(|guard| guard.len())
            .unwrap_or_default();
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("concurrency", &self.concurrency)
            .field("active", &active)
            .field("closed", &self.tracker.is_closed())
            .finish()
    }
}

impl<E: QueueEntry> WorkerPool<E> {
    pub fn new(name: impl Into<String>, concurrency: usize) -> Self {
        Self {
            name: name.into(),
            concurrency: concurrency.max(1),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            tracker: TaskTracker::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn active_count(&self) -> usize {
        lock::<E>(&self.in_flight).len()
    }

    pub fn can_queue_item(&self) -> bool {
        !self.tracker.is_closed() && self.active_count() < self.concurrency
    }

    /// Entries currently running, oldest first.
    pub fn in_flight(&self) -> Vec<(E, Duration)> {
        let guard = lock::<E>(&self.in_flight);
        let mut running: Vec<_> = guard
            .values()
            .map(|slot| (slot.entry.clone(), slot.started_at.elapsed()))
            .collect();
        running.sort_by(|a, b| b.1.cmp(&a.1));
        running
    }

    /// Register `entry` as in flight and spawn `job` for it.
    ///
    /// Refuses the work when every slot is taken or the pool was stopped.
    pub fn enqueue<F>(&self, processor: Arc<dyn ItemProcessor<E>>, entry: E, job: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.tracker.is_closed() {
            return Err(PacsError::Cancelled(format!("pool {} is stopped", self.name)));
        }

        let key = entry.key();
        {
            let mut guard = lock::<E>(&self.in_flight);
            if guard.len() >= self.concurrency {
                return Err(PacsError::PoolSaturated {
                    active: guard.len(),
                    limit: self.concurrency,
                });
            }
            if guard.contains_key(&key) {
                return Err(PacsError::Internal(format!(
                    "{key} is already in flight in pool {}",
                    self.name
                )));
            }
            guard.insert(
                key,
                InFlight {
                    entry,
                    processor,
                    started_at: Instant::now(),
                },
            );
        }

        let guard = InFlightGuard {
            registry: Arc::clone(&self.in_flight),
            key,
        };
        self.tracker.spawn(async move {
            let _guard = guard;
            job.await;
        });
        Ok(())
    }

    /// Ask every cancellable in-flight processor to stop, refuse further work
    /// and wait up to `drain` for running jobs. Returns whether the pool
    /// drained.
    pub async fn stop(&self, drain: Option<Duration>) -> bool {
        let processors: Vec<_> = lock::<E>(&self.in_flight)
            .values()
            .map(|slot| (slot.entry.key(), Arc::clone(&slot.processor)))
            .collect();
        for (key, processor) in processors {
            if processor.supports_cancel() {
                tracing::info!(
                    target: "pacsvault::pool",
                    pool = %self.name,
                    entry = %key,
                    "cancelling in-flight processor"
                );
                processor.cancel();
            }
        }

        self.tracker.close();
        let Some(drain) = drain else {
            return self.tracker.is_empty();
        };
        match tokio::time::timeout(drain, self.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(
                    target: "pacsvault::pool",
                    pool = %self.name,
                    remaining = self.active_count(),
                    "timed out waiting for in-flight work"
                );
                false
            }
        }
    }
}
