use std::any::{Any, type_name};
use std::fmt;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::pool::WorkerPool;
use super::registry::ProcessorRegistry;
use crate::alerts::{Alert, AlertCode, AlertSink};
use crate::config::DispatcherConfig;
use crate::error::Result;

/// A row a [`QueueDispatcher`] can lock and hand to a processor.
pub trait QueueEntry: Clone + fmt::Debug + Send + Sync + 'static {
    type Key: Copy + Eq + Hash + fmt::Display + fmt::Debug + Send + Sync + 'static;
    type Kind: Copy + Eq + Hash + fmt::Display + fmt::Debug + Send + Sync + 'static;

    fn key(&self) -> Self::Key;

    /// Tag used to look up the processor.
    fn kind(&self) -> Self::Kind;
}

/// Store-side operations of a lockable queue.
#[async_trait]
pub trait LockingQueue: Send + Sync + 'static {
    type Entry: QueueEntry;

    fn name(&self) -> &'static str;

    /// Return to the queue everything `processor_id` still holds from a
    /// previous run. Returns the number of entries reset.
    async fn reset_orphaned(&self, processor_id: &str) -> Result<usize>;

    async fn select_and_lock(&self, processor_id: &str) -> Result<Option<Self::Entry>>;

    /// Hand back an entry that was never processed.
    async fn release(&self, entry: &Self::Entry, scheduled_time: DateTime<Utc>) -> Result<()>;

    /// Hand back an entry whose processor failed.
    async fn release_failed(&self, entry: &Self::Entry, reason: &str) -> Result<()>;
}

/// Work done for one entry.
#[async_trait]
pub trait ItemProcessor<E>: Send + Sync {
    fn name(&self) -> &str;

    async fn process(&self, entry: &E) -> Result<()>;

    fn supports_cancel(&self) -> bool {
        false
    }

    /// Request cooperative cancellation; a no-op for processors that cannot stop early.
    fn cancel(&self) {}
}

/// Poll loop over a [`LockingQueue`]: lock due entries, run them on a
/// bounded [`WorkerPool`] and put them back when processing fails.
pub struct QueueDispatcher<Q: LockingQueue> {
    queue: Arc<Q>,
    registry: Arc<ProcessorRegistry<Q::Entry>>,
    pool: Arc<WorkerPool<Q::Entry>>,
    alerts: Arc<dyn AlertSink>,
    config: DispatcherConfig,
    stop: CancellationToken,
    wake: Arc<Notify>,
}

impl<Q: LockingQueue> fmt::Debug for QueueDispatcher<Q> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueDispatcher")
            .field("queue", &self.queue.name())
            .field("queue_type", &type_name::<Q>())
            .field("registry", &self.registry)
            .field("pool", &self.pool)
            .field("config", &self.config)
            .field("stopped", &self.stop.is_cancelled())
            .finish()
    }
}

impl<Q: LockingQueue> QueueDispatcher<Q> {
    pub fn new(
        queue: Arc<Q>,
        registry: ProcessorRegistry<Q::Entry>,
        alerts: Arc<dyn AlertSink>,
        config: DispatcherConfig,
    ) -> Self {
        let pool = WorkerPool::new(queue.name(), config.concurrency);
        Self {
            queue,
            registry: Arc::new(registry),
            pool: Arc::new(pool),
            alerts,
            config,
            stop: CancellationToken::new(),
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn pool(&self) -> &Arc<WorkerPool<Q::Entry>> {
        &self.pool
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Ask the loop to exit; `run` returns once the pool is stopped.
    pub fn request_stop(&self) {
        self.stop.cancel();
    }

    /// Run until [`request_stop`](Self::request_stop) is called.
    pub async fn run(&self) {
        let processor_id = self.config.processor_id.as_str();
        self.recover(processor_id).await;

        tracing::info!(
            target: "pacsvault::dispatch",
            queue = self.queue.name(),
            processor_id,
            concurrency = self.pool.concurrency(),
            "dispatcher started"
        );

        while !self.stop.is_cancelled() {
            if !self.pool.can_queue_item() {
                self.pause(self.config.saturated_poll()).await;
                continue;
            }

            match self.queue.select_and_lock(processor_id).await {
                Ok(Some(entry)) => self.dispatch(entry).await,
                Ok(None) => self.pause(self.config.idle_poll()).await,
                Err(err) => {
                    tracing::error!(
                        target: "pacsvault::dispatch",
                        queue = self.queue.name(),
                        error = %err,
                        "failed to select a due entry"
                    );
                    self.pause(self.config.error_retry()).await;
                }
            }
        }

        let drained = self.pool.stop(self.config.drain_timeout()).await;
        tracing::info!(
            target: "pacsvault::dispatch",
            queue = self.queue.name(),
            drained,
            "dispatcher stopped"
        );
    }

    async fn recover(&self, processor_id: &str) {
        match self.queue.reset_orphaned(processor_id).await {
            Ok(0) => {}
            Ok(count) => tracing::warn!(
                target: "pacsvault::dispatch",
                queue = self.queue.name(),
                processor_id,
                count,
                "reset entries left locked by a previous run"
            ),
            Err(err) => tracing::error!(
                target: "pacsvault::dispatch",
                queue = self.queue.name(),
                processor_id,
                error = %err,
                "failed to reset orphaned locks"
            ),
        }
    }

    /// Sleep for `duration`, waking early on stop or when a job completes.
    async fn pause(&self, duration: Duration) {
        tokio::select! {
            _ = self.stop.cancelled() => {}
            _ = self.wake.notified() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }

    async fn dispatch(&self, entry: Q::Entry) {
        let kind = entry.kind();
        let processor = match self.registry.create(kind) {
            Some(Ok(processor)) => processor,
            Some(Err(err)) => {
                tracing::error!(
                    target: "pacsvault::dispatch",
                    queue = self.queue.name(),
                    entry = %entry.key(),
                    %kind,
                    error = %err,
                    "failed to create processor"
                );
                self.alerts.raise(Alert::application_error(
                    self.queue.name(),
                    AlertCode::ProcessorFailed,
                    format!("Unable to create processor for {kind}: {err}"),
                ));
                self.release_unprocessed(&entry).await;
                return;
            }
            None => {
                tracing::warn!(
                    target: "pacsvault::dispatch",
                    queue = self.queue.name(),
                    entry = %entry.key(),
                    %kind,
                    "no processor registered"
                );
                self.alerts.raise(Alert::application_error(
                    self.queue.name(),
                    AlertCode::UnknownProcessor,
                    format!("No processor registered for {kind}"),
                ));
                self.release_unprocessed(&entry).await;
                return;
            }
        };

        let job = CompletionJob {
            queue: Arc::clone(&self.queue),
            alerts: Arc::clone(&self.alerts),
            stop: self.stop.clone(),
            wake: Arc::clone(&self.wake),
            release_retry: self.config.release_retry(),
        }
        .run(Arc::clone(&processor), entry.clone());

        if let Err(err) = self.pool.enqueue(processor, entry.clone(), job) {
            tracing::warn!(
                target: "pacsvault::dispatch",
                queue = self.queue.name(),
                entry = %entry.key(),
                error = %err,
                "pool refused entry"
            );
            self.release_unprocessed(&entry).await;
        }
    }

    async fn release_unprocessed(&self, entry: &Q::Entry) {
        let scheduled_time = Utc::now() + self.config.unregistered_reschedule();
        if let Err(err) = self.queue.release(entry, scheduled_time).await {
            tracing::error!(
                target: "pacsvault::dispatch",
                queue = self.queue.name(),
                entry = %entry.key(),
                error = %err,
                "failed to release entry"
            );
        }
    }
}

/// Everything a spawned job needs once the dispatcher has moved on.
struct CompletionJob<Q: LockingQueue> {
    queue: Arc<Q>,
    alerts: Arc<dyn AlertSink>,
    stop: CancellationToken,
    wake: Arc<Notify>,
    release_retry: Duration,
}

impl<Q: LockingQueue> CompletionJob<Q> {
    async fn run(self, processor: Arc<dyn ItemProcessor<Q::Entry>>, entry: Q::Entry) {
        let outcome = AssertUnwindSafe(processor.process(&entry))
            .catch_unwind()
            .await;
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(format!("{}: {err}", err.kind())),
            Err(panic) => Some(format!("panic: {}", panic_message(panic.as_ref()))),
        };

        if let Some(reason) = failure {
            tracing::error!(
                target: "pacsvault::dispatch",
                queue = self.queue.name(),
                processor = processor.name(),
                entry = %entry.key(),
                kind = %entry.kind(),
                %reason,
                "processor failed"
            );
            self.alerts.raise(Alert::application_error(
                processor.name(),
                AlertCode::ProcessorFailed,
                format!("Failure processing {} {}: {reason}", entry.kind(), entry.key()),
            ));
            self.release_failed(&entry, &reason).await;
        }

        drop(processor);
        self.wake.notify_one();
    }

    async fn release_failed(&self, entry: &Q::Entry, reason: &str) {
        loop {
            match self.queue.release_failed(entry, reason).await {
                Ok(()) => return,
                Err(err) => tracing::warn!(
                    target: "pacsvault::dispatch",
                    queue = self.queue.name(),
                    entry = %entry.key(),
                    error = %err,
                    "failed to release entry after failure; retrying"
                ),
            }
            tokio::select! {
                _ = self.stop.cancelled() => {
                    tracing::warn!(
                        target: "pacsvault::dispatch",
                        queue = self.queue.name(),
                        entry = %entry.key(),
                        "stop requested; lock left for startup recovery"
                    );
                    return;
                }
                _ = tokio::time::sleep(self.release_retry) => {}
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
