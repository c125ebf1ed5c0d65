//! Ingestion work items: the queue adapter, item lifecycle and the study
//! ingestion processor.

pub mod lifecycle;
pub mod study_process;

pub use lifecycle::{FailureType, ItemLifecycle, PostProcessing};
pub use study_process::{StudyProcessItemProcessor, StudyProcessStatistics};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pacsvault_model::{WorkQueueId, WorkQueueItem, WorkQueueStatus, WorkQueueType};

use crate::alerts::AlertSink;
use crate::codec::SopCodec;
use crate::config::StudyProcessConfig;
use crate::database::PacsStore;
use crate::error::Result;
use crate::processing::{ItemProcessor, LockingQueue, ProcessorRegistry, QueueDispatcher, QueueEntry};
use crate::rules::RulesEngine;

/// Dispatcher for ingestion work items.
pub type WorkQueueDispatcher = QueueDispatcher<WorkQueueQueue>;

impl QueueEntry for WorkQueueItem {
    type Key = WorkQueueId;
    type Kind = WorkQueueType;

    fn key(&self) -> WorkQueueId {
        self.id
    }

    fn kind(&self) -> WorkQueueType {
        self.work_queue_type
    }
}

/// [`LockingQueue`] over the work-queue table.
pub struct WorkQueueQueue {
    store: Arc<dyn PacsStore>,
    lifecycle: ItemLifecycle,
}

impl fmt::Debug for WorkQueueQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueueQueue")
            .field("lifecycle", &self.lifecycle)
            .finish()
    }
}

impl WorkQueueQueue {
    pub fn new(store: Arc<dyn PacsStore>, config: StudyProcessConfig) -> Self {
        Self {
            lifecycle: ItemLifecycle::new(store.clone(), config),
            store,
        }
    }

    /// Latest copy of the item; processors may have changed it since it was locked.
    async fn current(&self, entry: &WorkQueueItem) -> Result<Option<WorkQueueItem>> {
        self.store.get_item(entry.id).await
    }
}

#[async_trait]
impl LockingQueue for WorkQueueQueue {
    type Entry = WorkQueueItem;

    fn name(&self) -> &'static str {
        "work-queue"
    }

    async fn reset_orphaned(&self, processor_id: &str) -> Result<usize> {
        let reset = self
            .store
            .reset_orphaned_items(processor_id, self.lifecycle.config().max_failure_count)
            .await?;
        for item in &reset {
            tracing::info!(
                target: "pacsvault::work_queue",
                item = %item.id,
                status = %item.status,
                "reset orphaned work item"
            );
        }
        Ok(reset.len())
    }

    async fn select_and_lock(&self, processor_id: &str) -> Result<Option<WorkQueueItem>> {
        self.store
            .select_and_lock_due_item(processor_id, Utc::now())
            .await
    }

    async fn release(&self, entry: &WorkQueueItem, scheduled_time: DateTime<Utc>) -> Result<()> {
        let Some(mut item) = self.current(entry).await? else {
            return Ok(());
        };
        item.status = WorkQueueStatus::Pending;
        item.processor_id = None;
        item.scheduled_time = scheduled_time;
        self.store.save_item(&item).await
    }

    async fn release_failed(&self, entry: &WorkQueueItem, reason: &str) -> Result<()> {
        let Some(mut item) = self.current(entry).await? else {
            return Ok(());
        };
        if item.status != WorkQueueStatus::InProgress {
            // The processor already moved the item on before failing.
            return Ok(());
        }
        self.lifecycle
            .fail(&mut item, FailureType::NonFatal, reason)
            .await
    }
}

/// Shared dependencies of ingestion processors.
#[derive(Clone)]
pub struct IngestionContext {
    pub store: Arc<dyn PacsStore>,
    pub alerts: Arc<dyn AlertSink>,
    pub codec: Arc<dyn SopCodec>,
    pub rules: Arc<dyn RulesEngine>,
    pub config: StudyProcessConfig,
}

impl fmt::Debug for IngestionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngestionContext")
            .field("config", &self.config)
            .finish()
    }
}

/// Registry with every work-item type this server can process.
pub fn work_queue_registry(context: IngestionContext) -> ProcessorRegistry<WorkQueueItem> {
    let mut registry = ProcessorRegistry::new();
    registry.register(WorkQueueType::StudyProcess, move || {
        Ok(Arc::new(StudyProcessItemProcessor::new(context.clone()))
            as Arc<dyn ItemProcessor<WorkQueueItem>>)
    });
    registry
}
