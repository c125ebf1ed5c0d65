//! Maintenance dispatching: the service-lock queue adapter, the processor
//! registry for maintenance task types and the processors themselves.

mod rebuild_manifest;
mod reinventory;

pub use rebuild_manifest::FilesystemRebuildManifestProcessor;
pub use reinventory::FilesystemReinventoryProcessor;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pacsvault_model::{FilesystemId, ServiceLockEntry, ServiceLockId, ServiceLockType};

use crate::alerts::AlertSink;
use crate::codec::SopCodec;
use crate::config::{MaintenanceConfig, StudyProcessConfig};
use crate::database::PacsStore;
use crate::error::{PacsError, Result};
use crate::processing::{
    ItemProcessor, LockingQueue, ProcessorRegistry, QueueDispatcher, QueueEntry, WorkerPool,
};

/// Dispatcher for scheduled maintenance entries.
pub type ServiceLockProcessor = QueueDispatcher<ServiceLockQueue>;

/// Bounded pool the maintenance dispatcher runs entries on.
pub type ServiceLockThreadPool = WorkerPool<ServiceLockEntry>;

impl QueueEntry for ServiceLockEntry {
    type Key = ServiceLockId;
    type Kind = ServiceLockType;

    fn key(&self) -> ServiceLockId {
        self.id
    }

    fn kind(&self) -> ServiceLockType {
        self.lock_type
    }
}

/// [`LockingQueue`] over the service-lock table.
pub struct ServiceLockQueue {
    store: Arc<dyn PacsStore>,
    failure_reschedule: chrono::Duration,
}

impl fmt::Debug for ServiceLockQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceLockQueue")
            .field("failure_reschedule", &self.failure_reschedule)
            .finish()
    }
}

impl ServiceLockQueue {
    pub fn new(store: Arc<dyn PacsStore>, failure_reschedule: chrono::Duration) -> Self {
        Self {
            store,
            failure_reschedule,
        }
    }
}

#[async_trait]
impl LockingQueue for ServiceLockQueue {
    type Entry = ServiceLockEntry;

    fn name(&self) -> &'static str {
        "service-lock"
    }

    async fn reset_orphaned(&self, processor_id: &str) -> Result<usize> {
        let reset = self.store.reset_orphaned_locks(processor_id).await?;
        for entry in &reset {
            tracing::info!(
                target: "pacsvault::service_lock",
                entry = %entry.id,
                lock_type = %entry.lock_type,
                "cleared orphaned service lock"
            );
        }
        Ok(reset.len())
    }

    async fn select_and_lock(&self, processor_id: &str) -> Result<Option<ServiceLockEntry>> {
        self.store
            .select_and_lock_due_entry(processor_id, Utc::now())
            .await
    }

    async fn release(&self, entry: &ServiceLockEntry, scheduled_time: DateTime<Utc>) -> Result<()> {
        self.store
            .unlock_entry(entry.id, entry.enabled, scheduled_time)
            .await
    }

    async fn release_failed(&self, entry: &ServiceLockEntry, _reason: &str) -> Result<()> {
        self.store
            .unlock_entry(entry.id, entry.enabled, Utc::now() + self.failure_reschedule)
            .await
    }
}

/// Shared dependencies of the maintenance processors.
#[derive(Clone)]
pub struct MaintenanceContext {
    pub store: Arc<dyn PacsStore>,
    pub alerts: Arc<dyn AlertSink>,
    pub codec: Arc<dyn SopCodec>,
    pub maintenance: MaintenanceConfig,
    pub study_process: StudyProcessConfig,
}

impl fmt::Debug for MaintenanceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MaintenanceContext")
            .field("maintenance", &self.maintenance)
            .field("study_process", &self.study_process)
            .finish()
    }
}

/// Registry with every maintenance type this server can run. Other types
/// stay unregistered and are rescheduled by the dispatcher.
pub fn maintenance_registry(context: MaintenanceContext) -> ProcessorRegistry<ServiceLockEntry> {
    let mut registry = ProcessorRegistry::new();

    let reinventory = context.clone();
    registry.register(ServiceLockType::FilesystemReinventory, move || {
        Ok(Arc::new(FilesystemReinventoryProcessor::new(reinventory.clone()))
            as Arc<dyn ItemProcessor<ServiceLockEntry>>)
    });

    let rebuild = context;
    registry.register(ServiceLockType::FilesystemRebuildManifest, move || {
        Ok(Arc::new(FilesystemRebuildManifestProcessor::new(rebuild.clone()))
            as Arc<dyn ItemProcessor<ServiceLockEntry>>)
    });

    registry
}

/// Filesystem an entry targets; maintenance types without one are rejected.
pub(crate) fn target_filesystem(entry: &ServiceLockEntry) -> Result<FilesystemId> {
    entry.filesystem_id.ok_or_else(|| {
        PacsError::NotFound(format!(
            "filesystem for {} entry {}",
            entry.lock_type, entry.id
        ))
    })
}
