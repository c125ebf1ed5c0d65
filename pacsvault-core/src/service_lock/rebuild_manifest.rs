use std::fs;

use async_trait::async_trait;
use chrono::Utc;
use pacsvault_model::{Filesystem, QueueStudyState, ServiceLockEntry, StudyStorage};

use super::{MaintenanceContext, target_filesystem};
use crate::error::{PacsError, Result};
use crate::processing::{ItemProcessor, ItemProcessorBase};
use crate::storage::{StorageLocator, StudyManifest};

/// Regenerates the manifest of every study on a filesystem from the objects
/// actually stored there.
#[derive(Debug)]
pub struct FilesystemRebuildManifestProcessor {
    base: ItemProcessorBase,
    context: MaintenanceContext,
    locator: StorageLocator,
}

impl FilesystemRebuildManifestProcessor {
    pub fn new(context: MaintenanceContext) -> Self {
        Self {
            base: ItemProcessorBase::new(
                "FilesystemRebuildManifest",
                context.store.clone(),
                context.alerts.clone(),
            ),
            locator: StorageLocator::new(context.store.clone()),
            context,
        }
    }

    /// Lock, rebuild and release one study. Returns `false` when the study
    /// could not be locked.
    async fn rebuild_study(&self, storage: StudyStorage) -> Result<bool> {
        let store = &self.context.store;
        let id = storage.id;
        let study_uid = storage.study_uid.clone();

        let outcome = store
            .lock_study(id, QueueStudyState::ReprocessScheduled)
            .await?;
        if !outcome.acquired {
            tracing::debug!(
                target: "pacsvault::service_lock",
                %study_uid,
                reason = outcome.reason.as_deref().unwrap_or_default(),
                "study busy; manifest rebuild deferred"
            );
            return Ok(false);
        }

        let result = self.rebuild_locked(storage).await;
        store.set_queue_state(id, QueueStudyState::Idle).await?;
        if let Err(err) = result {
            tracing::warn!(
                target: "pacsvault::service_lock",
                %study_uid,
                error = %err,
                "manifest rebuild failed"
            );
            return Err(err);
        }
        Ok(true)
    }

    async fn rebuild_locked(&self, storage: StudyStorage) -> Result<()> {
        let location = self.locator.resolve(storage).await?;
        let walk = self.base.load_sop_files(&location.study_path(), false)?;

        let mut manifest = StudyManifest::new(location.study_uid());
        for path in &walk.sop_files {
            let file = match self.context.codec.load(path) {
                Ok(file) => file,
                Err(err) => {
                    tracing::warn!(
                        target: "pacsvault::service_lock",
                        path = %path.display(),
                        error = %err,
                        "skipping unreadable object"
                    );
                    continue;
                }
            };
            manifest.insert(&file, fs::metadata(path)?.len());
        }
        manifest.save(&location.manifest_path())?;

        let size = self.base.estimate_folder_size(&location)?;
        self.context
            .store
            .update_study_size(location.id(), size.div_ceil(1024) as i64)
            .await?;
        tracing::debug!(
            target: "pacsvault::service_lock",
            study_uid = %location.study_uid(),
            instances = manifest.num_instances(),
            size,
            "manifest rebuilt"
        );
        Ok(())
    }

    async fn rebuild(&self, filesystem: &Filesystem) -> Result<usize> {
        let studies = self
            .context
            .store
            .list_storage_on_filesystem(filesystem.id)
            .await?;

        let mut rebuilt = 0;
        let mut deferred = Vec::new();
        for storage in studies {
            if self.base.cancel_pending() {
                return Ok(rebuilt);
            }
            match self.rebuild_study(storage.clone()).await {
                Ok(true) => rebuilt += 1,
                Ok(false) => deferred.push(storage),
                Err(_) => {}
            }
        }

        // Studies busy during the pass get one more attempt.
        for storage in deferred {
            if self.base.cancel_pending() {
                break;
            }
            if let Ok(true) = self.rebuild_study(storage).await {
                rebuilt += 1;
            }
        }
        Ok(rebuilt)
    }
}

#[async_trait]
impl ItemProcessor<ServiceLockEntry> for FilesystemRebuildManifestProcessor {
    fn name(&self) -> &str {
        self.base.name()
    }

    async fn process(&self, entry: &ServiceLockEntry) -> Result<()> {
        let filesystem_id = target_filesystem(entry)?;
        let filesystem = self
            .context
            .store
            .get_filesystem(filesystem_id)
            .await?
            .ok_or_else(|| PacsError::NotFound(format!("filesystem {filesystem_id}")))?;

        let rebuilt = self.rebuild(&filesystem).await?;
        let now = Utc::now();
        let cancelled = self.base.cancel_pending();
        tracing::info!(
            target: "pacsvault::service_lock",
            filesystem = %filesystem.description,
            rebuilt,
            cancelled,
            "manifest rebuild pass finished"
        );
        if cancelled {
            self.base
                .unlock_service_lock(entry, true, now + self.context.maintenance.cancelled_reschedule())
                .await
        } else {
            self.base
                .unlock_service_lock(entry, false, now + self.context.maintenance.completed_reschedule())
                .await
        }
    }

    fn supports_cancel(&self) -> bool {
        true
    }

    fn cancel(&self) {
        self.base.cancel();
    }
}
