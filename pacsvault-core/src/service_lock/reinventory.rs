use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use pacsvault_model::{
    Filesystem, QueueStudyState, ServerPartition, ServiceLockEntry, StudyStatus, StudyStorage,
    TransferSyntax, WorkQueueItem, WorkQueueType, WorkQueueUid,
};

use super::{MaintenanceContext, target_filesystem};
use crate::alerts::{Alert, AlertCode};
use crate::error::{PacsError, Result};
use crate::processing::{ItemProcessor, ItemProcessorBase};
use crate::storage::{
    DELETED_FOLDER_SUFFIX, RECONCILE_FOLDER, StudyStorageLocation, delete_directory_if_empty,
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct ReinventoryStats {
    studies_seen: usize,
    studies_queued: usize,
    objects_queued: usize,
    folders_removed: usize,
}

/// Rediscovers studies on a filesystem that the store no longer knows about
/// and queues their objects for ingestion.
#[derive(Debug)]
pub struct FilesystemReinventoryProcessor {
    base: ItemProcessorBase,
    context: MaintenanceContext,
}

impl FilesystemReinventoryProcessor {
    pub fn new(context: MaintenanceContext) -> Self {
        Self {
            base: ItemProcessorBase::new(
                "FilesystemReinventory",
                context.store.clone(),
                context.alerts.clone(),
            ),
            context,
        }
    }

    async fn reinventory(&self, filesystem: &Filesystem) -> Result<ReinventoryStats> {
        let mut stats = ReinventoryStats::default();
        for partition in self.context.store.list_partitions().await? {
            if self.base.cancel_pending() {
                break;
            }
            let root = filesystem.path.join(&partition.partition_folder);
            if !root.is_dir() {
                continue;
            }
            for date_dir in subdirectories(&root)? {
                if self.base.cancel_pending() {
                    break;
                }
                let Some(date_folder) = folder_name(&date_dir) else {
                    continue;
                };
                if date_folder == RECONCILE_FOLDER || date_folder.ends_with(DELETED_FOLDER_SUFFIX) {
                    continue;
                }
                for study_dir in subdirectories(&date_dir)? {
                    if self.base.cancel_pending() {
                        break;
                    }
                    stats.studies_seen += 1;
                    if let Err(err) = self
                        .reinventory_study(filesystem, &partition, &date_folder, &study_dir, &mut stats)
                        .await
                    {
                        tracing::warn!(
                            target: "pacsvault::service_lock",
                            path = %study_dir.display(),
                            error = %err,
                            "failed to reinventory study folder"
                        );
                        self.base.alerts().raise(Alert::application_error(
                            self.base.name(),
                            AlertCode::ReinventoryFailed,
                            format!("Unable to reinventory {}: {err}", study_dir.display()),
                        ));
                    }
                }
                if delete_directory_if_empty(&date_dir)? {
                    stats.folders_removed += 1;
                }
            }
        }
        Ok(stats)
    }

    async fn reinventory_study(
        &self,
        filesystem: &Filesystem,
        partition: &ServerPartition,
        date_folder: &str,
        study_dir: &Path,
        stats: &mut ReinventoryStats,
    ) -> Result<()> {
        let Some(study_uid) = folder_name(study_dir) else {
            return Ok(());
        };
        let store = &self.context.store;

        let storage = match store.find_storage(partition.id, &study_uid).await? {
            Some(storage) => {
                if store.load_study_record(storage.id).await?.is_some() {
                    return Ok(());
                }
                storage
            }
            None => {
                let walk = self.base.load_sop_files(study_dir, false)?;
                let Some(first) = walk.sop_files.first() else {
                    if delete_directory_if_empty(study_dir)? {
                        stats.folders_removed += 1;
                    }
                    return Ok(());
                };
                let transfer_syntax = self.infer_transfer_syntax(first);
                let mut storage =
                    StudyStorage::new(partition.id, filesystem.id, date_folder, &study_uid);
                storage.transfer_syntax = transfer_syntax;
                storage.status = StudyStatus::for_transfer_syntax(transfer_syntax);
                store.insert_storage(&storage).await?;
                tracing::info!(
                    target: "pacsvault::service_lock",
                    study_uid = %study_uid,
                    partition = %partition.ae_title,
                    "discovered unknown study"
                );
                storage
            }
        };

        let walk = self.base.load_sop_files(study_dir, true)?;
        if walk.cancelled {
            return Ok(());
        }
        if walk.sop_files.is_empty() {
            if delete_directory_if_empty(study_dir)? {
                stats.folders_removed += 1;
            }
            return Ok(());
        }

        let outcome = store
            .lock_study(storage.id, QueueStudyState::ProcessingScheduled)
            .await?;
        if !outcome.acquired {
            tracing::info!(
                target: "pacsvault::service_lock",
                study_uid = %study_uid,
                reason = outcome.reason.as_deref().unwrap_or_default(),
                "study busy; leaving it for the next reinventory"
            );
            return Ok(());
        }

        let location = StudyStorageLocation::new(storage, filesystem.clone(), partition.clone());
        remove_stale_manifest(&location)?;

        let item = WorkQueueItem::new(
            partition.id,
            location.id(),
            WorkQueueType::StudyProcess,
            self.context.study_process.expiration(),
        );
        store.insert_item(&item).await?;
        for path in &walk.sop_files {
            let (Some(series_uid), Some(sop_uid)) = (
                path.parent().and_then(folder_name),
                path.file_stem().map(|stem| stem.to_string_lossy().into_owned()),
            ) else {
                continue;
            };
            store
                .insert_uid(&WorkQueueUid::new(item.id, series_uid, sop_uid))
                .await?;
            stats.objects_queued += 1;
        }
        stats.studies_queued += 1;
        Ok(())
    }

    fn infer_transfer_syntax(&self, path: &Path) -> TransferSyntax {
        match self.context.codec.load(path) {
            Ok(file) => file.transfer_syntax,
            Err(err) => {
                tracing::debug!(
                    target: "pacsvault::service_lock",
                    path = %path.display(),
                    error = %err,
                    "unable to read transfer syntax; assuming default"
                );
                TransferSyntax::default()
            }
        }
    }
}

#[async_trait]
impl ItemProcessor<ServiceLockEntry> for FilesystemReinventoryProcessor {
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

        let stats = self.reinventory(&filesystem).await?;
        let now = Utc::now();
        if self.base.cancel_pending() {
            tracing::info!(
                target: "pacsvault::service_lock",
                filesystem = %filesystem.description,
                ?stats,
                "reinventory cancelled; rescheduling"
            );
            self.base
                .unlock_service_lock(entry, true, now + self.context.maintenance.cancelled_reschedule())
                .await
        } else {
            tracing::info!(
                target: "pacsvault::service_lock",
                filesystem = %filesystem.description,
                ?stats,
                "reinventory complete"
            );
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

fn subdirectories(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn folder_name(path: &Path) -> Option<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
}

fn remove_stale_manifest(location: &StudyStorageLocation) -> Result<()> {
    for path in [location.manifest_path(), location.compressed_manifest_path()] {
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}
