//! Resolution of objects received again for a study that already stores them.

use std::fmt;
use std::path::Path;

use chrono::Utc;
use pacsvault_model::{
    AttributeDifference, DifferenceKind, DuplicatePolicy, ReconcileReason, ReconcileUid,
    WorkQueueUid,
};

use super::{PreProcessOutcome, StudyRun, instance_record};
use crate::alerts::{Alert, AlertCode};
use crate::codec::{SopFile, tags};
use crate::command::{
    CommandProcessor, DeleteFileCommand, DeleteWorkQueueUidCommand, InsertInstanceCommand,
    InsertManifestEntryCommand, InsertReconcileEntryCommand, RenameFileCommand,
    UpdateInstanceCommand,
};
use crate::database::ports::ReconcileEntryDraft;
use crate::error::{PacsError, Result};
use crate::storage::delete_if_empty_up_to;

/// What happened to a duplicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateAction {
    /// Identical to the stored copy, or older than it; dropped.
    Delete,
    /// Parked for an operator.
    Reconcile,
    /// Taken into the study in place of, or beside, the stored copy.
    Accept,
    /// Replaced the stored copy and rebuilt its database rows.
    AcceptAndResync,
}

impl fmt::Display for DuplicateAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DuplicateAction::Delete => "delete",
            DuplicateAction::Reconcile => "reconcile",
            DuplicateAction::Accept => "accept",
            DuplicateAction::AcceptAndResync => "accept-and-resync",
        };
        f.write_str(name)
    }
}

impl StudyRun<'_> {
    pub(super) async fn process_duplicate(&mut self, uid: &WorkQueueUid) -> Result<()> {
        let dup_path = self.location.duplicate_sop_path(uid);
        let mut dup = self.context().codec.load(&dup_path)?;

        match self
            .preprocessor
            .apply(&self.location, &self.item, uid, &mut dup)
            .await?
        {
            PreProcessOutcome::Discard { reason } => {
                tracing::info!(
                    target: "pacsvault::study_process",
                    sop_uid = %uid.sop_uid,
                    %reason,
                    "duplicate discarded"
                );
                self.stats.objects_discarded += 1;
                return self.context().store.delete_uid(uid.id).await;
            }
            PreProcessOutcome::Moved { .. } => {
                return self.context().store.delete_uid(uid.id).await;
            }
            PreProcessOutcome::Keep { modified } => {
                if dup.study_uid() != self.location.study_uid() {
                    return self.context().store.delete_uid(uid.id).await;
                }
                if modified {
                    self.context().codec.save(&dup, &dup_path)?;
                }
            }
        }

        let base_path = self.location.sop_path(dup.series_uid(), dup.sop_uid());
        let action = if !base_path.exists() {
            self.reconcile(uid, Vec::new()).await?
        } else {
            match uid.duplicate_policy() {
                DuplicatePolicy::OverwriteSop => {
                    self.overwrite(uid, dup, &dup_path, &base_path, false).await?
                }
                DuplicatePolicy::OverwriteSopAndUpdateDatabase => {
                    self.overwrite(uid, dup, &dup_path, &base_path, true).await?
                }
                DuplicatePolicy::OverwriteReport => {
                    self.overwrite_report(uid, dup, &dup_path, &base_path).await?
                }
                DuplicatePolicy::Compare => self.compare(uid, dup, &dup_path, &base_path).await?,
            }
        };

        tracing::debug!(
            target: "pacsvault::study_process",
            sop_uid = %uid.sop_uid,
            policy = %uid.duplicate_policy(),
            %action,
            "duplicate resolved"
        );
        self.stats.record_duplicate(action);
        Ok(())
    }

    /// Replace the stored copy with the duplicate. A failed batch is fatal
    /// for the whole item.
    async fn overwrite(
        &mut self,
        uid: &WorkQueueUid,
        mut dup: SopFile,
        dup_path: &Path,
        base_path: &Path,
        update_database: bool,
    ) -> Result<DuplicateAction> {
        let record = instance_record(&self.location, &dup, dup_path)?;
        dup.path = base_path.to_path_buf();

        let store = self.context().store.clone();
        let mut batch = CommandProcessor::new(format!("Overwrite duplicate SOP {}", uid.sop_uid));
        batch
            .add_command(RenameFileCommand::new(dup_path, base_path, true))
            .add_command(InsertManifestEntryCommand::new(
                self.manifest.clone(),
                self.location.manifest_path(),
                dup,
                base_path,
            ));
        if update_database {
            batch.add_command(UpdateInstanceCommand::new(store.clone(), record));
        } else {
            batch.add_command(InsertInstanceCommand::new(store.clone(), record));
        }
        batch.add_command(DeleteWorkQueueUidCommand::new(store, uid.clone()));

        self.execute_overwrite(uid, &mut batch).await?;
        Ok(if update_database {
            DuplicateAction::AcceptAndResync
        } else {
            DuplicateAction::Accept
        })
    }

    /// A newer report is stored beside the original and becomes the indexed
    /// copy; an older or same-age one is dropped.
    async fn overwrite_report(
        &mut self,
        uid: &WorkQueueUid,
        mut dup: SopFile,
        dup_path: &Path,
        base_path: &Path,
    ) -> Result<DuplicateAction> {
        let base = self.context().codec.load(base_path)?;
        let dup_is_newer = match (dup.instance_creation(), base.instance_creation()) {
            (Some(dup_time), Some(base_time)) => dup_time > base_time,
            _ => true,
        };

        if !dup_is_newer {
            self.delete_duplicate(uid, dup_path).await?;
            return Ok(DuplicateAction::Delete);
        }

        let revision = dup
            .instance_creation()
            .map(|created| created.format("%Y%m%d%H%M%S").to_string())
            .unwrap_or_else(|| Utc::now().format("%Y%m%d%H%M%S%3f").to_string());
        let report_path =
            self.location
                .report_revision_path(dup.series_uid(), dup.sop_uid(), &revision);
        dup.path = report_path.clone();

        let store = self.context().store.clone();
        let mut batch = CommandProcessor::new(format!("Save duplicate report {}", uid.sop_uid));
        batch
            .add_command(RenameFileCommand::new(dup_path, &report_path, false))
            .add_command(InsertManifestEntryCommand::new(
                self.manifest.clone(),
                self.location.manifest_path(),
                dup,
                &report_path,
            ))
            .add_command(DeleteWorkQueueUidCommand::new(store, uid.clone()));
        self.execute_overwrite(uid, &mut batch).await?;
        Ok(DuplicateAction::Accept)
    }

    async fn compare(
        &mut self,
        uid: &WorkQueueUid,
        mut dup: SopFile,
        dup_path: &Path,
        base_path: &Path,
    ) -> Result<DuplicateAction> {
        let mut base = self.context().codec.load(base_path)?;

        if dup.transfer_syntax != base.transfer_syntax {
            self.try_decompress(&mut dup);
            self.try_decompress(&mut base);
            if dup.transfer_syntax != base.transfer_syntax
                && (dup.transfer_syntax.encapsulated() || base.transfer_syntax.encapsulated())
            {
                let difference = AttributeDifference {
                    attribute: tags::TRANSFER_SYNTAX_UID.to_string(),
                    kind: DifferenceKind::DifferentValues,
                    details: format!(
                        "stored {} ({}), duplicate {} ({})",
                        base.transfer_syntax.name(),
                        base.transfer_syntax.uid(),
                        dup.transfer_syntax.name(),
                        dup.transfer_syntax.uid()
                    ),
                };
                return self.reconcile(uid, vec![difference]).await;
            }
        }

        let differences = base.dataset.compare(&dup.dataset);
        if differences.is_empty() {
            self.delete_duplicate(uid, dup_path).await?;
            Ok(DuplicateAction::Delete)
        } else {
            self.reconcile(uid, differences).await
        }
    }

    /// Decode lossless encapsulated objects so they compare by content.
    fn try_decompress(&self, file: &mut SopFile) {
        let syntax = file.transfer_syntax;
        if !syntax.encapsulated() || syntax.lossy() || !self.context().codec.can_decompress(syntax) {
            return;
        }
        if let Err(err) = self.context().codec.decompress(file) {
            tracing::warn!(
                target: "pacsvault::study_process",
                path = %file.path.display(),
                error = %err,
                "unable to decompress for comparison"
            );
        }
    }

    async fn delete_duplicate(&mut self, uid: &WorkQueueUid, dup_path: &Path) -> Result<()> {
        let store = self.context().store.clone();
        let mut batch = CommandProcessor::new(format!("Delete duplicate {}", uid.sop_uid));
        batch
            .add_command(DeleteWorkQueueUidCommand::new(store, uid.clone()))
            .add_command(DeleteFileCommand::new(dup_path));
        run_batch(&mut batch).await
    }

    /// Park the duplicate for an operator; its file stays in the reconcile folder.
    async fn reconcile(
        &mut self,
        uid: &WorkQueueUid,
        differences: Vec<AttributeDifference>,
    ) -> Result<DuplicateAction> {
        let group_id = uid.group_id.clone().unwrap_or_default();
        let draft = ReconcileEntryDraft {
            study_storage_id: self.location.id(),
            group_path: self
                .location
                .duplicate_group_path(&group_id)
                .display()
                .to_string(),
            group_id,
            reason: ReconcileReason::Duplicate,
            uid: ReconcileUid {
                series_uid: uid.series_uid.clone(),
                sop_uid: uid.sop_uid.clone(),
                relative_path: self.location.duplicate_relative_path(uid),
            },
            differences,
        };

        let store = self.context().store.clone();
        let mut batch = CommandProcessor::new(format!("Reconcile duplicate {}", uid.sop_uid));
        batch
            .add_command(InsertReconcileEntryCommand::new(store.clone(), draft))
            .add_command(DeleteWorkQueueUidCommand::new(store, uid.clone()));
        run_batch(&mut batch).await?;
        Ok(DuplicateAction::Reconcile)
    }

    async fn execute_overwrite(
        &self,
        uid: &WorkQueueUid,
        batch: &mut CommandProcessor,
    ) -> Result<()> {
        if batch.execute().await {
            return Ok(());
        }
        let reason = batch
            .failure_reason()
            .unwrap_or("unknown failure")
            .to_string();
        self.base().alerts().raise(Alert::application_error(
            self.base().name(),
            AlertCode::FailedUpdateSop,
            format!(
                "Unable to overwrite SOP {} of study {}: {reason}",
                uid.sop_uid,
                self.location.study_uid()
            ),
        ));
        Err(PacsError::BatchFailed {
            description: batch.description().to_string(),
            reason,
        })
    }

    /// Remove the duplicate's folder and then its group folder once empty.
    pub(super) fn cleanup_duplicate_folders(&self, uid: &WorkQueueUid) {
        let folder = self.location.duplicate_folder(uid);
        if let Err(err) = delete_if_empty_up_to(&folder, &self.location.reconcile_root()) {
            tracing::debug!(
                target: "pacsvault::study_process",
                path = %folder.display(),
                error = %err,
                "unable to remove duplicate folder"
            );
        }
    }
}

async fn run_batch(batch: &mut CommandProcessor) -> Result<()> {
    if batch.execute().await {
        return Ok(());
    }
    Err(batch.take_failure().unwrap_or_else(|| {
        PacsError::Internal(format!("batch '{}' failed", batch.description()))
    }))
}
