//! Rules applied to every object before it is merged: patient name
//! normalisation and replay of recorded reconciliation decisions.

use std::fmt;
use std::fs;

use pacsvault_model::{
    QueueStudyState, ReconcileAction, WorkQueueItem, WorkQueueType, WorkQueueUid,
};

use crate::codec::{SopFile, tags};
use crate::error::{PacsError, Result};
use crate::storage::{StorageLocator, StudyStorageLocation};
use crate::work_queue::IngestionContext;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreProcessOutcome {
    /// Merge the object; `modified` means its dataset changed and must be
    /// written back before merging.
    Keep { modified: bool },
    /// Drop the object without merging it.
    Discard { reason: String },
    /// The object now belongs to another study and was queued there.
    Moved { study_uid: String },
}

/// Key under which reconciliation decisions are recorded for an object.
///
/// Duplicates use their group; other objects use the sending AE (or the
/// partition AE) and the time the work item was created.
pub fn context_id(
    uid: &WorkQueueUid,
    file: &SopFile,
    item: &WorkQueueItem,
    partition_ae: &str,
) -> String {
    if let Some(group_id) = uid.group_id.as_deref().filter(|group| !group.is_empty()) {
        return group_id.to_string();
    }
    let source = file
        .source_ae
        .as_deref()
        .filter(|ae| !ae.is_empty())
        .unwrap_or(partition_ae);
    format!("{source}_{}", item.insert_time.format("%Y%m%d%H%M%S"))
}

/// Canonical form used to decide whether two patient names are the same
/// person: trailing component separators and whitespace removed, uppercased.
pub fn normalize_patient_name(name: &str) -> String {
    name.trim_end_matches(|c: char| c == '^' || c.is_whitespace())
        .trim_start()
        .to_uppercase()
}

pub struct SopPreProcessor {
    context: IngestionContext,
    locator: StorageLocator,
    reference_name: Option<String>,
}

impl fmt::Debug for SopPreProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SopPreProcessor")
            .field("reference_name", &self.reference_name)
            .finish()
    }
}

impl SopPreProcessor {
    pub fn new(context: IngestionContext, reference_name: Option<String>) -> Self {
        Self {
            locator: StorageLocator::new(context.store.clone()),
            context,
            reference_name,
        }
    }

    pub fn reference_name(&self) -> Option<&str> {
        self.reference_name.as_deref()
    }

    pub async fn apply(
        &mut self,
        location: &StudyStorageLocation,
        item: &WorkQueueItem,
        uid: &WorkQueueUid,
        file: &mut SopFile,
    ) -> Result<PreProcessOutcome> {
        let modified = self.normalize_name(file);

        let context_id = context_id(uid, file, item, &location.partition.ae_title);
        let history = self
            .context
            .store
            .find_history(location.id(), &context_id)
            .await?;
        match history.map(|history| history.action) {
            None => Ok(PreProcessOutcome::Keep { modified }),
            Some(ReconcileAction::Discard) => Ok(PreProcessOutcome::Discard {
                reason: format!("discarded by reconciliation history of {context_id}"),
            }),
            Some(ReconcileAction::MergeInto { target_study_uid })
                if target_study_uid == location.study_uid() =>
            {
                Ok(PreProcessOutcome::Keep { modified })
            }
            Some(ReconcileAction::MergeInto { target_study_uid }) => {
                self.merge_into(location, uid, file, &target_study_uid)
                    .await?;
                Ok(PreProcessOutcome::Moved {
                    study_uid: target_study_uid,
                })
            }
        }
    }

    fn normalize_name(&mut self, file: &mut SopFile) -> bool {
        let Some(name) = file.dataset.get(tags::PATIENTS_NAME).map(str::to_string) else {
            return false;
        };
        let Some(reference) = self.reference_name.as_deref() else {
            self.reference_name = Some(name);
            return false;
        };
        if name == reference || normalize_patient_name(&name) != normalize_patient_name(reference) {
            return false;
        }
        tracing::debug!(
            target: "pacsvault::study_process",
            sop_uid = %file.sop_uid(),
            from = %name,
            to = %reference,
            "normalised patient name"
        );
        let reference = reference.to_string();
        file.dataset.set(tags::PATIENTS_NAME, reference);
        true
    }

    /// Rewrite the object into `target_study_uid` and queue it there.
    async fn merge_into(
        &self,
        location: &StudyStorageLocation,
        uid: &WorkQueueUid,
        file: &mut SopFile,
        target_study_uid: &str,
    ) -> Result<()> {
        let store = &self.context.store;
        let target = match self
            .locator
            .locate_online(location.partition.id, target_study_uid)
            .await
        {
            Ok(target) => target,
            Err(PacsError::StudyNearline { study_uid, .. }) => {
                let restore_requested = match store
                    .find_storage(location.partition.id, &study_uid)
                    .await?
                {
                    Some(storage) => store.request_restore(storage.id).await?,
                    None => false,
                };
                return Err(PacsError::StudyNearline {
                    study_uid,
                    restore_requested,
                });
            }
            Err(err) => return Err(err),
        };

        file.dataset.set(tags::STUDY_INSTANCE_UID, target_study_uid);
        let destination = target.sop_path(file.series_uid(), file.sop_uid());
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        self.context.codec.save(file, &destination)?;

        let target_item = match store
            .find_item_for_study(target.id(), WorkQueueType::StudyProcess)
            .await?
        {
            Some(existing) => existing,
            None => {
                store
                    .lock_study(target.id(), QueueStudyState::ProcessingScheduled)
                    .await?;
                let created = WorkQueueItem::new(
                    target.storage.partition_id,
                    target.id(),
                    WorkQueueType::StudyProcess,
                    self.context.config.expiration(),
                );
                store.insert_item(&created).await?;
                created
            }
        };
        store
            .insert_uid(&WorkQueueUid::new(
                target_item.id,
                file.series_uid(),
                file.sop_uid(),
            ))
            .await?;

        tracing::info!(
            target: "pacsvault::study_process",
            sop_uid = %uid.sop_uid,
            from = %location.study_uid(),
            to = %target_study_uid,
            "object merged into another study by reconciliation history"
        );
        Ok(())
    }
}
