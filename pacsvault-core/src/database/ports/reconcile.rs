use async_trait::async_trait;
use pacsvault_model::{
    AttributeDifference, ReconcileHistory, ReconcileReason, ReconcileRecordId,
    ReconcileUid, ReconciliationRecord, StudyStorageId,
};

use crate::error::Result;

/// Object to park under the reconciliation record of `(study, group, reason)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileEntryDraft {
    pub study_storage_id: StudyStorageId,
    pub group_id: String,
    pub reason: ReconcileReason,
    pub group_path: String,
    pub uid: ReconcileUid,
    pub differences: Vec<AttributeDifference>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileInsert {
    pub record_id: ReconcileRecordId,
    /// The record did not exist before this call.
    pub created: bool,
}

#[async_trait]
pub trait ReconcileRepository: Send + Sync {
    /// Append the draft's object to the matching record, creating the record
    /// when none exists.
    async fn insert_or_update_entry(&self, draft: &ReconcileEntryDraft) -> Result<ReconcileInsert>;

    /// Remove one object from a record; a record left empty is deleted.
    async fn remove_entry_uid(&self, record_id: ReconcileRecordId, sop_uid: &str) -> Result<()>;

    async fn list_entries(&self, study_storage_id: StudyStorageId)
    -> Result<Vec<ReconciliationRecord>>;

    async fn find_history(
        &self,
        study_storage_id: StudyStorageId,
        context_id: &str,
    ) -> Result<Option<ReconcileHistory>>;

    async fn insert_history(&self, history: &ReconcileHistory) -> Result<()>;
}
