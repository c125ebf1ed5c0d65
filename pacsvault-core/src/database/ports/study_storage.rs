use async_trait::async_trait;
use pacsvault_model::{
    FilesystemId, InstanceRecord, PartitionId, QueueStudyState, StudyLockOutcome,
    StudyRecord, StudyStorage, StudyStorageId,
};

use crate::error::Result;

#[async_trait]
pub trait StudyStorageRepository: Send + Sync {
    async fn get_storage(&self, id: StudyStorageId) -> Result<Option<StudyStorage>>;

    async fn find_storage(
        &self,
        partition_id: PartitionId,
        study_uid: &str,
    ) -> Result<Option<StudyStorage>>;

    async fn list_storage_on_filesystem(
        &self,
        filesystem_id: FilesystemId,
    ) -> Result<Vec<StudyStorage>>;

    async fn insert_storage(&self, storage: &StudyStorage) -> Result<()>;

    /// Move the study into `desired` if it is idle (or already in `desired`).
    /// A refusal is not an error; the outcome carries the reason.
    async fn lock_study(
        &self,
        id: StudyStorageId,
        desired: QueueStudyState,
    ) -> Result<StudyLockOutcome>;

    async fn set_queue_state(&self, id: StudyStorageId, state: QueueStudyState) -> Result<()>;

    /// Ask for a nearline study to be brought back from its archive copy.
    /// Returns `false` when nothing could be requested: the study is unknown,
    /// not nearline, or has no archive copy.
    async fn request_restore(&self, id: StudyStorageId) -> Result<bool>;

    async fn update_study_size(&self, id: StudyStorageId, size_kb: i64) -> Result<()>;

    async fn load_study_record(&self, id: StudyStorageId) -> Result<Option<StudyRecord>>;
}

#[async_trait]
pub trait InstanceIndexRepository: Send + Sync {
    async fn load_instance_index(&self, study_storage_id: StudyStorageId)
    -> Result<Vec<InstanceRecord>>;

    async fn get_instance(
        &self,
        study_storage_id: StudyStorageId,
        sop_uid: &str,
    ) -> Result<Option<InstanceRecord>>;

    /// Add or replace an instance row. Adding a new row refreshes the study
    /// record; replacing an existing row leaves it untouched.
    async fn insert_instance(&self, record: &InstanceRecord) -> Result<()>;

    /// Replace an instance row and rebuild the study record from the index,
    /// recreating it if it was removed.
    async fn update_instance(&self, record: &InstanceRecord) -> Result<()>;

    async fn delete_instance(&self, study_storage_id: StudyStorageId, sop_uid: &str)
    -> Result<()>;
}
