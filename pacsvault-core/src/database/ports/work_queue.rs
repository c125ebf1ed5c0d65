use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pacsvault_model::{
    StudyStorageId, WorkQueueId, WorkQueueItem, WorkQueueType, WorkQueueUid,
    WorkQueueUidId,
};

use crate::error::Result;

#[async_trait]
pub trait WorkQueueRepository: Send + Sync {
    async fn insert_item(&self, item: &WorkQueueItem) -> Result<()>;

    async fn get_item(&self, id: WorkQueueId) -> Result<Option<WorkQueueItem>>;

    /// Persist every mutable column of `item`.
    async fn save_item(&self, item: &WorkQueueItem) -> Result<()>;

    /// Remove a finished item together with any objects still attached to it.
    async fn delete_item(&self, id: WorkQueueId) -> Result<()>;

    /// Atomically pick one due item and mark it in progress for `processor_id`.
    async fn select_and_lock_due_item(
        &self,
        processor_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkQueueItem>>;

    /// Return every in-progress item owned by `processor_id` to the queue.
    /// Items already at `max_failure_count` are failed instead.
    async fn reset_orphaned_items(
        &self,
        processor_id: &str,
        max_failure_count: i32,
    ) -> Result<Vec<WorkQueueItem>>;

    async fn find_item_for_study(
        &self,
        study_storage_id: StudyStorageId,
        work_queue_type: WorkQueueType,
    ) -> Result<Option<WorkQueueItem>>;

    /// Pending objects of an item, in arrival order.
    async fn load_uids(&self, work_queue_id: WorkQueueId) -> Result<Vec<WorkQueueUid>>;

    async fn insert_uid(&self, uid: &WorkQueueUid) -> Result<()>;

    async fn update_uid(&self, uid: &WorkQueueUid) -> Result<()>;

    async fn delete_uid(&self, id: WorkQueueUidId) -> Result<()>;
}
