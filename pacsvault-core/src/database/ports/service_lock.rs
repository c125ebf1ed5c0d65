use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pacsvault_model::{ServiceLockEntry, ServiceLockId};

use crate::error::Result;

#[async_trait]
pub trait ServiceLockRepository: Send + Sync {
    /// Atomically pick one due, enabled, unlocked entry and lock it for
    /// `processor_id`. Concurrent callers never receive the same entry.
    async fn select_and_lock_due_entry(
        &self,
        processor_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ServiceLockEntry>>;

    /// Clear the lock and owner and set the next run.
    async fn unlock_entry(
        &self,
        id: ServiceLockId,
        enabled: bool,
        scheduled_time: DateTime<Utc>,
    ) -> Result<()>;

    /// Clear every lock still held by `processor_id`, returning the entries reset.
    async fn reset_orphaned_locks(&self, processor_id: &str) -> Result<Vec<ServiceLockEntry>>;

    async fn get_entry(&self, id: ServiceLockId) -> Result<Option<ServiceLockEntry>>;

    async fn insert_entry(&self, entry: &ServiceLockEntry) -> Result<()>;
}
