//! In-process store used by tests and single-node deployments without Postgres.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Mutex as SyncMutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pacsvault_model::{
    Filesystem, FilesystemId, InstanceRecord, PartitionId, QueueStudyState,
    ReconcileHistory, ReconcileRecordId, ReconciliationRecord, ServerPartition,
    ServiceLockEntry, ServiceLockId, StudyLockOutcome, StudyRecord, StudyStorage,
    StudyStorageId, WorkQueueId, WorkQueueItem, WorkQueueStatus, WorkQueueType,
    WorkQueueUid, WorkQueueUidId,
};
use tokio::sync::Mutex;

use super::ports::{
    FilesystemRepository, InstanceIndexRepository, ReconcileEntryDraft, ReconcileInsert,
    ReconcileRepository, ServiceLockRepository, StudyStorageRepository, WorkQueueRepository,
};
use crate::error::{PacsError, Result};

/// Store operations that can be made to fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    SelectEntry,
    UnlockEntry,
    ResetLocks,
    SelectItem,
    SaveItem,
    DeleteUid,
    UpdateUid,
    InsertInstance,
    UpdateInstance,
    LockStudy,
    InsertReconcile,
}

#[derive(Debug, Default)]
struct MemoryState {
    service_locks: BTreeMap<ServiceLockId, ServiceLockEntry>,
    items: BTreeMap<WorkQueueId, WorkQueueItem>,
    uids: Vec<WorkQueueUid>,
    storages: HashMap<StudyStorageId, StudyStorage>,
    instances: BTreeMap<(StudyStorageId, String), InstanceRecord>,
    studies: HashMap<StudyStorageId, StudyRecord>,
    reconcile: Vec<ReconciliationRecord>,
    history: Vec<ReconcileHistory>,
    filesystems: BTreeMap<FilesystemId, Filesystem>,
    partitions: BTreeMap<PartitionId, ServerPartition>,
}

impl MemoryState {
    fn rebuild_study_record(&mut self, id: StudyStorageId) {
        let Some(storage) = self.storages.get(&id) else {
            return;
        };
        let mut series = Vec::new();
        let mut modalities: Vec<String> = Vec::new();
        let mut num_instances = 0u32;
        for ((_, _), record) in self.instances.range((id, String::new())..) {
            if record.study_storage_id != id {
                break;
            }
            num_instances += 1;
            if !series.contains(&record.series_uid) {
                series.push(record.series_uid.clone());
            }
            if let Some(modality) = &record.modality
                && !modalities.contains(modality)
            {
                modalities.push(modality.clone());
            }
        }
        self.studies.insert(
            id,
            StudyRecord {
                study_storage_id: id,
                study_uid: storage.study_uid.clone(),
                num_series: series.len() as u32,
                num_instances,
                modalities,
            },
        );
    }
}

/// Store backed by process memory.
///
/// `fail_next` arms one-shot failures so tests can exercise rollback and retry
/// paths.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
    faults: SyncMutex<HashMap<StoreOp, u32>>,
}

impl fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("InMemoryStore");
        match self.state.try_lock() {
            Ok(state) => {
                debug
                    .field("service_locks", &state.service_locks.len())
                    .field("items", &state.items.len())
                    .field("uids", &state.uids.len())
                    .field("storages", &state.storages.len())
                    .field("instances", &state.instances.len())
                    .field("reconcile", &state.reconcile.len());
            }
            Err(_) => {
                debug.field("state", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` calls of `op` fail with a store error.
    pub fn fail_next(&self, op: StoreOp, times: u32) {
        if let Ok(mut faults) = self.faults.lock() {
            *faults.entry(op).or_default() += times;
        }
    }

    fn check(&self, op: StoreOp) -> Result<()> {
        let Ok(mut faults) = self.faults.lock() else {
            return Ok(());
        };
        match faults.get_mut(&op) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(PacsError::Store(format!("injected failure in {op:?}")))
            }
            _ => Ok(()),
        }
    }

    pub async fn service_lock_entries(&self) -> Vec<ServiceLockEntry> {
        self.state.lock().await.service_locks.values().cloned().collect()
    }

    pub async fn work_queue_items(&self) -> Vec<WorkQueueItem> {
        self.state.lock().await.items.values().cloned().collect()
    }

    /// Number of entries currently locked to `processor_id`.
    pub async fn locked_entry_count(&self, processor_id: &str) -> usize {
        self.state
            .lock()
            .await
            .service_locks
            .values()
            .filter(|entry| entry.locked && entry.processor_id.as_deref() == Some(processor_id))
            .count()
    }
}

#[async_trait]
impl ServiceLockRepository for InMemoryStore {
    async fn select_and_lock_due_entry(
        &self,
        processor_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ServiceLockEntry>> {
        self.check(StoreOp::SelectEntry)?;
        let mut state = self.state.lock().await;
        let Some(entry) = state
            .service_locks
            .values_mut()
            .filter(|entry| entry.is_due(now))
            .min_by_key(|entry| entry.scheduled_time)
        else {
            return Ok(None);
        };
        entry.locked = true;
        entry.processor_id = Some(processor_id.to_string());
        Ok(Some(entry.clone()))
    }

    async fn unlock_entry(
        &self,
        id: ServiceLockId,
        enabled: bool,
        scheduled_time: DateTime<Utc>,
    ) -> Result<()> {
        self.check(StoreOp::UnlockEntry)?;
        let mut state = self.state.lock().await;
        let entry = state
            .service_locks
            .get_mut(&id)
            .ok_or_else(|| PacsError::NotFound(format!("service lock {id}")))?;
        entry.locked = false;
        entry.processor_id = None;
        entry.enabled = enabled;
        entry.scheduled_time = scheduled_time;
        Ok(())
    }

    async fn reset_orphaned_locks(&self, processor_id: &str) -> Result<Vec<ServiceLockEntry>> {
        self.check(StoreOp::ResetLocks)?;
        let mut state = self.state.lock().await;
        let mut reset = Vec::new();
        for entry in state.service_locks.values_mut() {
            if entry.locked && entry.processor_id.as_deref() == Some(processor_id) {
                entry.locked = false;
                entry.processor_id = None;
                reset.push(entry.clone());
            }
        }
        Ok(reset)
    }

    async fn get_entry(&self, id: ServiceLockId) -> Result<Option<ServiceLockEntry>> {
        Ok(self.state.lock().await.service_locks.get(&id).cloned())
    }

    async fn insert_entry(&self, entry: &ServiceLockEntry) -> Result<()> {
        self.state
            .lock()
            .await
            .service_locks
            .insert(entry.id, entry.clone());
        Ok(())
    }
}

#[async_trait]
impl WorkQueueRepository for InMemoryStore {
    async fn insert_item(&self, item: &WorkQueueItem) -> Result<()> {
        self.state.lock().await.items.insert(item.id, item.clone());
        Ok(())
    }

    async fn get_item(&self, id: WorkQueueId) -> Result<Option<WorkQueueItem>> {
        Ok(self.state.lock().await.items.get(&id).cloned())
    }

    async fn save_item(&self, item: &WorkQueueItem) -> Result<()> {
        self.check(StoreOp::SaveItem)?;
        let mut state = self.state.lock().await;
        match state.items.get_mut(&item.id) {
            Some(existing) => {
                *existing = item.clone();
                Ok(())
            }
            None => Err(PacsError::NotFound(format!("work queue item {}", item.id))),
        }
    }

    async fn delete_item(&self, id: WorkQueueId) -> Result<()> {
        let mut state = self.state.lock().await;
        state.items.remove(&id);
        state.uids.retain(|uid| uid.work_queue_id != id);
        Ok(())
    }

    async fn select_and_lock_due_item(
        &self,
        processor_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkQueueItem>> {
        self.check(StoreOp::SelectItem)?;
        let mut state = self.state.lock().await;
        let Some(item) = state
            .items
            .values_mut()
            .filter(|item| item.is_due(now))
            .min_by_key(|item| item.scheduled_time)
        else {
            return Ok(None);
        };
        item.status = WorkQueueStatus::InProgress;
        item.processor_id = Some(processor_id.to_string());
        Ok(Some(item.clone()))
    }

    async fn reset_orphaned_items(
        &self,
        processor_id: &str,
        max_failure_count: i32,
    ) -> Result<Vec<WorkQueueItem>> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut reset = Vec::new();
        for item in state.items.values_mut() {
            if item.status == WorkQueueStatus::InProgress
                && item.processor_id.as_deref() == Some(processor_id)
            {
                item.processor_id = None;
                item.scheduled_time = now;
                item.status = if item.failure_count >= max_failure_count {
                    WorkQueueStatus::Failed
                } else {
                    WorkQueueStatus::Pending
                };
                reset.push(item.clone());
            }
        }
        Ok(reset)
    }

    async fn find_item_for_study(
        &self,
        study_storage_id: StudyStorageId,
        work_queue_type: WorkQueueType,
    ) -> Result<Option<WorkQueueItem>> {
        Ok(self
            .state
            .lock()
            .await
            .items
            .values()
            .find(|item| {
                item.study_storage_id == study_storage_id
                    && item.work_queue_type == work_queue_type
                    && item.status != WorkQueueStatus::Failed
            })
            .cloned())
    }

    async fn load_uids(&self, work_queue_id: WorkQueueId) -> Result<Vec<WorkQueueUid>> {
        Ok(self
            .state
            .lock()
            .await
            .uids
            .iter()
            .filter(|uid| uid.work_queue_id == work_queue_id)
            .cloned()
            .collect())
    }

    async fn insert_uid(&self, uid: &WorkQueueUid) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.uids.iter().any(|existing| existing.id == uid.id) {
            state.uids.push(uid.clone());
        }
        Ok(())
    }

    async fn update_uid(&self, uid: &WorkQueueUid) -> Result<()> {
        self.check(StoreOp::UpdateUid)?;
        let mut state = self.state.lock().await;
        match state.uids.iter_mut().find(|existing| existing.id == uid.id) {
            Some(existing) => {
                *existing = uid.clone();
                Ok(())
            }
            None => Err(PacsError::NotFound(format!("work queue uid {}", uid.id))),
        }
    }

    async fn delete_uid(&self, id: WorkQueueUidId) -> Result<()> {
        self.check(StoreOp::DeleteUid)?;
        self.state.lock().await.uids.retain(|uid| uid.id != id);
        Ok(())
    }
}

#[async_trait]
impl StudyStorageRepository for InMemoryStore {
    async fn get_storage(&self, id: StudyStorageId) -> Result<Option<StudyStorage>> {
        Ok(self.state.lock().await.storages.get(&id).cloned())
    }

    async fn find_storage(
        &self,
        partition_id: PartitionId,
        study_uid: &str,
    ) -> Result<Option<StudyStorage>> {
        Ok(self
            .state
            .lock()
            .await
            .storages
            .values()
            .find(|storage| storage.partition_id == partition_id && storage.study_uid == study_uid)
            .cloned())
    }

    async fn list_storage_on_filesystem(
        &self,
        filesystem_id: FilesystemId,
    ) -> Result<Vec<StudyStorage>> {
        let mut storages: Vec<_> = self
            .state
            .lock()
            .await
            .storages
            .values()
            .filter(|storage| storage.filesystem_id == filesystem_id)
            .cloned()
            .collect();
        storages.sort_by(|a, b| a.study_uid.cmp(&b.study_uid));
        Ok(storages)
    }

    async fn insert_storage(&self, storage: &StudyStorage) -> Result<()> {
        self.state
            .lock()
            .await
            .storages
            .insert(storage.id, storage.clone());
        Ok(())
    }

    async fn lock_study(
        &self,
        id: StudyStorageId,
        desired: QueueStudyState,
    ) -> Result<StudyLockOutcome> {
        self.check(StoreOp::LockStudy)?;
        let mut state = self.state.lock().await;
        let storage = state
            .storages
            .get_mut(&id)
            .ok_or_else(|| PacsError::NotFound(format!("study storage {id}")))?;
        if storage.queue_state == desired {
            return Ok(StudyLockOutcome::acquired());
        }
        if storage.queue_state != QueueStudyState::Idle {
            return Ok(StudyLockOutcome::refused(format!(
                "study {} is {}",
                storage.study_uid, storage.queue_state
            )));
        }
        storage.queue_state = desired;
        Ok(StudyLockOutcome::acquired())
    }

    async fn set_queue_state(&self, id: StudyStorageId, queue_state: QueueStudyState) -> Result<()> {
        let mut state = self.state.lock().await;
        let storage = state
            .storages
            .get_mut(&id)
            .ok_or_else(|| PacsError::NotFound(format!("study storage {id}")))?;
        storage.queue_state = queue_state;
        Ok(())
    }

    async fn request_restore(&self, id: StudyStorageId) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.storages.get_mut(&id) {
            Some(storage) if storage.is_nearline() && storage.latest_archive_lossless.is_some() => {
                storage.restore_requested = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_study_size(&self, id: StudyStorageId, size_kb: i64) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(storage) = state.storages.get_mut(&id) {
            storage.study_size_kb = Some(size_kb);
        }
        Ok(())
    }

    async fn load_study_record(&self, id: StudyStorageId) -> Result<Option<StudyRecord>> {
        Ok(self.state.lock().await.studies.get(&id).cloned())
    }
}

#[async_trait]
impl InstanceIndexRepository for InMemoryStore {
    async fn load_instance_index(
        &self,
        study_storage_id: StudyStorageId,
    ) -> Result<Vec<InstanceRecord>> {
        Ok(self
            .state
            .lock()
            .await
            .instances
            .values()
            .filter(|record| record.study_storage_id == study_storage_id)
            .cloned()
            .collect())
    }

    async fn get_instance(
        &self,
        study_storage_id: StudyStorageId,
        sop_uid: &str,
    ) -> Result<Option<InstanceRecord>> {
        Ok(self
            .state
            .lock()
            .await
            .instances
            .get(&(study_storage_id, sop_uid.to_string()))
            .cloned())
    }

    async fn insert_instance(&self, record: &InstanceRecord) -> Result<()> {
        self.check(StoreOp::InsertInstance)?;
        let mut state = self.state.lock().await;
        let key = (record.study_storage_id, record.sop_uid.clone());
        let is_new = state.instances.insert(key, record.clone()).is_none();
        if is_new {
            state.rebuild_study_record(record.study_storage_id);
        }
        Ok(())
    }

    async fn update_instance(&self, record: &InstanceRecord) -> Result<()> {
        self.check(StoreOp::UpdateInstance)?;
        let mut state = self.state.lock().await;
        let key = (record.study_storage_id, record.sop_uid.clone());
        state.instances.insert(key, record.clone());
        state.rebuild_study_record(record.study_storage_id);
        Ok(())
    }

    async fn delete_instance(&self, study_storage_id: StudyStorageId, sop_uid: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state
            .instances
            .remove(&(study_storage_id, sop_uid.to_string()))
            .is_some()
            && state.studies.contains_key(&study_storage_id)
        {
            state.rebuild_study_record(study_storage_id);
        }
        Ok(())
    }
}

#[async_trait]
impl ReconcileRepository for InMemoryStore {
    async fn insert_or_update_entry(&self, draft: &ReconcileEntryDraft) -> Result<ReconcileInsert> {
        self.check(StoreOp::InsertReconcile)?;
        let mut state = self.state.lock().await;
        if let Some(record) = state.reconcile.iter_mut().find(|record| {
            record.study_storage_id == draft.study_storage_id
                && record.group_id == draft.group_id
                && record.reason == draft.reason
        }) {
            if !record.uids.iter().any(|uid| uid.sop_uid == draft.uid.sop_uid) {
                record.uids.push(draft.uid.clone());
            }
            record.differences.extend(draft.differences.iter().cloned());
            return Ok(ReconcileInsert {
                record_id: record.id,
                created: false,
            });
        }

        let record = ReconciliationRecord {
            id: ReconcileRecordId::new(),
            study_storage_id: draft.study_storage_id,
            group_id: draft.group_id.clone(),
            reason: draft.reason,
            group_path: draft.group_path.clone(),
            uids: vec![draft.uid.clone()],
            differences: draft.differences.clone(),
            inserted_at: Utc::now(),
        };
        let record_id = record.id;
        state.reconcile.push(record);
        Ok(ReconcileInsert {
            record_id,
            created: true,
        })
    }

    async fn remove_entry_uid(&self, record_id: ReconcileRecordId, sop_uid: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(record) = state.reconcile.iter_mut().find(|record| record.id == record_id) {
            record.uids.retain(|uid| uid.sop_uid != sop_uid);
        }
        state.reconcile.retain(|record| !record.uids.is_empty());
        Ok(())
    }

    async fn list_entries(
        &self,
        study_storage_id: StudyStorageId,
    ) -> Result<Vec<ReconciliationRecord>> {
        Ok(self
            .state
            .lock()
            .await
            .reconcile
            .iter()
            .filter(|record| record.study_storage_id == study_storage_id)
            .cloned()
            .collect())
    }

    async fn find_history(
        &self,
        study_storage_id: StudyStorageId,
        context_id: &str,
    ) -> Result<Option<ReconcileHistory>> {
        Ok(self
            .state
            .lock()
            .await
            .history
            .iter()
            .rev()
            .find(|history| {
                history.study_storage_id == study_storage_id && history.context_id == context_id
            })
            .cloned())
    }

    async fn insert_history(&self, history: &ReconcileHistory) -> Result<()> {
        self.state.lock().await.history.push(history.clone());
        Ok(())
    }
}

#[async_trait]
impl FilesystemRepository for InMemoryStore {
    async fn get_filesystem(&self, id: FilesystemId) -> Result<Option<Filesystem>> {
        Ok(self.state.lock().await.filesystems.get(&id).cloned())
    }

    async fn list_filesystems(&self) -> Result<Vec<Filesystem>> {
        Ok(self.state.lock().await.filesystems.values().cloned().collect())
    }

    async fn insert_filesystem(&self, filesystem: &Filesystem) -> Result<()> {
        self.state
            .lock()
            .await
            .filesystems
            .insert(filesystem.id, filesystem.clone());
        Ok(())
    }

    async fn get_partition(&self, id: PartitionId) -> Result<Option<ServerPartition>> {
        Ok(self.state.lock().await.partitions.get(&id).cloned())
    }

    async fn list_partitions(&self) -> Result<Vec<ServerPartition>> {
        Ok(self.state.lock().await.partitions.values().cloned().collect())
    }

    async fn insert_partition(&self, partition: &ServerPartition) -> Result<()> {
        self.state
            .lock()
            .await
            .partitions
            .insert(partition.id, partition.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn due_entry_is_locked_once() {
        let store = InMemoryStore::new();
        let entry = ServiceLockEntry::new(
            pacsvault_model::ServiceLockType::FilesystemReinventory,
            None,
            Utc::now() - chrono::Duration::seconds(1),
        );
        store.insert_entry(&entry).await.unwrap();

        let first = store
            .select_and_lock_due_entry("node-a", Utc::now())
            .await
            .unwrap();
        let second = store
            .select_and_lock_due_entry("node-b", Utc::now())
            .await
            .unwrap();

        assert_eq!(first.map(|e| e.id), Some(entry.id));
        assert!(second.is_none());
        assert_eq!(store.locked_entry_count("node-a").await, 1);
    }

    #[tokio::test]
    async fn injected_failures_are_one_shot() {
        let store = InMemoryStore::new();
        store.fail_next(StoreOp::SelectEntry, 1);

        assert!(store.select_and_lock_due_entry("n", Utc::now()).await.is_err());
        assert!(store.select_and_lock_due_entry("n", Utc::now()).await.is_ok());
    }

    #[tokio::test]
    async fn lock_study_refuses_busy_study() {
        let store = InMemoryStore::new();
        let mut storage =
            StudyStorage::new(PartitionId::new(), FilesystemId::new(), "20240101", "1.2.3");
        storage.queue_state = QueueStudyState::ReprocessScheduled;
        store.insert_storage(&storage).await.unwrap();

        let outcome = store
            .lock_study(storage.id, QueueStudyState::ProcessingScheduled)
            .await
            .unwrap();
        assert!(!outcome.acquired);
        assert!(outcome.reason.unwrap().contains("ReprocessScheduled"));
    }
}
