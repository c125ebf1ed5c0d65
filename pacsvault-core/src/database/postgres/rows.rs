//! Row shapes and their conversion into model types.

use chrono::{DateTime, Utc};
use pacsvault_model::{
    AttributeDifference, Filesystem, InstanceRecord, ReconcileAction, ReconcileHistory,
    ReconcileUid, ReconciliationRecord, ServerPartition, ServiceLockEntry, StudyRecord,
    StudyStorage, WorkQueueItem, WorkQueueUid, WorkQueueUidData,
};
use uuid::Uuid;

use crate::error::{PacsError, Result};

/// Columns selected for a service lock.
pub(super) const SERVICE_LOCK_COLUMNS: &str =
    "id, lock_type, filesystem_id, processor_id, scheduled_time, locked, enabled";

pub(super) const STUDY_STORAGE_COLUMNS: &str = "id, partition_id, study_uid, filesystem_id, \
     study_folder, queue_state, status, transfer_syntax, latest_archive_lossless, \
     restore_requested, study_size_kb, last_accessed";

pub(super) const WORK_QUEUE_COLUMNS: &str = "id, partition_id, study_storage_id, \
     work_queue_type, status, processor_id, scheduled_time, expiration_time, insert_time, \
     failure_count, failure_description";

pub(super) const WORK_QUEUE_UID_COLUMNS: &str = "id, work_queue_id, series_uid, sop_uid, \
     duplicate, failed, failure_count, extension, group_id, data";

pub(super) const RECONCILE_COLUMNS: &str =
    "id, study_storage_id, group_id, reason, group_path, uids, differences, inserted_at";

#[derive(sqlx::FromRow)]
pub(super) struct ServiceLockRow {
    id: Uuid,
    lock_type: String,
    filesystem_id: Option<Uuid>,
    processor_id: Option<String>,
    scheduled_time: DateTime<Utc>,
    locked: bool,
    enabled: bool,
}

impl TryFrom<ServiceLockRow> for ServiceLockEntry {
    type Error = PacsError;

    fn try_from(row: ServiceLockRow) -> Result<Self> {
        Ok(Self {
            id: row.id.into(),
            lock_type: row.lock_type.parse()?,
            filesystem_id: row.filesystem_id.map(Into::into),
            processor_id: row.processor_id,
            scheduled_time: row.scheduled_time,
            locked: row.locked,
            enabled: row.enabled,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(super) struct FilesystemRow {
    id: Uuid,
    path: String,
    description: String,
    enabled: bool,
    read_only: bool,
    write_only: bool,
}

impl From<FilesystemRow> for Filesystem {
    fn from(row: FilesystemRow) -> Self {
        Self {
            id: row.id.into(),
            path: row.path.into(),
            description: row.description,
            enabled: row.enabled,
            read_only: row.read_only,
            write_only: row.write_only,
        }
    }
}

#[derive(sqlx::FromRow)]
pub(super) struct PartitionRow {
    id: Uuid,
    ae_title: String,
    partition_folder: String,
    enabled: bool,
}

impl From<PartitionRow> for ServerPartition {
    fn from(row: PartitionRow) -> Self {
        Self {
            id: row.id.into(),
            ae_title: row.ae_title,
            partition_folder: row.partition_folder,
            enabled: row.enabled,
        }
    }
}

#[derive(sqlx::FromRow)]
pub(super) struct StudyStorageRow {
    id: Uuid,
    partition_id: Uuid,
    study_uid: String,
    filesystem_id: Uuid,
    study_folder: String,
    queue_state: String,
    status: String,
    transfer_syntax: String,
    latest_archive_lossless: Option<bool>,
    restore_requested: bool,
    study_size_kb: Option<i64>,
    last_accessed: DateTime<Utc>,
}

impl TryFrom<StudyStorageRow> for StudyStorage {
    type Error = PacsError;

    fn try_from(row: StudyStorageRow) -> Result<Self> {
        Ok(Self {
            id: row.id.into(),
            partition_id: row.partition_id.into(),
            study_uid: row.study_uid,
            filesystem_id: row.filesystem_id.into(),
            study_folder: row.study_folder,
            queue_state: row.queue_state.parse()?,
            status: row.status.parse()?,
            transfer_syntax: row.transfer_syntax.parse()?,
            latest_archive_lossless: row.latest_archive_lossless,
            restore_requested: row.restore_requested,
            study_size_kb: row.study_size_kb,
            last_accessed: row.last_accessed,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(super) struct InstanceRow {
    study_storage_id: Uuid,
    series_uid: String,
    sop_uid: String,
    transfer_syntax: String,
    file_size: i64,
    modality: Option<String>,
}

impl TryFrom<InstanceRow> for InstanceRecord {
    type Error = PacsError;

    fn try_from(row: InstanceRow) -> Result<Self> {
        Ok(Self {
            study_storage_id: row.study_storage_id.into(),
            series_uid: row.series_uid,
            sop_uid: row.sop_uid,
            transfer_syntax: row.transfer_syntax.parse()?,
            file_size: u64::try_from(row.file_size).unwrap_or_default(),
            modality: row.modality,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(super) struct StudyRecordRow {
    study_storage_id: Uuid,
    study_uid: String,
    num_series: i32,
    num_instances: i32,
    modalities: Vec<String>,
}

impl From<StudyRecordRow> for StudyRecord {
    fn from(row: StudyRecordRow) -> Self {
        Self {
            study_storage_id: row.study_storage_id.into(),
            study_uid: row.study_uid,
            num_series: row.num_series.max(0) as u32,
            num_instances: row.num_instances.max(0) as u32,
            modalities: row.modalities,
        }
    }
}

#[derive(sqlx::FromRow)]
pub(super) struct WorkQueueRow {
    id: Uuid,
    partition_id: Uuid,
    study_storage_id: Uuid,
    work_queue_type: String,
    status: String,
    processor_id: Option<String>,
    scheduled_time: DateTime<Utc>,
    expiration_time: DateTime<Utc>,
    insert_time: DateTime<Utc>,
    failure_count: i32,
    failure_description: Option<String>,
}

impl TryFrom<WorkQueueRow> for WorkQueueItem {
    type Error = PacsError;

    fn try_from(row: WorkQueueRow) -> Result<Self> {
        Ok(Self {
            id: row.id.into(),
            partition_id: row.partition_id.into(),
            study_storage_id: row.study_storage_id.into(),
            work_queue_type: row.work_queue_type.parse()?,
            status: row.status.parse()?,
            processor_id: row.processor_id,
            scheduled_time: row.scheduled_time,
            expiration_time: row.expiration_time,
            insert_time: row.insert_time,
            failure_count: row.failure_count,
            failure_description: row.failure_description,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(super) struct WorkQueueUidRow {
    id: Uuid,
    work_queue_id: Uuid,
    series_uid: String,
    sop_uid: String,
    duplicate: bool,
    failed: bool,
    failure_count: i32,
    extension: Option<String>,
    group_id: Option<String>,
    data: serde_json::Value,
}

impl TryFrom<WorkQueueUidRow> for WorkQueueUid {
    type Error = PacsError;

    fn try_from(row: WorkQueueUidRow) -> Result<Self> {
        let data = if row.data.is_null() {
            WorkQueueUidData::default()
        } else {
            serde_json::from_value(row.data)?
        };
        Ok(Self {
            id: row.id.into(),
            work_queue_id: row.work_queue_id.into(),
            series_uid: row.series_uid,
            sop_uid: row.sop_uid,
            duplicate: row.duplicate,
            failed: row.failed,
            failure_count: row.failure_count,
            extension: row.extension,
            group_id: row.group_id,
            data,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(super) struct ReconcileRow {
    id: Uuid,
    study_storage_id: Uuid,
    group_id: String,
    reason: String,
    group_path: String,
    uids: serde_json::Value,
    differences: serde_json::Value,
    inserted_at: DateTime<Utc>,
}

impl TryFrom<ReconcileRow> for ReconciliationRecord {
    type Error = PacsError;

    fn try_from(row: ReconcileRow) -> Result<Self> {
        let uids: Vec<ReconcileUid> = serde_json::from_value(row.uids)?;
        let differences: Vec<AttributeDifference> = serde_json::from_value(row.differences)?;
        Ok(Self {
            id: row.id.into(),
            study_storage_id: row.study_storage_id.into(),
            group_id: row.group_id,
            reason: row.reason.parse()?,
            group_path: row.group_path,
            uids,
            differences,
            inserted_at: row.inserted_at,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(super) struct HistoryRow {
    study_storage_id: Uuid,
    context_id: String,
    action: serde_json::Value,
    recorded_at: DateTime<Utc>,
}

impl TryFrom<HistoryRow> for ReconcileHistory {
    type Error = PacsError;

    fn try_from(row: HistoryRow) -> Result<Self> {
        let action: ReconcileAction = serde_json::from_value(row.action)?;
        Ok(Self {
            study_storage_id: row.study_storage_id.into(),
            context_id: row.context_id,
            action,
            recorded_at: row.recorded_at,
        })
    }
}

/// Convert every row, failing on the first one that does not map.
pub(super) fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>>
where
    T: TryFrom<R, Error = PacsError>,
{
    rows.into_iter().map(T::try_from).collect()
}
