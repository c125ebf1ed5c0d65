use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ids::{PartitionId, StudyStorageId, WorkQueueId, WorkQueueUidId};

string_enum! {
    pub enum WorkQueueType: "work queue type" {
        StudyProcess => "StudyProcess",
        ReprocessStudy => "ReprocessStudy",
        ReconcileStudy => "ReconcileStudy",
    }
}

string_enum! {
    pub enum WorkQueueStatus: "work queue status" {
        Idle => "Idle",
        Pending => "Pending",
        InProgress => "InProgress",
        Completed => "Completed",
        Failed => "Failed",
    }
}

string_enum! {
    /// How a duplicate image object is resolved against the stored copy.
    #[derive(Default)]
    pub enum DuplicatePolicy: "duplicate policy" {
        #[default]
        Compare => "Compare",
        OverwriteSop => "OverwriteSop",
        OverwriteSopAndUpdateDatabase => "OverwriteSopAndUpdateDatabase",
        OverwriteReport => "OverwriteReport",
    }
}

/// One ingestion work item: a study plus the objects queued against it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkQueueItem {
    pub id: WorkQueueId,
    pub partition_id: PartitionId,
    pub study_storage_id: StudyStorageId,
    pub work_queue_type: WorkQueueType,
    pub status: WorkQueueStatus,
    pub processor_id: Option<String>,
    pub scheduled_time: DateTime<Utc>,
    pub expiration_time: DateTime<Utc>,
    pub insert_time: DateTime<Utc>,
    pub failure_count: i32,
    pub failure_description: Option<String>,
}

impl WorkQueueItem {
    pub fn new(
        partition_id: PartitionId,
        study_storage_id: StudyStorageId,
        work_queue_type: WorkQueueType,
        expire_after: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: WorkQueueId::new(),
            partition_id,
            study_storage_id,
            work_queue_type,
            status: WorkQueueStatus::Pending,
            processor_id: None,
            scheduled_time: now,
            expiration_time: now + expire_after,
            insert_time: now,
            failure_count: 0,
            failure_description: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, WorkQueueStatus::Pending | WorkQueueStatus::Idle)
            && self.processor_id.is_none()
            && self.scheduled_time <= now
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration_time < now
    }
}

/// Serialized processing options carried by a pending image object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkQueueUidData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_processing: Option<DuplicatePolicy>,
}

impl WorkQueueUidData {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Empty or blank input decodes to the default options.
    pub fn from_json(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(raw)?)
    }
}

/// One image object waiting to be merged into its study.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkQueueUid {
    pub id: WorkQueueUidId,
    pub work_queue_id: WorkQueueId,
    pub series_uid: String,
    pub sop_uid: String,
    pub duplicate: bool,
    pub failed: bool,
    pub failure_count: i32,
    /// File extension of a duplicate's stored copy.
    pub extension: Option<String>,
    /// Reconciliation group a duplicate was received under.
    pub group_id: Option<String>,
    pub data: WorkQueueUidData,
}

impl WorkQueueUid {
    pub fn new(
        work_queue_id: WorkQueueId,
        series_uid: impl Into<String>,
        sop_uid: impl Into<String>,
    ) -> Self {
        Self {
            id: WorkQueueUidId::new(),
            work_queue_id,
            series_uid: series_uid.into(),
            sop_uid: sop_uid.into(),
            duplicate: false,
            failed: false,
            failure_count: 0,
            extension: None,
            group_id: None,
            data: WorkQueueUidData::default(),
        }
    }

    pub fn duplicate(
        mut self,
        group_id: impl Into<String>,
        extension: impl Into<String>,
        policy: Option<DuplicatePolicy>,
    ) -> Self {
        self.duplicate = true;
        self.group_id = Some(group_id.into());
        self.extension = Some(extension.into());
        self.data.duplicate_processing = policy;
        self
    }

    pub fn duplicate_policy(&self) -> DuplicatePolicy {
        self.data.duplicate_processing.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_options_decode_to_compare() {
        let data = WorkQueueUidData::from_json("  ").unwrap();
        assert_eq!(data, WorkQueueUidData::default());

        let uid = WorkQueueUid::new(WorkQueueId::new(), "1.2", "1.2.3");
        assert_eq!(uid.duplicate_policy(), DuplicatePolicy::Compare);
    }

    #[test]
    fn options_round_trip_policy() {
        let data = WorkQueueUidData {
            duplicate_processing: Some(DuplicatePolicy::OverwriteReport),
        };
        let json = data.to_json().unwrap();
        assert_eq!(WorkQueueUidData::from_json(&json).unwrap(), data);
    }
}
