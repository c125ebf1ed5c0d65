use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{FilesystemId, PartitionId, StudyStorageId};
use crate::transfer_syntax::TransferSyntax;

string_enum! {
    /// Processing-state tag held on a study; doubles as its processing lock.
    #[derive(Default)]
    pub enum QueueStudyState: "queue study state" {
        #[default]
        Idle => "Idle",
        ProcessingScheduled => "ProcessingScheduled",
        ReprocessScheduled => "ReprocessScheduled",
        RestoreScheduled => "RestoreScheduled",
    }
}

string_enum! {
    #[derive(Default)]
    pub enum StudyStatus: "study status" {
        #[default]
        Online => "Online",
        OnlineLossless => "OnlineLossless",
        OnlineLossy => "OnlineLossy",
        Nearline => "Nearline",
    }
}

impl StudyStatus {
    /// Status recorded for a study whose artifacts use `syntax`.
    pub fn for_transfer_syntax(syntax: TransferSyntax) -> Self {
        if syntax.lossy() {
            StudyStatus::OnlineLossy
        } else if syntax.encapsulated() {
            StudyStatus::OnlineLossless
        } else {
            StudyStatus::Online
        }
    }
}

/// Durable storage location of one study within one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyStorage {
    pub id: StudyStorageId,
    pub partition_id: PartitionId,
    pub study_uid: String,
    pub filesystem_id: FilesystemId,
    /// Date folder the study lives under, e.g. `20240131`.
    pub study_folder: String,
    pub queue_state: QueueStudyState,
    pub status: StudyStatus,
    pub transfer_syntax: TransferSyntax,
    /// `Some(true)` when the most recent archive copy is lossless.
    pub latest_archive_lossless: Option<bool>,
    pub restore_requested: bool,
    pub study_size_kb: Option<i64>,
    pub last_accessed: DateTime<Utc>,
}

impl StudyStorage {
    pub fn new(
        partition_id: PartitionId,
        filesystem_id: FilesystemId,
        study_folder: impl Into<String>,
        study_uid: impl Into<String>,
    ) -> Self {
        Self {
            id: StudyStorageId::new(),
            partition_id,
            study_uid: study_uid.into(),
            filesystem_id,
            study_folder: study_folder.into(),
            queue_state: QueueStudyState::Idle,
            status: StudyStatus::Online,
            transfer_syntax: TransferSyntax::default(),
            latest_archive_lossless: None,
            restore_requested: false,
            study_size_kb: None,
            last_accessed: Utc::now(),
        }
    }

    pub fn is_nearline(&self) -> bool {
        self.status == StudyStatus::Nearline
    }
}

/// Result of an attempt to move a study into a processing state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudyLockOutcome {
    pub acquired: bool,
    pub reason: Option<String>,
}

impl StudyLockOutcome {
    pub fn acquired() -> Self {
        Self {
            acquired: true,
            reason: None,
        }
    }

    pub fn refused(reason: impl Into<String>) -> Self {
        Self {
            acquired: false,
            reason: Some(reason.into()),
        }
    }
}

/// Row of the persistent instance index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub study_storage_id: StudyStorageId,
    pub series_uid: String,
    pub sop_uid: String,
    pub transfer_syntax: TransferSyntax,
    pub file_size: u64,
    pub modality: Option<String>,
}

/// Per-study aggregate kept alongside the instance index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyRecord {
    pub study_storage_id: StudyStorageId,
    pub study_uid: String,
    pub num_series: u32,
    pub num_instances: u32,
    pub modalities: Vec<String>,
}
