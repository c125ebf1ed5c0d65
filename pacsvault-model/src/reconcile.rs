use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ids::{ReconcileRecordId, StudyStorageId};

string_enum! {
    pub enum ReconcileReason: "reconcile reason" {
        Duplicate => "Duplicate",
        InconsistentData => "InconsistentData",
    }
}

string_enum! {
    pub enum DifferenceKind: "difference kind" {
        DifferentValues => "DifferentValues",
        MissingInBase => "MissingInBase",
        MissingInDuplicate => "MissingInDuplicate",
    }
}

/// One attribute-level difference between a stored object and its duplicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeDifference {
    pub attribute: String,
    pub kind: DifferenceKind,
    pub details: String,
}

impl fmt::Display for AttributeDifference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.attribute, self.kind, self.details)
    }
}

/// An object parked in a reconciliation record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileUid {
    pub series_uid: String,
    pub sop_uid: String,
    /// Path relative to the record's group folder, `<study_uid>/<sop_uid>.<ext>`.
    pub relative_path: String,
}

/// Marker for objects that could not be merged automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationRecord {
    pub id: ReconcileRecordId,
    pub study_storage_id: StudyStorageId,
    pub group_id: String,
    pub reason: ReconcileReason,
    pub group_path: String,
    pub uids: Vec<ReconcileUid>,
    pub differences: Vec<AttributeDifference>,
    pub inserted_at: DateTime<Utc>,
}

/// Action an operator previously chose for objects received under a context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ReconcileAction {
    Discard,
    MergeInto { target_study_uid: String },
}

/// Recorded reconciliation decision, replayed for later arrivals of the same batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileHistory {
    pub study_storage_id: StudyStorageId,
    pub context_id: String,
    pub action: ReconcileAction,
    pub recorded_at: DateTime<Utc>,
}
