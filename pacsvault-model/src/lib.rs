//! Core data model definitions shared across pacsvault crates.
#![allow(missing_docs)]

#[macro_use]
mod macros;

pub mod error;
pub mod ids;
pub mod reconcile;
pub mod service_lock;
pub mod storage;
pub mod study;
pub mod transfer_syntax;
pub mod work_queue;

pub use error::{ModelError, Result};
pub use ids::{
    FilesystemId, PartitionId, ReconcileRecordId, ServiceLockId,
    StudyStorageId, WorkQueueId, WorkQueueUidId,
};
pub use reconcile::{
    AttributeDifference, DifferenceKind, ReconcileAction, ReconcileHistory,
    ReconcileReason, ReconcileUid, ReconciliationRecord,
};
pub use service_lock::{ServiceLockEntry, ServiceLockType};
pub use storage::{Filesystem, ServerPartition};
pub use study::{
    InstanceRecord, QueueStudyState, StudyLockOutcome, StudyRecord,
    StudyStatus, StudyStorage,
};
pub use transfer_syntax::TransferSyntax;
pub use work_queue::{
    DuplicatePolicy, WorkQueueItem, WorkQueueStatus, WorkQueueType,
    WorkQueueUid, WorkQueueUidData,
};
