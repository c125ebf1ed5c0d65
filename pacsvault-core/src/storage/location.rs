use std::path::PathBuf;

use pacsvault_model::{Filesystem, ServerPartition, StudyStorage, StudyStorageId, WorkQueueUid};

/// Extension of stored image objects.
pub const SOP_EXTENSION: &str = "dcm";
/// Extension of the study manifest.
pub const MANIFEST_EXTENSION: &str = "json";
/// Folder under each partition that holds objects awaiting reconciliation.
pub const RECONCILE_FOLDER: &str = "Reconcile";
/// Directories with this suffix hold deleted studies and are never walked.
pub const DELETED_FOLDER_SUFFIX: &str = "Deleted";

/// A study's storage row resolved against its filesystem and partition.
///
/// Layout: `<filesystem>/<partition>/<study folder>/<study uid>/<series uid>/<sop uid>.dcm`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudyStorageLocation {
    pub storage: StudyStorage,
    pub filesystem: Filesystem,
    pub partition: ServerPartition,
}

impl StudyStorageLocation {
    pub fn new(storage: StudyStorage, filesystem: Filesystem, partition: ServerPartition) -> Self {
        Self {
            storage,
            filesystem,
            partition,
        }
    }

    pub fn id(&self) -> StudyStorageId {
        self.storage.id
    }

    pub fn study_uid(&self) -> &str {
        &self.storage.study_uid
    }

    pub fn partition_root(&self) -> PathBuf {
        self.filesystem.path.join(&self.partition.partition_folder)
    }

    pub fn study_path(&self) -> PathBuf {
        self.partition_root()
            .join(&self.storage.study_folder)
            .join(&self.storage.study_uid)
    }

    pub fn series_path(&self, series_uid: &str) -> PathBuf {
        self.study_path().join(series_uid)
    }

    pub fn sop_path(&self, series_uid: &str, sop_uid: &str) -> PathBuf {
        self.series_path(series_uid)
            .join(format!("{sop_uid}.{SOP_EXTENSION}"))
    }

    /// Later revision of a report stored beside the original,
    /// `<series uid>/<sop uid>.<revision>.dcm`.
    pub fn report_revision_path(&self, series_uid: &str, sop_uid: &str, revision: &str) -> PathBuf {
        self.series_path(series_uid)
            .join(format!("{sop_uid}.{revision}.{SOP_EXTENSION}"))
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.study_path()
            .join(format!("{}.{MANIFEST_EXTENSION}", self.storage.study_uid))
    }

    /// Gzipped copy of the manifest kept by older deployments.
    pub fn compressed_manifest_path(&self) -> PathBuf {
        self.study_path()
            .join(format!("{}.{MANIFEST_EXTENSION}.gz", self.storage.study_uid))
    }

    pub fn reconcile_root(&self) -> PathBuf {
        self.partition_root().join(RECONCILE_FOLDER)
    }

    pub fn duplicate_group_path(&self, group_id: &str) -> PathBuf {
        self.reconcile_root().join(group_id)
    }

    /// Folder a duplicate's stored copy lives in, `<group>/<study uid>`.
    pub fn duplicate_folder(&self, uid: &WorkQueueUid) -> PathBuf {
        self.duplicate_group_path(uid.group_id.as_deref().unwrap_or_default())
            .join(&self.storage.study_uid)
    }

    pub fn duplicate_sop_path(&self, uid: &WorkQueueUid) -> PathBuf {
        self.duplicate_folder(uid).join(Self::duplicate_file_name(uid))
    }

    /// Path of a duplicate relative to its group folder.
    pub fn duplicate_relative_path(&self, uid: &WorkQueueUid) -> String {
        format!("{}/{}", self.storage.study_uid, Self::duplicate_file_name(uid))
    }

    fn duplicate_file_name(uid: &WorkQueueUid) -> String {
        let extension = uid
            .extension
            .as_deref()
            .filter(|ext| !ext.is_empty())
            .unwrap_or(SOP_EXTENSION);
        format!("{}.{}", uid.sop_uid, extension.trim_start_matches('.'))
    }
}
