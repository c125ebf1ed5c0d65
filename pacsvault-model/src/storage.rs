use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::ids::{FilesystemId, PartitionId};

/// A storage filesystem mounted by the image store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filesystem {
    pub id: FilesystemId,
    pub path: PathBuf,
    pub description: String,
    pub enabled: bool,
    pub read_only: bool,
    pub write_only: bool,
}

impl Filesystem {
    pub fn new(path: impl Into<PathBuf>, description: impl Into<String>) -> Self {
        Self {
            id: FilesystemId::new(),
            path: path.into(),
            description: description.into(),
            enabled: true,
            read_only: false,
            write_only: false,
        }
    }

    pub fn is_writable(&self) -> bool {
        self.enabled && !self.read_only
    }

    pub fn is_readable(&self) -> bool {
        self.enabled && !self.write_only
    }
}

/// A logical partition; each partition owns one folder on every filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerPartition {
    pub id: PartitionId,
    pub ae_title: String,
    pub partition_folder: String,
    pub enabled: bool,
}

impl ServerPartition {
    pub fn new(ae_title: impl Into<String>, partition_folder: impl Into<String>) -> Self {
        Self {
            id: PartitionId::new(),
            ae_title: ae_title.into(),
            partition_folder: partition_folder.into(),
            enabled: true,
        }
    }
}
