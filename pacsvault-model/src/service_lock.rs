use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{FilesystemId, ServiceLockId};

string_enum! {
    /// Task-type tag of a maintenance entry; selects the processor that runs it.
    pub enum ServiceLockType: "service lock type" {
        FilesystemReinventory => "FilesystemReinventory",
        FilesystemRebuildManifest => "FilesystemRebuildManifest",
        FilesystemDelete => "FilesystemDelete",
        FilesystemLosslessCompress => "FilesystemLosslessCompress",
        FilesystemLossyCompress => "FilesystemLossyCompress",
        PurgeAlerts => "PurgeAlerts",
        ArchiveApplicationLog => "ArchiveApplicationLog",
    }
}

/// One scheduled maintenance task against one filesystem.
///
/// `locked` is advisory only: a crashed processor leaves it set and the next
/// dispatcher startup with the same `processor_id` clears it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceLockEntry {
    pub id: ServiceLockId,
    pub lock_type: ServiceLockType,
    pub filesystem_id: Option<FilesystemId>,
    pub processor_id: Option<String>,
    pub scheduled_time: DateTime<Utc>,
    pub locked: bool,
    pub enabled: bool,
}

impl ServiceLockEntry {
    pub fn new(
        lock_type: ServiceLockType,
        filesystem_id: Option<FilesystemId>,
        scheduled_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ServiceLockId::new(),
            lock_type,
            filesystem_id,
            processor_id: None,
            scheduled_time,
            locked: false,
            enabled: true,
        }
    }

    /// Due for this processor: enabled, unlocked and scheduled at or before `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && !self.locked && self.scheduled_time <= now
    }
}
