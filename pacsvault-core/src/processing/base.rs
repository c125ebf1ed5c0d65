use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use pacsvault_model::ServiceLockEntry;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::alerts::{Alert, AlertCategory, AlertCode, AlertLevel, AlertSink};
use crate::database::PacsStore;
use crate::error::Result;
use crate::storage::{
    DELETED_FOLDER_SUFFIX, MANIFEST_EXTENSION, SOP_EXTENSION, SharedManifest, StudyManifest,
    StudyStorageLocation, calculate_folder_size,
};

/// Paths per "files removed" alert.
pub const REMOVED_FILES_ALERT_CHUNK: usize = 10;

/// Result of [`ItemProcessorBase::load_sop_files`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SopFileWalk {
    /// Stored image objects, in walk order.
    pub sop_files: Vec<PathBuf>,
    /// Manifests and their compressed copies.
    pub index_files: Vec<PathBuf>,
    /// Unrecognised files left in place.
    pub unknown_files: Vec<PathBuf>,
    /// Unrecognised files deleted by cleanup.
    pub removed_files: Vec<PathBuf>,
    /// The walk stopped early because cancellation was requested.
    pub cancelled: bool,
}

/// State and helpers shared by every item processor: a cooperative cancel
/// flag, the store, the alert sink and study-folder utilities.
pub struct ItemProcessorBase {
    name: String,
    store: Arc<dyn PacsStore>,
    alerts: Arc<dyn AlertSink>,
    cancel: CancellationToken,
}

impl fmt::Debug for ItemProcessorBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ItemProcessorBase")
            .field("name", &self.name)
            .field("cancel_pending", &self.cancel.is_cancelled())
            .finish()
    }
}

impl ItemProcessorBase {
    pub fn new(name: impl Into<String>, store: Arc<dyn PacsStore>, alerts: Arc<dyn AlertSink>) -> Self {
        Self {
            name: name.into(),
            store,
            alerts,
            cancel: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Arc<dyn PacsStore> {
        &self.store
    }

    pub fn alerts(&self) -> &Arc<dyn AlertSink> {
        &self.alerts
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.on_cancelling();
        self.cancel.cancel();
    }

    pub fn cancel_pending(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn on_cancelling(&self) {
        tracing::info!(
            target: "pacsvault::processor",
            processor = %self.name,
            "cancellation requested"
        );
    }

    pub fn load_manifest(&self, location: &StudyStorageLocation) -> Result<StudyManifest> {
        StudyManifest::load(&location.manifest_path(), location.study_uid())
    }

    pub fn load_shared_manifest(&self, location: &StudyStorageLocation) -> Result<SharedManifest> {
        Ok(Arc::new(tokio::sync::Mutex::new(self.load_manifest(location)?)))
    }

    /// Approximate size in bytes of a study folder from its manifest.
    ///
    /// Falls back to walking the folder when there is no manifest on disk.
    pub fn estimate_folder_size(&self, location: &StudyStorageLocation) -> Result<u64> {
        let manifest_path = location.manifest_path();
        if !manifest_path.exists() {
            return self.calculate_folder_size(location);
        }

        let mut total = file_len(&manifest_path)?.unwrap_or(0);
        total += file_len(&location.compressed_manifest_path())?.unwrap_or(0);

        let manifest = self.load_manifest(location)?;
        for (series_uid, sop_uid, instance) in manifest.instances() {
            if instance.file_size > 0 {
                total += instance.file_size;
            } else if let Some(len) = file_len(&location.sop_path(series_uid, sop_uid))? {
                total += len;
            }
        }
        Ok(total)
    }

    pub fn calculate_folder_size(&self, location: &StudyStorageLocation) -> Result<u64> {
        let path = location.study_path();
        if !path.exists() {
            return Ok(0);
        }
        calculate_folder_size(&path)
    }

    /// Walk `dir` classifying files, skipping deleted-study folders.
    ///
    /// With `cleanup`, unrecognised files are deleted and reported to
    /// operators. Cancellation is checked before every file.
    pub fn load_sop_files(&self, dir: &Path, cleanup: bool) -> Result<SopFileWalk> {
        let mut walk = SopFileWalk::default();
        let entries = WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                !(entry.depth() > 0
                    && entry.file_type().is_dir()
                    && entry
                        .file_name()
                        .to_string_lossy()
                        .ends_with(DELETED_FOLDER_SUFFIX))
            });

        for entry in entries {
            let entry = entry.map_err(io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            if self.cancel_pending() {
                walk.cancelled = true;
                break;
            }

            let path = entry.into_path();
            match path.extension().and_then(|ext| ext.to_str()) {
                Some(SOP_EXTENSION) => walk.sop_files.push(path),
                Some(MANIFEST_EXTENSION) | Some("gz") => walk.index_files.push(path),
                _ if cleanup => match fs::remove_file(&path) {
                    Ok(()) => walk.removed_files.push(path),
                    Err(err) => {
                        tracing::warn!(
                            target: "pacsvault::processor",
                            processor = %self.name,
                            path = %path.display(),
                            error = %err,
                            "failed to remove unknown file"
                        );
                        walk.unknown_files.push(path);
                    }
                },
                _ => walk.unknown_files.push(path),
            }
        }

        self.report_removed_files(&walk.removed_files);
        Ok(walk)
    }

    fn report_removed_files(&self, removed: &[PathBuf]) {
        for chunk in removed.chunks(REMOVED_FILES_ALERT_CHUNK) {
            let mut message = String::from("Following files were removed:");
            for path in chunk {
                message.push('\n');
                message.push_str(&path.display().to_string());
            }
            self.alerts.raise(Alert::new(
                AlertCategory::System,
                AlertLevel::Informational,
                self.name.as_str(),
                AlertCode::FilesRemoved,
                message,
            ));
        }
    }

    pub async fn unlock_service_lock(
        &self,
        entry: &ServiceLockEntry,
        enabled: bool,
        scheduled_time: DateTime<Utc>,
    ) -> Result<()> {
        tracing::debug!(
            target: "pacsvault::processor",
            processor = %self.name,
            entry = %entry.id,
            enabled,
            %scheduled_time,
            "unlocking service lock"
        );
        self.store.unlock_entry(entry.id, enabled, scheduled_time).await
    }
}

fn file_len(path: &Path) -> Result<Option<u64>> {
    match fs::metadata(path) {
        Ok(metadata) => Ok(Some(metadata.len())),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}
