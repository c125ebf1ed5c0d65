use std::fmt;
use std::sync::Arc;

use pacsvault_model::{PartitionId, StudyStorage, StudyStorageId};

use super::StudyStorageLocation;
use crate::database::PacsStore;
use crate::error::{PacsError, Result};

/// Resolves a study to its on-disk location.
#[derive(Clone)]
pub struct StorageLocator {
    store: Arc<dyn PacsStore>,
}

impl fmt::Debug for StorageLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageLocator")
            .field("store", &"PacsStore")
            .finish()
    }
}

impl StorageLocator {
    pub fn new(store: Arc<dyn PacsStore>) -> Self {
        Self { store }
    }

    /// Attach the filesystem and partition rows to `storage`.
    pub async fn resolve(&self, storage: StudyStorage) -> Result<StudyStorageLocation> {
        let filesystem = self
            .store
            .get_filesystem(storage.filesystem_id)
            .await?
            .ok_or_else(|| {
                PacsError::NotFound(format!(
                    "filesystem {} of study {}",
                    storage.filesystem_id, storage.study_uid
                ))
            })?;
        let partition = self
            .store
            .get_partition(storage.partition_id)
            .await?
            .ok_or_else(|| {
                PacsError::NotFound(format!(
                    "partition {} of study {}",
                    storage.partition_id, storage.study_uid
                ))
            })?;
        Ok(StudyStorageLocation::new(storage, filesystem, partition))
    }

    pub async fn locate(&self, id: StudyStorageId) -> Result<StudyStorageLocation> {
        let storage = self
            .store
            .get_storage(id)
            .await?
            .ok_or_else(|| PacsError::NotFound(format!("study storage {id}")))?;
        self.resolve(storage).await
    }

    /// Location of a study whose filesystem currently accepts writes.
    pub async fn locate_writable(&self, id: StudyStorageId) -> Result<StudyStorageLocation> {
        let location = self.locate(id).await?;
        if !location.filesystem.is_writable() {
            return Err(PacsError::NotFound(format!(
                "writable storage location for study {} (filesystem {} is read-only or disabled)",
                location.study_uid(),
                location.filesystem.description
            )));
        }
        Ok(location)
    }

    /// Location of a study by uid, refusing studies that are nearline.
    pub async fn locate_online(
        &self,
        partition_id: PartitionId,
        study_uid: &str,
    ) -> Result<StudyStorageLocation> {
        let storage = self
            .store
            .find_storage(partition_id, study_uid)
            .await?
            .ok_or_else(|| PacsError::NotFound(format!("study {study_uid}")))?;
        if storage.is_nearline() {
            return Err(PacsError::StudyNearline {
                study_uid: storage.study_uid,
                restore_requested: storage.restore_requested,
            });
        }
        self.resolve(storage).await
    }
}
