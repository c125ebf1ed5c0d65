use std::fs;
use std::path::PathBuf;

use async_trait::async_trait;

use super::ServerCommand;
use crate::codec::SopFile;
use crate::error::Result;
use crate::storage::{SharedManifest, StudyManifest};

/// Record an object in the study manifest and persist the manifest.
///
/// The recorded size is read from `artifact_path` at execution time, so the
/// command must run after the artifact reached its final location.
#[derive(Debug)]
pub struct InsertManifestEntryCommand {
    manifest: SharedManifest,
    manifest_path: PathBuf,
    file: SopFile,
    artifact_path: PathBuf,
    previous: Option<StudyManifest>,
}

impl InsertManifestEntryCommand {
    pub fn new(
        manifest: SharedManifest,
        manifest_path: impl Into<PathBuf>,
        file: SopFile,
        artifact_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            manifest,
            manifest_path: manifest_path.into(),
            file,
            artifact_path: artifact_path.into(),
            previous: None,
        }
    }
}

#[async_trait]
impl ServerCommand for InsertManifestEntryCommand {
    fn description(&self) -> String {
        format!("insert {} into manifest", self.file.sop_uid())
    }

    async fn execute(&mut self) -> Result<()> {
        let file_size = fs::metadata(&self.artifact_path)?.len();
        let mut manifest = self.manifest.lock().await;
        let previous = manifest.clone();
        manifest.insert(&self.file, file_size);
        if let Err(err) = manifest.save(&self.manifest_path) {
            *manifest = previous;
            return Err(err);
        }
        self.previous = Some(previous);
        Ok(())
    }

    async fn undo(&mut self) -> Result<()> {
        if let Some(previous) = self.previous.take() {
            let mut manifest = self.manifest.lock().await;
            *manifest = previous;
            manifest.save(&self.manifest_path)?;
        }
        Ok(())
    }
}
