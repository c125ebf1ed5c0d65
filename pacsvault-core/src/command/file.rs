use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use uuid::Uuid;

use super::ServerCommand;
use crate::error::{PacsError, Result};

fn backup_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{name}.{}.bak", Uuid::new_v4().simple()))
}

fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            // Different mount points: fall back to copy + remove.
            fs::copy(from, to).map_err(|_| rename_err)?;
            fs::remove_file(from)
        }
    }
}

/// Move `source` onto `destination`, keeping any file it replaces until commit.
#[derive(Debug)]
pub struct RenameFileCommand {
    source: PathBuf,
    destination: PathBuf,
    overwrite: bool,
    backup: Option<PathBuf>,
}

impl RenameFileCommand {
    pub fn new(source: impl Into<PathBuf>, destination: impl Into<PathBuf>, overwrite: bool) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            overwrite,
            backup: None,
        }
    }
}

#[async_trait]
impl ServerCommand for RenameFileCommand {
    fn description(&self) -> String {
        format!(
            "rename {} -> {}",
            self.source.display(),
            self.destination.display()
        )
    }

    async fn execute(&mut self) -> Result<()> {
        if !self.source.exists() {
            return Err(PacsError::NotFound(self.source.display().to_string()));
        }
        if self.destination.exists() {
            if !self.overwrite {
                return Err(PacsError::Internal(format!(
                    "destination {} already exists",
                    self.destination.display()
                )));
            }
            let backup = backup_path(&self.destination);
            fs::rename(&self.destination, &backup)?;
            self.backup = Some(backup);
        }
        if let Err(err) = move_file(&self.source, &self.destination) {
            if let Some(backup) = self.backup.take() {
                fs::rename(&backup, &self.destination)?;
            }
            return Err(err.into());
        }
        Ok(())
    }

    async fn undo(&mut self) -> Result<()> {
        move_file(&self.destination, &self.source)?;
        if let Some(backup) = self.backup.take() {
            fs::rename(&backup, &self.destination)?;
        }
        Ok(())
    }

    async fn commit(&mut self) {
        if let Some(backup) = self.backup.take()
            && let Err(err) = fs::remove_file(&backup)
        {
            tracing::warn!(
                target: "pacsvault::command",
                path = %backup.display(),
                error = %err,
                "failed to remove rename backup"
            );
        }
    }
}

/// Delete a file; the content is parked beside it until commit.
#[derive(Debug)]
pub struct DeleteFileCommand {
    path: PathBuf,
    backup: Option<PathBuf>,
}

impl DeleteFileCommand {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            backup: None,
        }
    }
}

#[async_trait]
impl ServerCommand for DeleteFileCommand {
    fn description(&self) -> String {
        format!("delete {}", self.path.display())
    }

    async fn execute(&mut self) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let backup = backup_path(&self.path);
        fs::rename(&self.path, &backup)?;
        self.backup = Some(backup);
        Ok(())
    }

    async fn undo(&mut self) -> Result<()> {
        if let Some(backup) = self.backup.take() {
            fs::rename(&backup, &self.path)?;
        }
        Ok(())
    }

    async fn commit(&mut self) {
        if let Some(backup) = self.backup.take()
            && let Err(err) = fs::remove_file(&backup)
        {
            tracing::warn!(
                target: "pacsvault::command",
                path = %backup.display(),
                error = %err,
                "failed to remove delete backup"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn rename_over_existing_file_is_reversible() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("dup/a.dcm");
        let destination = dir.path().join("study/a.dcm");
        fs::create_dir_all(source.parent().unwrap()).unwrap();
        fs::create_dir_all(destination.parent().unwrap()).unwrap();
        fs::write(&source, b"new").unwrap();
        fs::write(&destination, b"old").unwrap();

        let mut command = RenameFileCommand::new(&source, &destination, true);
        command.execute().await.unwrap();
        assert_eq!(fs::read(&destination).unwrap(), b"new");
        assert!(!source.exists());

        command.undo().await.unwrap();
        assert_eq!(fs::read(&destination).unwrap(), b"old");
        assert_eq!(fs::read(&source).unwrap(), b"new");
    }

    #[tokio::test]
    async fn commit_drops_backup() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.dcm");
        fs::write(&path, b"x").unwrap();

        let mut command = DeleteFileCommand::new(&path);
        command.execute().await.unwrap();
        assert!(!path.exists());
        command.commit().await;
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn commit_with_vanished_backup_still_completes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.dcm");
        fs::write(&path, b"x").unwrap();

        let mut command = DeleteFileCommand::new(&path);
        command.execute().await.unwrap();
        for entry in fs::read_dir(dir.path()).unwrap() {
            fs::remove_file(entry.unwrap().path()).unwrap();
        }
        command.commit().await;
        assert!(!path.exists());
    }
}
