use std::fs;
use std::io;
use std::path::Path;

use walkdir::WalkDir;

use crate::error::Result;

/// Remove `dir` if it exists and is empty. Returns whether it was removed.
pub fn delete_directory_if_empty(dir: &Path) -> Result<bool> {
    match fs::read_dir(dir) {
        Ok(mut entries) => {
            if entries.next().is_some() {
                return Ok(false);
            }
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err.into()),
    }
    match fs::remove_dir(dir) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}

/// Remove `dir` and then each empty ancestor, stopping below `stop_at`.
pub fn delete_if_empty_up_to(dir: &Path, stop_at: &Path) -> Result<usize> {
    let mut removed = 0;
    let mut current = Some(dir);
    while let Some(path) = current {
        if path == stop_at || !path.starts_with(stop_at) {
            break;
        }
        if !delete_directory_if_empty(path)? {
            break;
        }
        removed += 1;
        current = path.parent();
    }
    Ok(removed)
}

/// Exact size in bytes of every file under `dir`.
pub fn calculate_folder_size(dir: &Path) -> Result<u64> {
    let mut total = 0;
    for entry in WalkDir::new(dir) {
        let entry = entry.map_err(io::Error::from)?;
        if entry.file_type().is_file() {
            total += entry.metadata().map_err(io::Error::from)?.len();
        }
    }
    Ok(total)
}
