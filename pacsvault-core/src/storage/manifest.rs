//! Per-study manifest: the series/instance index used for duplicate detection.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use pacsvault_model::TransferSyntax;
use serde::{Deserialize, Serialize};

use crate::codec::SopFile;
use crate::error::Result;

/// Manifest shared between the processor and the commands of one batch.
pub type SharedManifest = Arc<tokio::sync::Mutex<StudyManifest>>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyManifest {
    pub study_uid: String,
    #[serde(default)]
    pub series: BTreeMap<String, SeriesEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modality: Option<String>,
    #[serde(default)]
    pub instances: BTreeMap<String, InstanceEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceEntry {
    pub transfer_syntax: TransferSyntax,
    /// Zero when written by a release that did not record sizes.
    #[serde(default)]
    pub file_size: u64,
}

impl StudyManifest {
    pub fn new(study_uid: impl Into<String>) -> Self {
        Self {
            study_uid: study_uid.into(),
            series: BTreeMap::new(),
        }
    }

    /// Read the manifest at `path`. A missing file yields an empty manifest.
    pub fn load(path: &Path, study_uid: &str) -> Result<Self> {
        match fs::read(path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::new(study_uid)),
            Err(err) => Err(err.into()),
        }
    }

    /// Replace the manifest at `path` atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&serde_json::to_vec_pretty(self)?)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|err| err.error)?;
        Ok(())
    }

    pub fn contains(&self, series_uid: &str, sop_uid: &str) -> bool {
        self.instance(series_uid, sop_uid).is_some()
    }

    pub fn instance(&self, series_uid: &str, sop_uid: &str) -> Option<&InstanceEntry> {
        self.series.get(series_uid)?.instances.get(sop_uid)
    }

    /// Record `file` under its series, replacing any previous entry.
    pub fn insert(&mut self, file: &SopFile, file_size: u64) {
        let series = self.series.entry(file.series_uid().to_string()).or_default();
        if series.modality.is_none() {
            series.modality = file.modality().map(str::to_string);
        }
        series.instances.insert(
            file.sop_uid().to_string(),
            InstanceEntry {
                transfer_syntax: file.transfer_syntax,
                file_size,
            },
        );
    }

    pub fn remove(&mut self, series_uid: &str, sop_uid: &str) -> bool {
        let Some(series) = self.series.get_mut(series_uid) else {
            return false;
        };
        let removed = series.instances.remove(sop_uid).is_some();
        if series.instances.is_empty() {
            self.series.remove(series_uid);
        }
        removed
    }

    pub fn num_series(&self) -> usize {
        self.series.len()
    }

    pub fn num_instances(&self) -> usize {
        self.series.values().map(|series| series.instances.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// `(series uid, sop uid, entry)` for every instance.
    pub fn instances(&self) -> impl Iterator<Item = (&str, &str, &InstanceEntry)> {
        self.series.iter().flat_map(|(series_uid, series)| {
            series
                .instances
                .iter()
                .map(move |(sop_uid, entry)| (series_uid.as_str(), sop_uid.as_str(), entry))
        })
    }
}
