//! Seam to the image-format layer.
//!
//! The processing core only needs to read an object's identifying attributes,
//! compare two objects and normalise their encoding; everything else about the
//! on-disk format stays behind [`SopCodec`].

mod json;
pub mod rle;

pub use json::JsonSopCodec;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use pacsvault_model::{AttributeDifference, DifferenceKind, TransferSyntax};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Attribute keywords the core reads or rewrites.
pub mod tags {
    pub const STUDY_INSTANCE_UID: &str = "StudyInstanceUID";
    pub const SERIES_INSTANCE_UID: &str = "SeriesInstanceUID";
    pub const SOP_INSTANCE_UID: &str = "SOPInstanceUID";
    pub const MODALITY: &str = "Modality";
    pub const PATIENTS_NAME: &str = "PatientName";
    pub const INSTANCE_CREATION_DATE: &str = "InstanceCreationDate";
    pub const INSTANCE_CREATION_TIME: &str = "InstanceCreationTime";
    /// Pseudo-attribute name used when reporting pixel data differences.
    pub const PIXEL_DATA: &str = "PixelData";
    pub const TRANSFER_SYNTAX_UID: &str = "TransferSyntaxUID";
}

/// Attributes and pixel data of one image object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default, with = "base64_bytes")]
    pub pixel_data: Vec<u8>,
}

impl Dataset {
    pub fn get(&self, keyword: &str) -> Option<&str> {
        self.attributes.get(keyword).map(String::as_str)
    }

    pub fn set(&mut self, keyword: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(keyword.into(), value.into());
    }

    /// Attribute-level comparison of `self` (the stored copy) against `other`.
    /// An empty result means the datasets are equal.
    pub fn compare(&self, other: &Dataset) -> Vec<AttributeDifference> {
        let mut differences = Vec::new();

        for (keyword, base_value) in &self.attributes {
            match other.attributes.get(keyword) {
                Some(dup_value) if dup_value == base_value => {}
                Some(dup_value) => differences.push(AttributeDifference {
                    attribute: keyword.clone(),
                    kind: DifferenceKind::DifferentValues,
                    details: format!(
                        "stored value '{base_value}', duplicate value '{dup_value}'"
                    ),
                }),
                None => differences.push(AttributeDifference {
                    attribute: keyword.clone(),
                    kind: DifferenceKind::MissingInDuplicate,
                    details: format!("stored value '{base_value}'"),
                }),
            }
        }

        for (keyword, dup_value) in &other.attributes {
            if !self.attributes.contains_key(keyword) {
                differences.push(AttributeDifference {
                    attribute: keyword.clone(),
                    kind: DifferenceKind::MissingInBase,
                    details: format!("duplicate value '{dup_value}'"),
                });
            }
        }

        if self.pixel_data != other.pixel_data {
            differences.push(AttributeDifference {
                attribute: tags::PIXEL_DATA.to_string(),
                kind: DifferenceKind::DifferentValues,
                details: format!(
                    "stored {} bytes, duplicate {} bytes",
                    self.pixel_data.len(),
                    other.pixel_data.len()
                ),
            });
        }

        differences
    }
}

/// A loaded image object and where it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SopFile {
    pub path: PathBuf,
    pub transfer_syntax: TransferSyntax,
    /// Application entity that sent the object, when known.
    pub source_ae: Option<String>,
    pub dataset: Dataset,
}

impl SopFile {
    pub fn new(path: impl Into<PathBuf>, transfer_syntax: TransferSyntax, dataset: Dataset) -> Self {
        Self {
            path: path.into(),
            transfer_syntax,
            source_ae: None,
            dataset,
        }
    }

    pub fn study_uid(&self) -> &str {
        self.dataset.get(tags::STUDY_INSTANCE_UID).unwrap_or_default()
    }

    pub fn series_uid(&self) -> &str {
        self.dataset.get(tags::SERIES_INSTANCE_UID).unwrap_or_default()
    }

    pub fn sop_uid(&self) -> &str {
        self.dataset.get(tags::SOP_INSTANCE_UID).unwrap_or_default()
    }

    pub fn modality(&self) -> Option<&str> {
        self.dataset.get(tags::MODALITY)
    }

    /// `InstanceCreationDate` + `InstanceCreationTime`, when both parse.
    pub fn instance_creation(&self) -> Option<NaiveDateTime> {
        let date = self.dataset.get(tags::INSTANCE_CREATION_DATE)?;
        let date = NaiveDate::parse_from_str(date.trim(), "%Y%m%d").ok()?;
        let time = match self.dataset.get(tags::INSTANCE_CREATION_TIME) {
            Some(raw) => parse_da_time(raw.trim())?,
            None => NaiveTime::MIN,
        };
        Some(date.and_time(time))
    }
}

fn parse_da_time(raw: &str) -> Option<NaiveTime> {
    let (whole, fraction) = match raw.split_once('.') {
        Some((whole, fraction)) => (whole, Some(fraction)),
        None => (raw, None),
    };
    let padded = format!("{whole:0<6}");
    let base = NaiveTime::parse_from_str(&padded, "%H%M%S").ok()?;
    match fraction {
        Some(fraction) if !fraction.is_empty() => {
            let digits: String = fraction.chars().take(6).collect();
            let micros: u32 = format!("{digits:0<6}").parse().ok()?;
            base.with_nanosecond(micros * 1_000)
        }
        _ => Some(base),
    }
}

/// Reads, writes and transcodes image objects.
pub trait SopCodec: Send + Sync {
    /// Parse the object at `path`. Unparseable content is a
    /// [`PacsError::Format`](crate::error::PacsError::Format) error.
    fn load(&self, path: &Path) -> Result<SopFile>;

    /// Write `file` to `path`, returning the number of bytes written.
    fn save(&self, file: &SopFile, path: &Path) -> Result<u64>;

    /// Whether a decoder exists for `syntax`.
    fn can_decompress(&self, syntax: TransferSyntax) -> bool;

    /// Re-encode `file` as Explicit VR Little Endian.
    fn decompress(&self, file: &mut SopFile) -> Result<()>;
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        STANDARD.decode(raw.as_bytes()).map_err(serde::de::Error::custom)
    }
}
