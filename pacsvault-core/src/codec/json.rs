use std::fs;
use std::path::Path;

use pacsvault_model::TransferSyntax;
use serde::{Deserialize, Serialize};

use super::{Dataset, SopCodec, SopFile, rle, tags};
use crate::error::{PacsError, Result};

/// Reference image encoding: one JSON document per object with base64 pixel
/// data. RLE is the only encapsulated syntax it can decode.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSopCodec;

#[derive(Serialize, Deserialize)]
struct StoredObject {
    transfer_syntax: TransferSyntax,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source_ae: Option<String>,
    dataset: Dataset,
}

impl SopCodec for JsonSopCodec {
    fn load(&self, path: &Path) -> Result<SopFile> {
        let bytes = fs::read(path)?;
        let stored: StoredObject = serde_json::from_slice(&bytes)
            .map_err(|err| PacsError::format(path, err.to_string()))?;

        for required in [
            tags::STUDY_INSTANCE_UID,
            tags::SERIES_INSTANCE_UID,
            tags::SOP_INSTANCE_UID,
        ] {
            if stored.dataset.get(required).is_none_or(str::is_empty) {
                return Err(PacsError::format(path, format!("missing {required}")));
            }
        }

        Ok(SopFile {
            path: path.to_path_buf(),
            transfer_syntax: stored.transfer_syntax,
            source_ae: stored.source_ae,
            dataset: stored.dataset,
        })
    }

    fn save(&self, file: &SopFile, path: &Path) -> Result<u64> {
        let stored = StoredObject {
            transfer_syntax: file.transfer_syntax,
            source_ae: file.source_ae.clone(),
            dataset: file.dataset.clone(),
        };
        let bytes = serde_json::to_vec(&stored)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, &bytes)?;
        Ok(bytes.len() as u64)
    }

    fn can_decompress(&self, syntax: TransferSyntax) -> bool {
        syntax == TransferSyntax::RleLossless
    }

    fn decompress(&self, file: &mut SopFile) -> Result<()> {
        match file.transfer_syntax {
            syntax if !syntax.encapsulated() => {}
            TransferSyntax::RleLossless => {
                file.dataset.pixel_data = rle::decode(&file.dataset.pixel_data)?;
            }
            other => {
                return Err(PacsError::Internal(format!(
                    "no decoder registered for {}",
                    other.name()
                )));
            }
        }
        file.transfer_syntax = TransferSyntax::ExplicitVrLittleEndian;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample(pixel_data: Vec<u8>, syntax: TransferSyntax) -> SopFile {
        let mut dataset = Dataset::default();
        dataset.set(tags::STUDY_INSTANCE_UID, "1.2");
        dataset.set(tags::SERIES_INSTANCE_UID, "1.2.1");
        dataset.set(tags::SOP_INSTANCE_UID, "1.2.1.1");
        dataset.pixel_data = pixel_data;
        SopFile::new("unused", syntax, dataset)
    }

    #[test]
    fn rle_objects_decompress_to_native_pixels() {
        let raw = vec![1, 1, 1, 2, 2, 9];
        let mut file = sample(rle::encode(&raw), TransferSyntax::RleLossless);

        JsonSopCodec.decompress(&mut file).expect("decompress");
        assert_eq!(file.transfer_syntax, TransferSyntax::ExplicitVrLittleEndian);
        assert_eq!(file.dataset.pixel_data, raw);
    }

    #[test]
    fn unsupported_syntax_is_left_alone() {
        let mut file = sample(vec![1, 2], TransferSyntax::JpegLossless);
        assert!(!JsonSopCodec.can_decompress(file.transfer_syntax));
        assert!(JsonSopCodec.decompress(&mut file).is_err());
        assert_eq!(file.transfer_syntax, TransferSyntax::JpegLossless);
    }

    #[test]
    fn garbage_is_a_format_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.dcm");
        std::fs::write(&path, b"not an image").unwrap();

        let err = JsonSopCodec.load(&path).unwrap_err();
        assert!(matches!(err, PacsError::Format { .. }));
    }

    #[test]
    fn saved_objects_load_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("series/obj.dcm");
        let file = sample(vec![4, 5, 6], TransferSyntax::ExplicitVrLittleEndian);

        let written = JsonSopCodec.save(&file, &path).unwrap();
        assert_eq!(written, std::fs::metadata(&path).unwrap().len());
        let loaded = JsonSopCodec.load(&path).unwrap();
        assert_eq!(loaded.dataset, file.dataset);
        assert_eq!(loaded.path, path);
    }
}
