//! On-disk layout of studies and their manifests.

mod fs_util;
mod location;
mod locator;
pub mod manifest;

pub use fs_util::{
    calculate_folder_size, delete_directory_if_empty, delete_if_empty_up_to,
};
pub use location::{
    DELETED_FOLDER_SUFFIX, MANIFEST_EXTENSION, RECONCILE_FOLDER, SOP_EXTENSION,
    StudyStorageLocation,
};
pub use locator::StorageLocator;
pub use manifest::{InstanceEntry, SeriesEntry, SharedManifest, StudyManifest};
