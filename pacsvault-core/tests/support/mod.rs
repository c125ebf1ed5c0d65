#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Duration;
use pacsvault_core::alerts::RecordingAlertSink;
use pacsvault_core::codec::{Dataset, JsonSopCodec, SopCodec, SopFile, tags};
use pacsvault_core::config::{MaintenanceConfig, StudyProcessConfig};
use pacsvault_core::database::InMemoryStore;
use pacsvault_core::database::ports::{
    FilesystemRepository, StudyStorageRepository, WorkQueueRepository,
};
use pacsvault_core::processing::ItemProcessor;
use pacsvault_core::rules::NoopRulesEngine;
use pacsvault_core::service_lock::MaintenanceContext;
use pacsvault_core::storage::StudyStorageLocation;
use pacsvault_core::work_queue::{IngestionContext, StudyProcessItemProcessor};
use pacsvault_model::{
    DuplicatePolicy, Filesystem, ServerPartition, StudyStorage, TransferSyntax, WorkQueueItem,
    WorkQueueType, WorkQueueUid,
};
use tempfile::TempDir;

pub const STUDY_UID: &str = "1.2.840.1";
pub const SERIES_UID: &str = "1.2.840.1.1";
pub const STUDY_FOLDER: &str = "20240131";
pub const PROCESSOR_ID: &str = "node-test";

/// One filesystem, one partition and one study backed by a temp dir.
pub struct Fixture {
    pub dir: TempDir,
    pub store: Arc<InMemoryStore>,
    pub alerts: Arc<RecordingAlertSink>,
    pub codec: Arc<JsonSopCodec>,
    pub filesystem: Filesystem,
    pub partition: ServerPartition,
    pub storage: StudyStorage,
    pub config: StudyProcessConfig,
}

impl Fixture {
    pub async fn new() -> Self {
        let dir = TempDir::new().expect("temp dir");
        let store = Arc::new(InMemoryStore::new());

        let filesystem = Filesystem::new(dir.path(), "primary");
        let partition = ServerPartition::new("ARCHIVE", "archive");
        let storage = StudyStorage::new(partition.id, filesystem.id, STUDY_FOLDER, STUDY_UID);

        store.insert_filesystem(&filesystem).await.expect("filesystem");
        store.insert_partition(&partition).await.expect("partition");
        store.insert_storage(&storage).await.expect("storage");

        Self {
            dir,
            store,
            alerts: Arc::new(RecordingAlertSink::new()),
            codec: Arc::new(JsonSopCodec),
            filesystem,
            partition,
            storage,
            config: StudyProcessConfig::default(),
        }
    }

    pub fn location(&self) -> StudyStorageLocation {
        StudyStorageLocation::new(
            self.storage.clone(),
            self.filesystem.clone(),
            self.partition.clone(),
        )
    }

    pub fn partition_root(&self) -> PathBuf {
        self.location().partition_root()
    }

    pub fn ingestion(&self) -> IngestionContext {
        IngestionContext {
            store: self.store.clone(),
            alerts: self.alerts.clone(),
            codec: self.codec.clone(),
            rules: Arc::new(NoopRulesEngine),
            config: self.config.clone(),
        }
    }

    pub fn maintenance(&self) -> MaintenanceContext {
        MaintenanceContext {
            store: self.store.clone(),
            alerts: self.alerts.clone(),
            codec: self.codec.clone(),
            maintenance: MaintenanceConfig::default(),
            study_process: self.config.clone(),
        }
    }

    pub fn processor(&self) -> StudyProcessItemProcessor {
        StudyProcessItemProcessor::new(self.ingestion())
    }

    /// Insert a pending study-process item and lock it the way the dispatcher would.
    pub async fn locked_item(&self) -> WorkQueueItem {
        let item = WorkQueueItem::new(
            self.partition.id,
            self.storage.id,
            WorkQueueType::StudyProcess,
            Duration::minutes(3),
        );
        self.store.insert_item(&item).await.expect("insert item");
        self.store
            .select_and_lock_due_item(PROCESSOR_ID, chrono::Utc::now())
            .await
            .expect("select item")
            .expect("item is due")
    }

    /// Write a received object at its final path and queue it on `item`.
    pub async fn receive(&self, item: &WorkQueueItem, file: &SopFile) -> WorkQueueUid {
        let path = self.location().sop_path(file.series_uid(), file.sop_uid());
        self.codec.save(file, &path).expect("save sop");
        let uid = WorkQueueUid::new(item.id, file.series_uid(), file.sop_uid());
        self.store.insert_uid(&uid).await.expect("insert uid");
        uid
    }

    /// Write a duplicate into the reconcile folder and queue it on `item`.
    pub async fn receive_duplicate(
        &self,
        item: &WorkQueueItem,
        file: &SopFile,
        policy: DuplicatePolicy,
    ) -> WorkQueueUid {
        let uid = WorkQueueUid::new(item.id, file.series_uid(), file.sop_uid()).duplicate(
            "dup-group",
            "dcm",
            Some(policy),
        );
        let path = self.location().duplicate_sop_path(&uid);
        self.codec.save(file, &path).expect("save duplicate");
        self.store.insert_uid(&uid).await.expect("insert uid");
        uid
    }

    /// Process a received object to completion so it becomes the stored copy.
    pub async fn store_base(&self, file: &SopFile) {
        let item = self.locked_item().await;
        self.receive(&item, file).await;
        self.processor().process(&item).await.expect("store base");
        self.store.delete_item(item.id).await.expect("drop item");
    }

    pub async fn current_storage(&self) -> StudyStorage {
        self.store
            .get_storage(self.storage.id)
            .await
            .expect("get storage")
            .expect("storage exists")
    }

    pub fn sop_path(&self, sop_uid: &str) -> PathBuf {
        self.location().sop_path(SERIES_UID, sop_uid)
    }
}

pub fn sop(sop_uid: &str) -> SopFile {
    sop_in(STUDY_UID, sop_uid)
}

pub fn sop_in(study_uid: &str, sop_uid: &str) -> SopFile {
    let mut dataset = Dataset::default();
    dataset.set(tags::STUDY_INSTANCE_UID, study_uid);
    dataset.set(tags::SERIES_INSTANCE_UID, SERIES_UID);
    dataset.set(tags::SOP_INSTANCE_UID, sop_uid);
    dataset.set(tags::MODALITY, "CT");
    dataset.set(tags::PATIENTS_NAME, "DOE^JANE");
    dataset.pixel_data = vec![1, 2, 3, 4, 4, 4, 4];
    SopFile::new(PathBuf::new(), TransferSyntax::ExplicitVrLittleEndian, dataset)
}

pub fn with_attribute(mut file: SopFile, keyword: &str, value: &str) -> SopFile {
    file.dataset.set(keyword, value);
    file
}

pub fn write_raw(path: &Path, contents: &[u8]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create parent");
    }
    std::fs::write(path, contents).expect("write file");
}
