mod support;

use std::fs;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use pacsvault_core::alerts::AlertCode;
use pacsvault_core::codec::{SopCodec, rle, tags};
use pacsvault_core::database::StoreOp;
use pacsvault_core::database::ports::{
    InstanceIndexRepository, ReconcileRepository, StudyStorageRepository, WorkQueueRepository,
};
use pacsvault_core::processing::ItemProcessor;
use pacsvault_core::rules::{RuleContext, RuleTrigger, RulesEngine};
use pacsvault_core::storage::StudyManifest;
use pacsvault_core::work_queue::study_process::context_id;
use pacsvault_core::work_queue::{IngestionContext, StudyProcessItemProcessor};
use pacsvault_model::{
    DuplicatePolicy, PartitionId, QueueStudyState, ReconcileAction, ReconcileHistory,
    StudyStatus, StudyStorage, TransferSyntax, WorkQueueItem, WorkQueueStatus,
};
use support::{Fixture, PROCESSOR_ID, SERIES_UID, STUDY_FOLDER, STUDY_UID, sop, sop_in};
use tokio_util::sync::CancellationToken;

async fn item_state(fx: &Fixture, item: &WorkQueueItem) -> Option<WorkQueueItem> {
    fx.store.get_item(item.id).await.expect("get item")
}

fn manifest(fx: &Fixture) -> StudyManifest {
    StudyManifest::load(&fx.location().manifest_path(), STUDY_UID).expect("load manifest")
}

/// Make a processed item due again with its expiration already passed.
async fn expire_and_relock(fx: &Fixture, item: &WorkQueueItem) -> WorkQueueItem {
    let mut current = item_state(fx, item).await.expect("item still queued");
    current.scheduled_time = Utc::now() - Duration::seconds(1);
    current.expiration_time = Utc::now() - Duration::seconds(1);
    fx.store.save_item(&current).await.expect("save item");
    fx.store
        .select_and_lock_due_item(PROCESSOR_ID, Utc::now())
        .await
        .expect("select")
        .expect("item due")
}

#[tokio::test]
async fn novel_objects_are_merged_and_item_finalizes_after_expiry() {
    let fx = Fixture::new().await;
    let item = fx.locked_item().await;
    for sop_uid in ["1.2.840.1.1.1", "1.2.840.1.1.2", "1.2.840.1.1.3"] {
        fx.receive(&item, &sop(sop_uid)).await;
    }

    fx.processor().process(&item).await.expect("first pass");

    let after = item_state(&fx, &item).await.expect("item kept");
    assert_eq!(after.status, WorkQueueStatus::Pending);
    assert!(fx.store.load_uids(item.id).await.unwrap().is_empty());
    assert_eq!(manifest(&fx).num_instances(), 3);
    let record = fx
        .store
        .load_study_record(fx.storage.id)
        .await
        .unwrap()
        .expect("study record");
    assert_eq!(record.num_instances, 3);
    assert_eq!(record.modalities, vec!["CT".to_string()]);

    let relocked = expire_and_relock(&fx, &item).await;
    fx.processor().process(&relocked).await.expect("final pass");

    assert!(item_state(&fx, &item).await.is_none());
    let storage = fx.current_storage().await;
    assert_eq!(storage.queue_state, QueueStudyState::Idle);
    assert!(storage.study_size_kb.unwrap_or_default() > 0);
}

#[tokio::test]
async fn idle_item_that_has_not_expired_stays_queued() {
    let fx = Fixture::new().await;
    let item = fx.locked_item().await;

    fx.processor().process(&item).await.expect("process");

    let after = item_state(&fx, &item).await.expect("item kept");
    assert_eq!(after.status, WorkQueueStatus::Idle);
    assert!(after.scheduled_time > Utc::now());
}

#[tokio::test]
async fn identical_duplicate_is_deleted_under_compare() {
    let fx = Fixture::new().await;
    let file = sop("1.2.840.1.1.1");
    fx.store_base(&file).await;
    let base_bytes = fs::read(fx.sop_path("1.2.840.1.1.1")).unwrap();

    let item = fx.locked_item().await;
    let uid = fx
        .receive_duplicate(&item, &file, DuplicatePolicy::Compare)
        .await;
    fx.processor().process(&item).await.expect("process");

    assert!(fx.store.load_uids(item.id).await.unwrap().is_empty());
    assert!(!fx.location().duplicate_sop_path(&uid).exists());
    assert!(!fx.location().duplicate_folder(&uid).exists());
    assert_eq!(fs::read(fx.sop_path("1.2.840.1.1.1")).unwrap(), base_bytes);
    assert!(fx.store.list_entries(fx.storage.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn differing_duplicate_is_reconciled_under_compare() {
    let fx = Fixture::new().await;
    let file = sop("1.2.840.1.1.1");
    fx.store_base(&file).await;
    let base_bytes = fs::read(fx.sop_path("1.2.840.1.1.1")).unwrap();

    let item = fx.locked_item().await;
    let changed = support::with_attribute(file, "AccessionNumber", "A-77");
    let uid = fx
        .receive_duplicate(&item, &changed, DuplicatePolicy::Compare)
        .await;
    fx.processor().process(&item).await.expect("process");

    assert!(fx.store.load_uids(item.id).await.unwrap().is_empty());
    assert_eq!(fs::read(fx.sop_path("1.2.840.1.1.1")).unwrap(), base_bytes);
    assert!(fx.location().duplicate_sop_path(&uid).exists());

    let records = fx.store.list_entries(fx.storage.id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].group_id, "dup-group");
    assert_eq!(records[0].uids[0].sop_uid, "1.2.840.1.1.1");
    assert!(
        records[0]
            .differences
            .iter()
            .any(|diff| diff.attribute == "AccessionNumber")
    );
}

#[tokio::test]
async fn duplicate_without_stored_copy_is_reconciled() {
    let fx = Fixture::new().await;
    let item = fx.locked_item().await;
    fx.receive_duplicate(&item, &sop("1.2.840.1.1.9"), DuplicatePolicy::OverwriteSop)
        .await;

    fx.processor().process(&item).await.expect("process");

    let records = fx.store.list_entries(fx.storage.id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].differences.is_empty());
    assert!(!fx.sop_path("1.2.840.1.1.9").exists());
}

#[tokio::test]
async fn compressed_duplicate_matching_after_decode_is_deleted() {
    let fx = Fixture::new().await;
    let file = sop("1.2.840.1.1.1");
    fx.store_base(&file).await;

    let mut compressed = file.clone();
    compressed.transfer_syntax = TransferSyntax::RleLossless;
    compressed.dataset.pixel_data = rle::encode(&file.dataset.pixel_data);

    let item = fx.locked_item().await;
    fx.receive_duplicate(&item, &compressed, DuplicatePolicy::Compare)
        .await;
    fx.processor().process(&item).await.expect("process");

    assert!(fx.store.list_entries(fx.storage.id).await.unwrap().is_empty());
    assert!(fx.store.load_uids(item.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn lossy_duplicate_is_reconciled_on_transfer_syntax() {
    let fx = Fixture::new().await;
    let file = sop("1.2.840.1.1.1");
    fx.store_base(&file).await;

    let mut lossy = file.clone();
    lossy.transfer_syntax = TransferSyntax::JpegBaseline;

    let item = fx.locked_item().await;
    fx.receive_duplicate(&item, &lossy, DuplicatePolicy::Compare)
        .await;
    fx.processor().process(&item).await.expect("process");

    let records = fx.store.list_entries(fx.storage.id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].differences.len(), 1);
    assert_eq!(records[0].differences[0].attribute, tags::TRANSFER_SYNTAX_UID);
}

#[tokio::test]
async fn overwrite_sop_replaces_artifact_and_reindexes_manifest() {
    let fx = Fixture::new().await;
    let file = sop("1.2.840.1.1.1");
    fx.store_base(&file).await;

    let item = fx.locked_item().await;
    let newer = support::with_attribute(file, "ImageComments", "corrected by modality");
    let uid = fx
        .receive_duplicate(&item, &newer, DuplicatePolicy::OverwriteSop)
        .await;
    fx.processor().process(&item).await.expect("process");

    let base_path = fx.sop_path("1.2.840.1.1.1");
    let stored = fx.codec.load(&base_path).unwrap();
    assert_eq!(stored.dataset.get("ImageComments"), Some("corrected by modality"));
    let size = fs::metadata(&base_path).unwrap().len();
    let manifest = manifest(&fx);
    let entry = manifest.instance(SERIES_UID, "1.2.840.1.1.1").unwrap();
    assert_eq!(entry.file_size, size);
    assert!(fx.store.load_uids(item.id).await.unwrap().is_empty());
    assert!(!fx.location().duplicate_sop_path(&uid).exists());
}

#[tokio::test]
async fn failed_overwrite_leaves_artifact_manifest_and_pending_record() {
    let fx = Fixture::new().await;
    let file = sop("1.2.840.1.1.1");
    fx.store_base(&file).await;
    let base_path = fx.sop_path("1.2.840.1.1.1");
    let base_bytes = fs::read(&base_path).unwrap();
    let manifest_before = manifest(&fx);

    let item = fx.locked_item().await;
    let newer = support::with_attribute(file, "ImageComments", "never lands");
    let uid = fx
        .receive_duplicate(&item, &newer, DuplicatePolicy::OverwriteSop)
        .await;
    fx.store.fail_next(StoreOp::InsertInstance, 1);

    fx.processor().process(&item).await.expect("process");

    assert_eq!(fs::read(&base_path).unwrap(), base_bytes);
    assert_eq!(manifest(&fx), manifest_before);
    assert!(fx.location().duplicate_sop_path(&uid).exists());
    let remaining = fx.store.load_uids(item.id).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, uid.id);

    let after = item_state(&fx, &item).await.expect("item kept");
    assert_eq!(after.status, WorkQueueStatus::Failed);
    assert_eq!(fx.alerts.with_code(AlertCode::FailedUpdateSop).len(), 1);
}

#[tokio::test]
async fn overwrite_and_update_database_refreshes_instance_row() {
    let fx = Fixture::new().await;
    let file = sop("1.2.840.1.1.1");
    fx.store_base(&file).await;

    let item = fx.locked_item().await;
    let mut newer = support::with_attribute(file, "ImageComments", "a much longer comment body");
    newer.dataset.set(tags::MODALITY, "MR");
    fx.receive_duplicate(&item, &newer, DuplicatePolicy::OverwriteSopAndUpdateDatabase)
        .await;
    fx.processor().process(&item).await.expect("process");

    let size = fs::metadata(fx.sop_path("1.2.840.1.1.1")).unwrap().len();
    let row = fx
        .store
        .get_instance(fx.storage.id, "1.2.840.1.1.1")
        .await
        .unwrap()
        .expect("instance row");
    assert_eq!(row.file_size, size);
    assert_eq!(row.modality.as_deref(), Some("MR"));
    let record = fx.store.load_study_record(fx.storage.id).await.unwrap().unwrap();
    assert_eq!(record.modalities, vec!["MR".to_string()]);
}

#[tokio::test]
async fn newer_report_is_stored_beside_the_original() {
    let fx = Fixture::new().await;
    let file = support::with_attribute(sop("1.2.840.1.1.1"), tags::INSTANCE_CREATION_DATE, "20240101");
    fx.store_base(&file).await;
    let base_path = fx.sop_path("1.2.840.1.1.1");
    let base_bytes = fs::read(&base_path).unwrap();

    let item = fx.locked_item().await;
    let older = support::with_attribute(file.clone(), tags::INSTANCE_CREATION_DATE, "20231201");
    fx.receive_duplicate(&item, &older, DuplicatePolicy::OverwriteReport)
        .await;
    fx.processor().process(&item).await.expect("older report");
    assert_eq!(fs::read(&base_path).unwrap(), base_bytes);

    let item = fx.locked_item().await;
    let newer = support::with_attribute(file, tags::INSTANCE_CREATION_DATE, "20240301");
    fx.receive_duplicate(&item, &newer, DuplicatePolicy::OverwriteReport)
        .await;
    fx.processor().process(&item).await.expect("newer report");
    assert_eq!(fs::read(&base_path).unwrap(), base_bytes);

    let revision_path =
        fx.location()
            .report_revision_path(SERIES_UID, "1.2.840.1.1.1", "20240301000000");
    let revision = fx.codec.load(&revision_path).expect("revision stored beside original");
    assert_eq!(revision.dataset.get(tags::INSTANCE_CREATION_DATE), Some("20240301"));
    let indexed = manifest(&fx)
        .instance(SERIES_UID, "1.2.840.1.1.1")
        .map(|entry| entry.file_size);
    assert_eq!(indexed, Some(fs::metadata(&revision_path).unwrap().len()));
    assert!(fx.store.load_uids(item.id).await.unwrap().is_empty());
    assert!(fx.store.list_entries(fx.storage.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn lossy_study_with_lossless_archive_fails_without_merging() {
    let fx = Fixture::new().await;
    let mut storage = fx.storage.clone();
    storage.status = StudyStatus::OnlineLossy;
    storage.latest_archive_lossless = Some(true);
    fx.store.insert_storage(&storage).await.unwrap();

    let item = fx.locked_item().await;
    fx.receive(&item, &sop("1.2.840.1.1.1")).await;
    fx.processor().process(&item).await.expect("process");

    let after = item_state(&fx, &item).await.expect("item kept");
    assert_eq!(after.status, WorkQueueStatus::Failed);
    assert_eq!(fx.store.load_uids(item.id).await.unwrap().len(), 1);
    assert!(!fx.location().manifest_path().exists());
    assert_eq!(fx.alerts.with_code(AlertCode::StudyLossyInconsistent).len(), 1);
    assert_eq!(fx.current_storage().await.queue_state, QueueStudyState::Idle);
}

/// Requests cancellation of the running processor after the first merge.
#[derive(Default)]
struct CancelAfterFirstMerge {
    token: OnceLock<CancellationToken>,
}

#[async_trait]
impl RulesEngine for CancelAfterFirstMerge {
    async fn load(&self, _partition: PartitionId, _trigger: RuleTrigger) -> pacsvault_core::Result<()> {
        Ok(())
    }

    async fn apply(&self, trigger: RuleTrigger, _context: &RuleContext) -> pacsvault_core::Result<()> {
        if trigger == RuleTrigger::SopProcessed
            && let Some(token) = self.token.get()
        {
            token.cancel();
        }
        Ok(())
    }
}

#[tokio::test]
async fn cancellation_stops_after_completed_objects() {
    let fx = Fixture::new().await;
    let rules = Arc::new(CancelAfterFirstMerge::default());
    let processor = StudyProcessItemProcessor::new(IngestionContext {
        rules: rules.clone(),
        ..fx.ingestion()
    });
    rules
        .token
        .set(processor.base().cancel_token())
        .expect("token set once");

    let item = fx.locked_item().await;
    for sop_uid in ["1.2.840.1.1.1", "1.2.840.1.1.2", "1.2.840.1.1.3"] {
        fx.receive(&item, &sop(sop_uid)).await;
    }
    processor.process(&item).await.expect("process");

    assert_eq!(manifest(&fx).num_instances(), 1);
    let remaining = fx.store.load_uids(item.id).await.unwrap();
    let remaining: Vec<_> = remaining.iter().map(|uid| uid.sop_uid.as_str()).collect();
    assert_eq!(remaining, vec!["1.2.840.1.1.2", "1.2.840.1.1.3"]);
    let after = item_state(&fx, &item).await.expect("item kept");
    assert_eq!(after.status, WorkQueueStatus::Pending);
    assert_eq!(after.failure_count, 0);
}

#[tokio::test]
async fn cancellation_before_any_merge_counts_as_failure() {
    let fx = Fixture::new().await;
    let processor = fx.processor();
    processor.base().cancel();

    let item = fx.locked_item().await;
    for sop_uid in ["1.2.840.1.1.1", "1.2.840.1.1.2"] {
        fx.receive(&item, &sop(sop_uid)).await;
    }
    processor.process(&item).await.expect("process");

    assert_eq!(manifest(&fx).num_instances(), 0);
    assert_eq!(fx.store.load_uids(item.id).await.unwrap().len(), 2);
    let after = item_state(&fx, &item).await.expect("item kept");
    assert_eq!(after.status, WorkQueueStatus::Pending);
    assert_eq!(after.failure_count, 1);
}

#[tokio::test]
async fn only_failed_duplicates_fail_the_item_fatally() {
    let fx = Fixture::new().await;
    let file = sop("1.2.840.1.1.1");
    fx.store_base(&file).await;

    let item = fx.locked_item().await;
    let uid = fx
        .receive_duplicate(&item, &file, DuplicatePolicy::Compare)
        .await;
    fs::remove_file(fx.location().duplicate_sop_path(&uid)).unwrap();

    fx.processor().process(&item).await.expect("process");

    let after = item_state(&fx, &item).await.expect("item kept");
    assert_eq!(after.status, WorkQueueStatus::Failed);
    assert!(
        after
            .failure_description
            .as_deref()
            .is_some_and(|reason| reason.starts_with("Io"))
    );
    let uids = fx.store.load_uids(item.id).await.unwrap();
    assert_eq!(uids.len(), 1);
    assert!(uids[0].failed);
    assert_eq!(fx.current_storage().await.queue_state, QueueStudyState::Idle);
}

#[tokio::test]
async fn failed_novel_and_duplicate_objects_fail_the_item_for_retry() {
    let fx = Fixture::new().await;
    let stored = sop("1.2.840.1.1.1");
    fx.store_base(&stored).await;

    let item = fx.locked_item().await;
    let dup = fx
        .receive_duplicate(&item, &stored, DuplicatePolicy::Compare)
        .await;
    fs::remove_file(fx.location().duplicate_sop_path(&dup)).unwrap();
    fx.receive(&item, &sop("1.2.840.1.1.2")).await;
    fs::remove_file(fx.sop_path("1.2.840.1.1.2")).unwrap();

    fx.processor().process(&item).await.expect("process");

    let after = item_state(&fx, &item).await.expect("item kept");
    assert_eq!(after.status, WorkQueueStatus::Pending);
    assert_eq!(after.failure_count, 1);
    let uids = fx.store.load_uids(item.id).await.unwrap();
    assert_eq!(uids.len(), 2);
    assert!(uids.iter().all(|uid| uid.failed));
}

#[tokio::test]
async fn unreadable_object_is_removed_and_counted_as_failure() {
    let fx = Fixture::new().await;
    let item = fx.locked_item().await;
    fx.receive(&item, &sop("1.2.840.1.1.1")).await;
    support::write_raw(&fx.sop_path("1.2.840.1.1.1"), b"not an image");

    fx.processor().process(&item).await.expect("process");

    assert!(!fx.sop_path("1.2.840.1.1.1").exists());
    assert!(fx.store.load_uids(item.id).await.unwrap().is_empty());
    let after = item_state(&fx, &item).await.expect("item kept");
    assert_eq!(after.status, WorkQueueStatus::Pending);
    assert_eq!(after.failure_count, 1);
    assert!(
        after
            .failure_description
            .as_deref()
            .is_some_and(|reason| reason.starts_with("Format"))
    );
}

#[tokio::test]
async fn study_locked_elsewhere_postpones_item() {
    let fx = Fixture::new().await;
    fx.store
        .set_queue_state(fx.storage.id, QueueStudyState::RestoreScheduled)
        .await
        .unwrap();

    let item = fx.locked_item().await;
    fx.receive(&item, &sop("1.2.840.1.1.1")).await;
    fx.processor().process(&item).await.expect("process");

    let after = item_state(&fx, &item).await.expect("item kept");
    assert_eq!(after.status, WorkQueueStatus::Pending);
    assert_eq!(after.failure_count, 0);
    assert!(after.processor_id.is_none());
    assert!(
        after
            .failure_description
            .as_deref()
            .is_some_and(|reason| reason.contains("locked by another processor"))
    );
    assert_eq!(fx.store.load_uids(item.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn reprocess_scheduled_study_postpones_item() {
    let fx = Fixture::new().await;
    fx.store
        .set_queue_state(fx.storage.id, QueueStudyState::ReprocessScheduled)
        .await
        .unwrap();

    let item = fx.locked_item().await;
    fx.processor().process(&item).await.expect("process");

    let after = item_state(&fx, &item).await.expect("item kept");
    assert_eq!(
        after.failure_description.as_deref(),
        Some("Study is scheduled for reprocess")
    );
    assert!(after.scheduled_time > Utc::now());
}

#[tokio::test]
async fn patient_name_variants_follow_the_stored_study() {
    let fx = Fixture::new().await;
    fx.store_base(&sop("1.2.840.1.1.1")).await;

    let item = fx.locked_item().await;
    let variant = support::with_attribute(sop("1.2.840.1.1.2"), tags::PATIENTS_NAME, "Doe^Jane^^ ");
    fx.receive(&item, &variant).await;
    fx.processor().process(&item).await.expect("process");

    let stored = fx.codec.load(&fx.sop_path("1.2.840.1.1.2")).unwrap();
    assert_eq!(stored.dataset.get(tags::PATIENTS_NAME), Some("DOE^JANE"));
}

#[tokio::test]
async fn discard_history_drops_objects_of_that_batch() {
    let fx = Fixture::new().await;
    let item = fx.locked_item().await;
    let file = sop("1.2.840.1.1.1");
    let uid = fx.receive(&item, &file).await;
    fx.store
        .insert_history(&ReconcileHistory {
            study_storage_id: fx.storage.id,
            context_id: context_id(&uid, &file, &item, &fx.partition.ae_title),
            action: ReconcileAction::Discard,
            recorded_at: Utc::now(),
        })
        .await
        .unwrap();

    fx.processor().process(&item).await.expect("process");

    assert!(fx.store.load_uids(item.id).await.unwrap().is_empty());
    assert!(manifest(&fx).is_empty());
}

#[tokio::test]
async fn merge_into_nearline_study_postpones_and_requests_restore() {
    let fx = Fixture::new().await;
    let mut target = StudyStorage::new(fx.partition.id, fx.filesystem.id, STUDY_FOLDER, "1.2.840.2");
    target.status = StudyStatus::Nearline;
    target.latest_archive_lossless = Some(true);
    fx.store.insert_storage(&target).await.unwrap();

    let item = fx.locked_item().await;
    let file = sop("1.2.840.1.1.1");
    let uid = fx.receive(&item, &file).await;
    fx.store
        .insert_history(&ReconcileHistory {
            study_storage_id: fx.storage.id,
            context_id: context_id(&uid, &file, &item, &fx.partition.ae_title),
            action: ReconcileAction::MergeInto {
                target_study_uid: "1.2.840.2".to_string(),
            },
            recorded_at: Utc::now(),
        })
        .await
        .unwrap();

    fx.processor().process(&item).await.expect("process");

    let after = item_state(&fx, &item).await.expect("item kept");
    assert_eq!(after.status, WorkQueueStatus::Pending);
    assert!(
        after
            .failure_description
            .as_deref()
            .is_some_and(|reason| reason.contains("Restore has been requested"))
    );
    let target = fx.store.get_storage(target.id).await.unwrap().unwrap();
    assert!(target.restore_requested);
    assert_eq!(fx.store.load_uids(item.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn merge_into_unrestorable_study_fails_the_item() {
    let fx = Fixture::new().await;
    let mut target = StudyStorage::new(fx.partition.id, fx.filesystem.id, STUDY_FOLDER, "1.2.840.2");
    target.status = StudyStatus::Nearline;
    fx.store.insert_storage(&target).await.unwrap();

    let item = fx.locked_item().await;
    let file = sop("1.2.840.1.1.1");
    let uid = fx.receive(&item, &file).await;
    fx.store
        .insert_history(&ReconcileHistory {
            study_storage_id: fx.storage.id,
            context_id: context_id(&uid, &file, &item, &fx.partition.ae_title),
            action: ReconcileAction::MergeInto {
                target_study_uid: "1.2.840.2".to_string(),
            },
            recorded_at: Utc::now(),
        })
        .await
        .unwrap();

    fx.processor().process(&item).await.expect("process");

    let after = item_state(&fx, &item).await.expect("item kept");
    assert_eq!(after.status, WorkQueueStatus::Failed);
    assert!(
        after
            .failure_description
            .as_deref()
            .is_some_and(|reason| reason.contains("could not be restored"))
    );
    let target = fx.store.get_storage(target.id).await.unwrap().unwrap();
    assert!(!target.restore_requested);
    assert_eq!(fx.store.load_uids(item.id).await.unwrap().len(), 1);
    assert!(fx.sop_path("1.2.840.1.1.1").exists());
}

#[tokio::test]
async fn merge_into_online_study_moves_the_object() {
    let fx = Fixture::new().await;
    let target = StudyStorage::new(fx.partition.id, fx.filesystem.id, STUDY_FOLDER, "1.2.840.2");
    fx.store.insert_storage(&target).await.unwrap();

    let item = fx.locked_item().await;
    let file = sop_in(STUDY_UID, "1.2.840.1.1.1");
    let uid = fx.receive(&item, &file).await;
    fx.store
        .insert_history(&ReconcileHistory {
            study_storage_id: fx.storage.id,
            context_id: context_id(&uid, &file, &item, &fx.partition.ae_title),
            action: ReconcileAction::MergeInto {
                target_study_uid: "1.2.840.2".to_string(),
            },
            recorded_at: Utc::now(),
        })
        .await
        .unwrap();

    fx.processor().process(&item).await.expect("process");

    assert!(!fx.sop_path("1.2.840.1.1.1").exists());
    let target_item = fx
        .store
        .find_item_for_study(target.id, pacsvault_model::WorkQueueType::StudyProcess)
        .await
        .unwrap()
        .expect("target item");
    let moved = fx.store.load_uids(target_item.id).await.unwrap();
    assert_eq!(moved.len(), 1);
    assert_eq!(moved[0].sop_uid, "1.2.840.1.1.1");
}
