//! Study ingestion: merges the pending objects of a work item into their
//! study, resolving duplicates along the way.

mod duplicate;
pub mod preprocess;
mod statistics;

pub use duplicate::DuplicateAction;
pub use preprocess::{PreProcessOutcome, SopPreProcessor, context_id, normalize_patient_name};
pub use statistics::StudyProcessStatistics;

use std::fs;
use std::io;
use std::path::Path;

use async_trait::async_trait;
use pacsvault_model::{
    InstanceRecord, QueueStudyState, StudyStatus, StudyStorage, WorkQueueItem, WorkQueueUid,
};

use super::lifecycle::{FailureType, ItemLifecycle, PostProcessing};
use super::IngestionContext;
use crate::alerts::{Alert, AlertCode};
use crate::codec::SopFile;
use crate::command::{
    CommandProcessor, DeleteWorkQueueUidCommand, InsertInstanceCommand,
    InsertManifestEntryCommand,
};
use crate::error::{PacsError, Result};
use crate::processing::{ItemProcessor, ItemProcessorBase};
use crate::rules::{RuleContext, RuleTrigger};
use crate::storage::{SharedManifest, StorageLocator, StudyStorageLocation};

/// Processes `StudyProcess` work items.
#[derive(Debug)]
pub struct StudyProcessItemProcessor {
    base: ItemProcessorBase,
    context: IngestionContext,
    locator: StorageLocator,
    lifecycle: ItemLifecycle,
}

impl StudyProcessItemProcessor {
    pub fn new(context: IngestionContext) -> Self {
        Self {
            base: ItemProcessorBase::new(
                "StudyProcess",
                context.store.clone(),
                context.alerts.clone(),
            ),
            locator: StorageLocator::new(context.store.clone()),
            lifecycle: ItemLifecycle::new(context.store.clone(), context.config.clone()),
            context,
        }
    }

    pub fn base(&self) -> &ItemProcessorBase {
        &self.base
    }

    /// Take the study for processing, postponing the item when another
    /// processor holds it. Returns the location to work in.
    async fn can_start(
        &self,
        item: &mut WorkQueueItem,
        storage: &StudyStorage,
    ) -> Result<Option<StudyStorageLocation>> {
        if storage.queue_state == QueueStudyState::ReprocessScheduled {
            self.lifecycle
                .postpone(item, "Study is scheduled for reprocess")
                .await?;
            return Ok(None);
        }

        if storage.queue_state != QueueStudyState::ProcessingScheduled {
            let outcome = self
                .context
                .store
                .lock_study(storage.id, QueueStudyState::ProcessingScheduled)
                .await?;
            if !outcome.acquired {
                let reason = format!(
                    "Study is being locked by another processor: {}",
                    outcome.reason.as_deref().unwrap_or("unknown reason")
                );
                self.lifecycle.postpone(item, &reason).await?;
                return Ok(None);
            }
        }

        match self.locator.locate_writable(storage.id).await {
            Ok(location) => Ok(Some(location)),
            Err(PacsError::NotFound(detail)) => {
                tracing::warn!(
                    target: "pacsvault::study_process",
                    item = %item.id,
                    %detail,
                    "no writable storage location"
                );
                self.lifecycle
                    .postpone(item, "Unable to find writeable storage location")
                    .await?;
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Patient name of one stored instance, used as the normalisation reference.
    async fn reference_patient_name(&self, location: &StudyStorageLocation) -> Result<Option<String>> {
        let index = self.context.store.load_instance_index(location.id()).await?;
        let Some(first) = index.first() else {
            return Ok(None);
        };
        let path = location.sop_path(&first.series_uid, &first.sop_uid);
        match self.context.codec.load(&path) {
            Ok(file) => Ok(file
                .dataset
                .get(crate::codec::tags::PATIENTS_NAME)
                .map(str::to_string)),
            Err(err) => {
                tracing::debug!(
                    target: "pacsvault::study_process",
                    path = %path.display(),
                    error = %err,
                    "no reference patient name"
                );
                Ok(None)
            }
        }
    }

    async fn finish(
        &self,
        item: &mut WorkQueueItem,
        location: &StudyStorageLocation,
        uids: &[WorkQueueUid],
        outcome: RunOutcome,
    ) -> Result<()> {
        let store = &self.context.store;

        if uids.is_empty() {
            if item.is_expired(chrono::Utc::now()) {
                let context = RuleContext::study(&location.storage);
                self.context
                    .rules
                    .load(location.storage.partition_id, RuleTrigger::StudyProcessed)
                    .await?;
                if let Err(err) = self
                    .context
                    .rules
                    .apply(RuleTrigger::StudyProcessed, &context)
                    .await
                {
                    tracing::warn!(
                        target: "pacsvault::study_process",
                        study_uid = %location.study_uid(),
                        error = %err,
                        "study rules failed"
                    );
                }
                tracing::info!(
                    target: "pacsvault::study_process",
                    study_uid = %location.study_uid(),
                    filesystem = %location.filesystem.description,
                    "study idle and expired; finalizing"
                );
                self.lifecycle
                    .post_process(item, PostProcessing::Complete)
                    .await?;
                let size = self.base.estimate_folder_size(location)?;
                store
                    .update_study_size(location.id(), size.div_ceil(1024) as i64)
                    .await?;
            } else {
                self.lifecycle
                    .post_process(item, PostProcessing::IdleNoDelete)
                    .await?;
            }
            return Ok(());
        }

        if outcome.cancelled {
            tracing::info!(
                target: "pacsvault::study_process",
                item = %item.id,
                merged = outcome.successful,
                "run ended by cancellation"
            );
        }

        if outcome.successful > 0 {
            self.lifecycle
                .post_process(item, PostProcessing::Pending)
                .await?;
            return Ok(());
        }

        let remaining = store.load_uids(item.id).await?;
        let failed: Vec<_> = remaining.iter().filter(|uid| uid.failed).collect();
        let reason = item
            .failure_description
            .clone()
            .unwrap_or_else(|| "No objects could be processed".to_string());
        if !failed.is_empty() && failed.iter().all(|uid| uid.duplicate) {
            self.lifecycle
                .fail(item, FailureType::Fatal, &reason)
                .await
        } else {
            self.lifecycle
                .fail(item, FailureType::NonFatal, &reason)
                .await
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct RunOutcome {
    successful: usize,
    cancelled: bool,
}

#[async_trait]
impl ItemProcessor<WorkQueueItem> for StudyProcessItemProcessor {
    fn name(&self) -> &str {
        self.base.name()
    }

    async fn process(&self, entry: &WorkQueueItem) -> Result<()> {
        let store = &self.context.store;
        let mut item = entry.clone();
        let storage = store
            .get_storage(item.study_storage_id)
            .await?
            .ok_or_else(|| PacsError::NotFound(format!("study storage {}", item.study_storage_id)))?;

        let Some(location) = self.can_start(&mut item, &storage).await? else {
            return Ok(());
        };

        if storage.status == StudyStatus::OnlineLossy && storage.latest_archive_lossless == Some(true) {
            let reason = format!(
                "Study {} is lossy online but its latest archive is lossless",
                storage.study_uid
            );
            self.base.alerts().raise(Alert::application_error(
                self.base.name(),
                AlertCode::StudyLossyInconsistent,
                reason.clone(),
            ));
            return self.lifecycle.fail(&mut item, FailureType::Fatal, &reason).await;
        }

        let uids = store.load_uids(item.id).await?;
        self.context
            .rules
            .load(item.partition_id, RuleTrigger::SopProcessed)
            .await?;

        let manifest = self.base.load_shared_manifest(&location)?;
        let reference_name = self.reference_patient_name(&location).await?;
        let mut run = StudyRun {
            processor: self,
            preprocessor: SopPreProcessor::new(self.context.clone(), reference_name),
            stats: StudyProcessStatistics::new(location.study_uid()),
            item,
            location,
            manifest,
        };

        let result = run.process_uids(&uids).await;
        run.stats.log();
        let StudyRun {
            mut item, location, ..
        } = run;

        match result {
            Ok(outcome) => self.finish(&mut item, &location, &uids, outcome).await,
            Err(PacsError::StudyNearline {
                study_uid,
                restore_requested: true,
            }) => {
                let reason = format!(
                    "Unable to auto-reconcile at this time: the target study {study_uid} is not online yet. Restore has been requested."
                );
                self.lifecycle.postpone(&mut item, &reason).await
            }
            Err(PacsError::StudyNearline {
                study_uid,
                restore_requested: false,
            }) => {
                let reason = format!(
                    "Unable to auto-reconcile: the target study {study_uid} is not online and could not be restored."
                );
                self.lifecycle
                    .fail(&mut item, FailureType::Fatal, &reason)
                    .await
            }
            Err(err @ PacsError::BatchFailed { .. }) => {
                let reason = format!("{}: {err}", err.kind());
                self.lifecycle
                    .fail(&mut item, FailureType::Fatal, &reason)
                    .await
            }
            Err(err) => Err(err),
        }
    }

    fn supports_cancel(&self) -> bool {
        true
    }

    fn cancel(&self) {
        self.base.cancel();
    }
}

/// State of one pass over a work item's objects.
struct StudyRun<'a> {
    processor: &'a StudyProcessItemProcessor,
    item: WorkQueueItem,
    location: StudyStorageLocation,
    manifest: SharedManifest,
    preprocessor: SopPreProcessor,
    stats: StudyProcessStatistics,
}

impl StudyRun<'_> {
    fn context(&self) -> &IngestionContext {
        &self.processor.context
    }

    fn base(&self) -> &ItemProcessorBase {
        &self.processor.base
    }

    async fn process_uids(&mut self, uids: &[WorkQueueUid]) -> Result<RunOutcome> {
        let mut outcome = RunOutcome::default();
        for uid in uids {
            if uid.failed {
                continue;
            }
            if self.base().cancel_pending() {
                tracing::info!(
                    target: "pacsvault::study_process",
                    item = %self.item.id,
                    processed = outcome.successful,
                    "cancelled; stopping after partial progress"
                );
                outcome.cancelled = true;
                break;
            }

            let result = if uid.duplicate {
                self.process_duplicate(uid).await
            } else {
                self.process_sop(uid).await
            };

            match result {
                Ok(()) => outcome.successful += 1,
                Err(err @ (PacsError::StudyNearline { .. } | PacsError::BatchFailed { .. })) => {
                    return Err(err);
                }
                Err(err) => self.record_failure(uid, err).await?,
            }

            if uid.duplicate {
                self.cleanup_duplicate_folders(uid);
            }
        }
        Ok(outcome)
    }

    /// Merge a newly received object stored at its final path.
    async fn process_sop(&mut self, uid: &WorkQueueUid) -> Result<()> {
        let path = self.location.sop_path(&uid.series_uid, &uid.sop_uid);
        let mut file = self.context().codec.load(&path)?;

        match self
            .preprocessor
            .apply(&self.location, &self.item, uid, &mut file)
            .await?
        {
            PreProcessOutcome::Discard { reason } => {
                tracing::info!(
                    target: "pacsvault::study_process",
                    sop_uid = %uid.sop_uid,
                    %reason,
                    "object discarded"
                );
                self.context().store.delete_uid(uid.id).await?;
                self.stats.objects_discarded += 1;
                return Ok(());
            }
            PreProcessOutcome::Moved { .. } => {}
            PreProcessOutcome::Keep { modified: true } => {
                self.context().codec.save(&file, &path)?;
            }
            PreProcessOutcome::Keep { modified: false } => {}
        }

        if file.study_uid() != self.location.study_uid() {
            tracing::info!(
                target: "pacsvault::study_process",
                sop_uid = %uid.sop_uid,
                object_study = %file.study_uid(),
                study_uid = %self.location.study_uid(),
                "object belongs to another study; removing it here"
            );
            self.context().store.delete_uid(uid.id).await?;
            remove_file_if_exists(&path)?;
            return Ok(());
        }

        let record = instance_record(&self.location, &file, &path)?;
        let file_size = record.file_size;
        let store = self.context().store.clone();
        let mut batch = CommandProcessor::new(format!("Process SOP {}", uid.sop_uid));
        batch
            .add_command(InsertManifestEntryCommand::new(
                self.manifest.clone(),
                self.location.manifest_path(),
                file.clone(),
                &path,
            ))
            .add_command(InsertInstanceCommand::new(store.clone(), record))
            .add_command(DeleteWorkQueueUidCommand::new(store, uid.clone()));
        if !batch.execute().await {
            return Err(batch.take_failure().unwrap_or_else(|| {
                PacsError::Internal(format!("batch '{}' failed", batch.description()))
            }));
        }

        let rule_context =
            RuleContext::sop(&self.location.storage, file.series_uid(), file.sop_uid());
        if let Err(err) = self
            .context()
            .rules
            .apply(RuleTrigger::SopProcessed, &rule_context)
            .await
        {
            tracing::warn!(
                target: "pacsvault::study_process",
                sop_uid = %uid.sop_uid,
                error = %err,
                "SOP rules failed"
            );
        }
        self.stats.record_merge(file_size);
        Ok(())
    }

    /// Note the failure on the item and the object, then move on.
    async fn record_failure(&mut self, uid: &WorkQueueUid, err: PacsError) -> Result<()> {
        let description = format!("{}: {err}", err.kind());
        tracing::error!(
            target: "pacsvault::study_process",
            item = %self.item.id,
            study_uid = %self.location.study_uid(),
            series_uid = %uid.series_uid,
            sop_uid = %uid.sop_uid,
            duplicate = uid.duplicate,
            error = %err,
            "failed to process object"
        );
        self.stats.failures += 1;

        let store = self.context().store.clone();
        self.item.failure_description = Some(description);
        store.save_item(&self.item).await?;

        if let PacsError::Format { path, .. } = &err {
            let artifact = self.artifact_path(uid);
            if Path::new(path) == artifact {
                remove_file_if_exists(&artifact)?;
                return store.delete_uid(uid.id).await;
            }
        }

        let mut failed = uid.clone();
        failed.failed = true;
        failed.failure_count += 1;
        store.update_uid(&failed).await
    }

    fn artifact_path(&self, uid: &WorkQueueUid) -> std::path::PathBuf {
        if uid.duplicate {
            self.location.duplicate_sop_path(uid)
        } else {
            self.location.sop_path(&uid.series_uid, &uid.sop_uid)
        }
    }
}

fn instance_record(location: &StudyStorageLocation, file: &SopFile, path: &Path) -> Result<InstanceRecord> {
    Ok(InstanceRecord {
        study_storage_id: location.id(),
        series_uid: file.series_uid().to_string(),
        sop_uid: file.sop_uid().to_string(),
        transfer_syntax: file.transfer_syntax,
        file_size: fs::metadata(path)?.len(),
        modality: file.modality().map(str::to_string),
    })
}

fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use pacsvault_model::{Filesystem, ServerPartition, TransferSyntax, WorkQueueType};
    use tempfile::TempDir;

    use super::*;
    use crate::alerts::RecordingAlertSink;
    use crate::codec::{Dataset, JsonSopCodec, SopCodec, tags};
    use crate::config::StudyProcessConfig;
    use crate::database::InMemoryStore;
    use crate::database::ports::{FilesystemRepository, StudyStorageRepository, WorkQueueRepository};
    use crate::rules::MockRulesEngine;
    use crate::storage::StudyManifest;

    const STUDY_UID: &str = "1.2.840.7";
    const SERIES_UID: &str = "1.2.840.7.1";

    struct Harness {
        _dir: TempDir,
        store: Arc<InMemoryStore>,
        location: StudyStorageLocation,
    }

    async fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let filesystem = Filesystem::new(dir.path(), "rules");
        let partition = ServerPartition::new("RULES", "rules");
        let storage = StudyStorage::new(partition.id, filesystem.id, "20240301", STUDY_UID);
        store.insert_filesystem(&filesystem).await.unwrap();
        store.insert_partition(&partition).await.unwrap();
        store.insert_storage(&storage).await.unwrap();
        Harness {
            _dir: dir,
            store,
            location: StudyStorageLocation::new(storage, filesystem, partition),
        }
    }

    fn processor(harness: &Harness, rules: MockRulesEngine) -> StudyProcessItemProcessor {
        StudyProcessItemProcessor::new(IngestionContext {
            store: harness.store.clone(),
            alerts: Arc::new(RecordingAlertSink::new()),
            codec: Arc::new(JsonSopCodec),
            rules: Arc::new(rules),
            config: StudyProcessConfig::default(),
        })
    }

    async fn queue_item(harness: &Harness, expire_after: Duration) -> WorkQueueItem {
        let storage = &harness.location.storage;
        let item = WorkQueueItem::new(
            storage.partition_id,
            storage.id,
            WorkQueueType::StudyProcess,
            expire_after,
        );
        harness.store.insert_item(&item).await.unwrap();
        harness
            .store
            .select_and_lock_due_item("rules-node", Utc::now())
            .await
            .unwrap()
            .unwrap()
    }

    async fn receive(harness: &Harness, item: &WorkQueueItem, sop_uid: &str) {
        let mut dataset = Dataset::default();
        dataset.set(tags::STUDY_INSTANCE_UID, STUDY_UID);
        dataset.set(tags::SERIES_INSTANCE_UID, SERIES_UID);
        dataset.set(tags::SOP_INSTANCE_UID, sop_uid);
        let file = SopFile::new(
            std::path::PathBuf::new(),
            TransferSyntax::ExplicitVrLittleEndian,
            dataset,
        );
        JsonSopCodec
            .save(&file, &harness.location.sop_path(SERIES_UID, sop_uid))
            .unwrap();
        harness
            .store
            .insert_uid(&WorkQueueUid::new(item.id, SERIES_UID, sop_uid))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn sop_rules_run_per_merged_object_and_failures_are_ignored() {
        let harness = harness().await;
        let item = queue_item(&harness, Duration::minutes(3)).await;
        receive(&harness, &item, "1.2.840.7.1.1").await;
        receive(&harness, &item, "1.2.840.7.1.2").await;

        let mut rules = MockRulesEngine::new();
        rules
            .expect_load()
            .withf(|_, trigger| *trigger == RuleTrigger::SopProcessed)
            .times(1)
            .returning(|_, _| Ok(()));
        rules
            .expect_apply()
            .withf(|trigger, context| {
                *trigger == RuleTrigger::SopProcessed
                    && context.sop_uid.as_deref() == Some("1.2.840.7.1.1")
            })
            .times(1)
            .returning(|_, _| Err(PacsError::Internal("rule blew up".into())));
        rules
            .expect_apply()
            .withf(|trigger, context| {
                *trigger == RuleTrigger::SopProcessed
                    && context.sop_uid.as_deref() == Some("1.2.840.7.1.2")
            })
            .times(1)
            .returning(|_, _| Ok(()));

        processor(&harness, rules).process(&item).await.unwrap();

        assert!(harness.store.load_uids(item.id).await.unwrap().is_empty());
        let manifest =
            StudyManifest::load(&harness.location.manifest_path(), STUDY_UID).unwrap();
        assert_eq!(manifest.num_instances(), 2);
    }

    #[tokio::test]
    async fn study_rules_run_once_when_an_idle_item_expires() {
        let harness = harness().await;
        let item = queue_item(&harness, Duration::seconds(-1)).await;

        let mut rules = MockRulesEngine::new();
        rules
            .expect_load()
            .withf(|_, trigger| *trigger == RuleTrigger::SopProcessed)
            .times(1)
            .returning(|_, _| Ok(()));
        rules
            .expect_load()
            .withf(|_, trigger| *trigger == RuleTrigger::StudyProcessed)
            .times(1)
            .returning(|_, _| Ok(()));
        rules
            .expect_apply()
            .withf(|trigger, context| {
                *trigger == RuleTrigger::StudyProcessed && context.sop_uid.is_none()
            })
            .times(1)
            .returning(|_, _| Ok(()));

        processor(&harness, rules).process(&item).await.unwrap();

        assert!(harness.store.get_item(item.id).await.unwrap().is_none());
    }
}
