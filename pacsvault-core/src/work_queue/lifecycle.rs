//! State transitions of an ingestion work item after a run.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use pacsvault_model::{QueueStudyState, WorkQueueItem, WorkQueueStatus};

use crate::config::StudyProcessConfig;
use crate::database::PacsStore;
use crate::error::Result;

/// What to do with an item after a successful run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostProcessing {
    /// Nothing left to do: remove the item and release the study.
    Complete,
    /// Objects were merged; run again soon for late arrivals.
    Pending,
    /// No objects: complete when expired, otherwise wait.
    Idle,
    /// No objects: wait, but keep the item even when it has expired.
    IdleNoDelete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Terminal; the item stops being scheduled.
    Fatal,
    /// Retried until `max_failure_count` is reached.
    NonFatal,
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureType::Fatal => f.write_str("fatal"),
            FailureType::NonFatal => f.write_str("non-fatal"),
        }
    }
}

/// Applies postpone/complete/fail transitions to work items.
#[derive(Clone)]
pub struct ItemLifecycle {
    store: Arc<dyn PacsStore>,
    config: StudyProcessConfig,
}

impl fmt::Debug for ItemLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ItemLifecycle")
            .field("config", &self.config)
            .finish()
    }
}

impl ItemLifecycle {
    pub fn new(store: Arc<dyn PacsStore>, config: StudyProcessConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &StudyProcessConfig {
        &self.config
    }

    /// Put the item back for a later attempt without counting a failure.
    pub async fn postpone(&self, item: &mut WorkQueueItem, reason: &str) -> Result<()> {
        let scheduled = Utc::now() + self.config.postpone_delay();
        item.status = WorkQueueStatus::Pending;
        item.processor_id = None;
        item.scheduled_time = scheduled;
        item.expiration_time = scheduled + self.config.postpone_expiry();
        item.failure_description = Some(reason.to_string());
        tracing::info!(
            target: "pacsvault::work_queue",
            item = %item.id,
            %scheduled,
            reason,
            "work item postponed"
        );
        self.store.save_item(item).await
    }

    /// Returns the transition actually applied.
    pub async fn post_process(
        &self,
        item: &mut WorkQueueItem,
        outcome: PostProcessing,
    ) -> Result<PostProcessing> {
        let now = Utc::now();
        let outcome = match outcome {
            PostProcessing::Idle if item.is_expired(now) => PostProcessing::Complete,
            other => other,
        };

        match outcome {
            PostProcessing::Complete => {
                self.store.delete_item(item.id).await?;
                self.store
                    .set_queue_state(item.study_storage_id, QueueStudyState::Idle)
                    .await?;
                item.status = WorkQueueStatus::Completed;
                item.processor_id = None;
            }
            PostProcessing::Pending => {
                item.status = WorkQueueStatus::Pending;
                item.processor_id = None;
                item.scheduled_time = now + self.config.pending_delay();
                item.expiration_time = item.scheduled_time + self.config.expiration();
                self.store.save_item(item).await?;
            }
            PostProcessing::Idle | PostProcessing::IdleNoDelete => {
                item.status = WorkQueueStatus::Idle;
                item.processor_id = None;
                item.scheduled_time = now + self.config.idle_delay();
                self.store.save_item(item).await?;
            }
        }

        tracing::debug!(
            target: "pacsvault::work_queue",
            item = %item.id,
            ?outcome,
            status = %item.status,
            "work item post-processed"
        );
        Ok(outcome)
    }

    pub async fn fail(
        &self,
        item: &mut WorkQueueItem,
        failure: FailureType,
        reason: &str,
    ) -> Result<()> {
        item.processor_id = None;
        item.failure_description = Some(reason.to_string());

        let terminal = match failure {
            FailureType::Fatal => true,
            FailureType::NonFatal => {
                item.failure_count += 1;
                item.failure_count >= self.config.max_failure_count
            }
        };

        if terminal {
            item.status = WorkQueueStatus::Failed;
            self.store.save_item(item).await?;
            self.store
                .set_queue_state(item.study_storage_id, QueueStudyState::Idle)
                .await?;
        } else {
            item.status = WorkQueueStatus::Pending;
            item.scheduled_time = Utc::now() + self.config.retry_delay();
            self.store.save_item(item).await?;
        }

        tracing::warn!(
            target: "pacsvault::work_queue",
            item = %item.id,
            %failure,
            failure_count = item.failure_count,
            status = %item.status,
            reason,
            "work item failed"
        );
        Ok(())
    }
}
