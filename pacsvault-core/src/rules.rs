//! Seam to the rules engine that runs site rules at fixed trigger points.

use async_trait::async_trait;
use pacsvault_model::{PartitionId, StudyStorage, StudyStorageId};

use crate::error::Result;

/// Point in ingestion at which rules are evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleTrigger {
    /// After one image object has been merged into its study.
    SopProcessed,
    /// After an idle study item finished and is about to be finalized.
    StudyProcessed,
}

/// The object or study a rule evaluation concerns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleContext {
    pub partition_id: PartitionId,
    pub study_storage_id: StudyStorageId,
    pub study_uid: String,
    pub series_uid: Option<String>,
    pub sop_uid: Option<String>,
}

impl RuleContext {
    pub fn study(storage: &StudyStorage) -> Self {
        Self {
            partition_id: storage.partition_id,
            study_storage_id: storage.id,
            study_uid: storage.study_uid.clone(),
            series_uid: None,
            sop_uid: None,
        }
    }

    pub fn sop(storage: &StudyStorage, series_uid: &str, sop_uid: &str) -> Self {
        Self {
            series_uid: Some(series_uid.to_string()),
            sop_uid: Some(sop_uid.to_string()),
            ..Self::study(storage)
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RulesEngine: Send + Sync {
    /// Load the rules of `partition` that fire at `trigger`.
    async fn load(&self, partition: PartitionId, trigger: RuleTrigger) -> Result<()>;

    async fn apply(&self, trigger: RuleTrigger, context: &RuleContext) -> Result<()>;
}

/// Engine with no rules configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRulesEngine;

#[async_trait]
impl RulesEngine for NoopRulesEngine {
    async fn load(&self, _partition: PartitionId, _trigger: RuleTrigger) -> Result<()> {
        Ok(())
    }

    async fn apply(&self, _trigger: RuleTrigger, _context: &RuleContext) -> Result<()> {
        Ok(())
    }
}
