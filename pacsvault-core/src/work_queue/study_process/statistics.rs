use std::time::{Duration, Instant};

use super::duplicate::DuplicateAction;

/// Counters for one run of the study processor.
#[derive(Debug, Clone)]
pub struct StudyProcessStatistics {
    pub study_uid: String,
    pub objects_merged: usize,
    pub bytes_merged: u64,
    pub objects_discarded: usize,
    pub duplicates_deleted: usize,
    pub duplicates_accepted: usize,
    pub duplicates_reconciled: usize,
    pub failures: usize,
    started: Instant,
}

impl StudyProcessStatistics {
    pub fn new(study_uid: impl Into<String>) -> Self {
        Self {
            study_uid: study_uid.into(),
            objects_merged: 0,
            bytes_merged: 0,
            objects_discarded: 0,
            duplicates_deleted: 0,
            duplicates_accepted: 0,
            duplicates_reconciled: 0,
            failures: 0,
            started: Instant::now(),
        }
    }

    pub fn record_merge(&mut self, file_size: u64) {
        self.objects_merged += 1;
        self.bytes_merged += file_size;
    }

    pub fn record_duplicate(&mut self, action: DuplicateAction) {
        match action {
            DuplicateAction::Delete => self.duplicates_deleted += 1,
            DuplicateAction::Accept | DuplicateAction::AcceptAndResync => {
                self.duplicates_accepted += 1
            }
            DuplicateAction::Reconcile => self.duplicates_reconciled += 1,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn log(&self) {
        tracing::info!(
            target: "pacsvault::study_process",
            study_uid = %self.study_uid,
            merged = self.objects_merged,
            bytes = self.bytes_merged,
            discarded = self.objects_discarded,
            duplicates_deleted = self.duplicates_deleted,
            duplicates_accepted = self.duplicates_accepted,
            duplicates_reconciled = self.duplicates_reconciled,
            failures = self.failures,
            elapsed_ms = self.elapsed().as_millis() as u64,
            "study process run finished"
        );
    }
}
