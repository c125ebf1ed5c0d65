use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Global knobs for the processing core.
///
/// All fields carry defaults so a deployment only has to name what it changes.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PacsConfig {
    /// Dispatcher that runs scheduled maintenance entries.
    pub service_lock: DispatcherConfig,
    /// Dispatcher that runs ingestion work items.
    pub work_queue: DispatcherConfig,
    /// Lifecycle policy for ingestion work items.
    pub study_process: StudyProcessConfig,
    /// Reschedule policy for the maintenance processors.
    pub maintenance: MaintenanceConfig,
}

impl Default for PacsConfig {
    fn default() -> Self {
        Self {
            service_lock: DispatcherConfig::default(),
            work_queue: DispatcherConfig {
                concurrency: 4,
                ..DispatcherConfig::default()
            },
            study_process: StudyProcessConfig::default(),
            maintenance: MaintenanceConfig::default(),
        }
    }
}

impl PacsConfig {
    /// Stamp the same processor identity on both dispatchers.
    pub fn with_processor_id(mut self, processor_id: impl Into<String>) -> Self {
        let processor_id = processor_id.into();
        self.service_lock.processor_id = processor_id.clone();
        self.work_queue.processor_id = processor_id;
        self
    }
}

/// Poll loop and worker pool tuning for one dispatcher.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Identity written into locked rows. Orphaned locks carrying this id are
    /// cleared when the dispatcher starts, so it must be stable across restarts
    /// of the same node and unique across nodes sharing a store.
    pub processor_id: String,
    /// Maximum number of entries processed concurrently.
    pub concurrency: usize,
    /// Wait between polls when nothing is due (ms).
    pub idle_poll_ms: u64,
    /// Wait between polls when the pool is full (ms).
    pub saturated_poll_ms: u64,
    /// Backoff after a store error while polling (ms).
    pub error_retry_ms: u64,
    /// Delay between attempts to release a failed entry (ms).
    pub release_retry_ms: u64,
    /// Reschedule applied when no processor can be built for an entry (secs).
    pub unregistered_reschedule_secs: i64,
    /// Reschedule applied to a maintenance entry whose processor failed (secs).
    pub failure_reschedule_secs: i64,
    /// Upper bound on waiting for in-flight work at shutdown (ms). Zero skips draining.
    pub drain_timeout_ms: u64,
}

pub const DEFAULT_IDLE_POLL_MS: u64 = 10_000;
pub const DEFAULT_SATURATED_POLL_MS: u64 = 5_000;
pub const DEFAULT_ERROR_RETRY_MS: u64 = 3_000;
pub const DEFAULT_RELEASE_RETRY_MS: u64 = 2_000;
pub const DEFAULT_UNREGISTERED_RESCHEDULE_SECS: i64 = 10 * 60;

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            processor_id: default_processor_id(),
            concurrency: 1,
            idle_poll_ms: DEFAULT_IDLE_POLL_MS,
            saturated_poll_ms: DEFAULT_SATURATED_POLL_MS,
            error_retry_ms: DEFAULT_ERROR_RETRY_MS,
            release_retry_ms: DEFAULT_RELEASE_RETRY_MS,
            unregistered_reschedule_secs: DEFAULT_UNREGISTERED_RESCHEDULE_SECS,
            failure_reschedule_secs: DEFAULT_UNREGISTERED_RESCHEDULE_SECS,
            drain_timeout_ms: 30_000,
        }
    }
}

impl DispatcherConfig {
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn saturated_poll(&self) -> Duration {
        Duration::from_millis(self.saturated_poll_ms)
    }

    pub fn error_retry(&self) -> Duration {
        Duration::from_millis(self.error_retry_ms)
    }

    pub fn release_retry(&self) -> Duration {
        Duration::from_millis(self.release_retry_ms)
    }

    pub fn unregistered_reschedule(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.unregistered_reschedule_secs)
    }

    pub fn failure_reschedule(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.failure_reschedule_secs)
    }

    pub fn drain_timeout(&self) -> Option<Duration> {
        (self.drain_timeout_ms > 0).then(|| Duration::from_millis(self.drain_timeout_ms))
    }
}

fn default_processor_id() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "pacsvault".to_string())
}

/// Scheduling policy applied to ingestion work items after each run.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StudyProcessConfig {
    /// Delay before a postponed item is retried (secs).
    pub postpone_delay_secs: i64,
    /// Extra window added past the postponed schedule before the item expires (secs).
    pub postpone_expiry_secs: i64,
    /// Delay before an item that still has objects in flight runs again (secs).
    pub pending_delay_secs: i64,
    /// Delay before an idle item is polled again (secs).
    pub idle_delay_secs: i64,
    /// How long an item stays alive without new objects (secs).
    pub expiration_secs: i64,
    /// Delay before a non-fatal failure is retried (secs).
    pub retry_delay_secs: i64,
    /// Non-fatal failures tolerated before the item fails terminally.
    pub max_failure_count: i32,
}

impl Default for StudyProcessConfig {
    fn default() -> Self {
        Self {
            postpone_delay_secs: 30,
            postpone_expiry_secs: 120,
            pending_delay_secs: 5,
            idle_delay_secs: 60,
            expiration_secs: 180,
            retry_delay_secs: 60,
            max_failure_count: 3,
        }
    }
}

impl StudyProcessConfig {
    pub fn postpone_delay(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.postpone_delay_secs)
    }

    pub fn postpone_expiry(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.postpone_expiry_secs)
    }

    pub fn pending_delay(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.pending_delay_secs)
    }

    pub fn idle_delay(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.idle_delay_secs)
    }

    pub fn expiration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.expiration_secs)
    }

    pub fn retry_delay(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.retry_delay_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Next run of a maintenance entry that finished its pass (secs).
    pub completed_reschedule_secs: i64,
    /// Next run of a maintenance entry that was cancelled mid-pass (secs).
    pub cancelled_reschedule_secs: i64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            completed_reschedule_secs: 24 * 60 * 60,
            cancelled_reschedule_secs: 60,
        }
    }
}

impl MaintenanceConfig {
    pub fn completed_reschedule(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.completed_reschedule_secs)
    }

    pub fn cancelled_reschedule(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cancelled_reschedule_secs)
    }
}
