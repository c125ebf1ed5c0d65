//! Operator alerts.
//!
//! Alerts are fire-and-forget: raising one never blocks and never fails the
//! caller, so a broken sink cannot stall processing.

use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertCategory {
    System,
    Application,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AlertLevel {
    Informational,
    Warning,
    Error,
    Critical,
}

/// Machine-readable reason attached to an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertCode {
    ProcessorFailed,
    UnknownProcessor,
    FailedUpdateSop,
    FilesRemoved,
    StudyLossyInconsistent,
    ReinventoryFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub category: AlertCategory,
    pub level: AlertLevel,
    pub source: String,
    pub code: AlertCode,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(
        category: AlertCategory,
        level: AlertLevel,
        source: impl Into<String>,
        code: AlertCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            level,
            source: source.into(),
            code,
            message: message.into(),
            raised_at: Utc::now(),
        }
    }

    pub fn application_error(
        source: impl Into<String>,
        code: AlertCode,
        message: impl Into<String>,
    ) -> Self {
        Self::new(AlertCategory::Application, AlertLevel::Error, source, code, message)
    }
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}/{:?}] {}: {}", self.level, self.code, self.source, self.message)
    }
}

pub trait AlertSink: Send + Sync {
    fn raise(&self, alert: Alert);
}

/// Default sink: alerts become `tracing` events on the `pacsvault::alert` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn raise(&self, alert: Alert) {
        match alert.level {
            AlertLevel::Informational => tracing::info!(
                target: "pacsvault::alert",
                source = %alert.source,
                code = ?alert.code,
                "{}",
                alert.message
            ),
            AlertLevel::Warning => tracing::warn!(
                target: "pacsvault::alert",
                source = %alert.source,
                code = ?alert.code,
                "{}",
                alert.message
            ),
            AlertLevel::Error | AlertLevel::Critical => tracing::error!(
                target: "pacsvault::alert",
                source = %alert.source,
                code = ?alert.code,
                level = ?alert.level,
                "{}",
                alert.message
            ),
        }
    }
}

/// Keeps every alert in memory; used by tests and diagnostics endpoints.
#[derive(Debug, Default)]
pub struct RecordingAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn with_code(&self, code: AlertCode) -> Vec<Alert> {
        self.alerts()
            .into_iter()
            .filter(|alert| alert.code == code)
            .collect()
    }
}

impl AlertSink for RecordingAlertSink {
    fn raise(&self, alert: Alert) {
        TracingAlertSink.raise(alert.clone());
        if let Ok(mut guard) = self.alerts.lock() {
            guard.push(alert);
        }
    }
}
