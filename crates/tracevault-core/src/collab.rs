//! Narrow interfaces to collaborators that live outside the engine: alert
//! delivery, repair-strategy recommendation, verification diagnostics, the
//! original ingestion source and strategy-variant assignment.

use std::fmt;
use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ─────────────────────────────────────────────────────────────────────────────
// Alerts
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    StorageFailover,
    DataInconsistency,
    RepairFailed,
    CostAnomaly,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StorageFailover => "storage_failover",
            Self::DataInconsistency => "data_inconsistency",
            Self::RepairFailed => "repair_failed",
            Self::CostAnomaly => "cost_anomaly",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

/// What an alert is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "lowercase")]
pub enum AlertSubject {
    Key(String),
    Provider(String),
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Stable id: `<kind>/<subject>`, used for acknowledgement.
    pub id: String,
    pub kind: AlertKind,
    pub subject: AlertSubject,
    pub severity: Severity,
    pub message: String,
    pub raised_at: SystemTime,
}

impl Alert {
    pub fn new(
        kind: AlertKind,
        subject: AlertSubject,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        let id = match &subject {
            AlertSubject::Key(name) | AlertSubject::Provider(name) => format!("{kind}/{name}"),
            AlertSubject::System => kind.to_string(),
        };
        Self {
            id,
            kind,
            subject,
            severity,
            message: message.into(),
            raised_at: SystemTime::now(),
        }
    }
}

/// Alert manager. Delivery channels are the implementor's business.
pub trait AlertSink: Send + Sync {
    fn trigger_alert(&self, alert: Alert);
}

// ─────────────────────────────────────────────────────────────────────────────
// Repair and diagnostics
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error)]
#[error("{collaborator} failed: {message}")]
pub struct CollaboratorError {
    pub collaborator: &'static str,
    pub message: String,
}

impl CollaboratorError {
    pub fn new(collaborator: &'static str, message: impl Into<String>) -> Self {
        Self {
            collaborator,
            message: message.into(),
        }
    }
}

/// Strategy recommended for a quarantined key. `strategy` names an issue kind
/// (`single_corruption`, `multi_corruption`, `metadata_issue`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub strategy: String,
    pub confidence: f64,
}

/// Opaque strategy classifier.
#[async_trait]
pub trait RepairAdvisor: Send + Sync {
    async fn recommend_strategy(&self, key: &str) -> Result<Recommendation, CollaboratorError>;
}

/// Diagnostic report for a key; the engine only logs and forwards it.
pub type Diagnostics = serde_json::Value;

pub trait VerificationAnalyzer: Send + Sync {
    fn generate_report(&self, key: &str) -> Diagnostics;
}

/// The original ingestion source, used to rebuild data from scratch.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn fetch_raw(&self, key: &str) -> Result<Vec<u8>, CollaboratorError>;
}

/// Externally managed strategy-variant assignment (e.g. an A/B test).
pub trait StrategyAssigner: Send + Sync {
    fn assign_variant(&self, key: &str) -> Option<String>;
}
