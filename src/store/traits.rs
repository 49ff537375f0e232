//! `Database` trait: activity log and the processed-message ledger.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::pipeline::types::{ClassificationResult, ClassificationSource, EmailMessage};

/// What happened to a message after routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    /// Label or trash applied in Gmail.
    Applied,
    /// Left in the inbox by decision.
    Ignored,
    /// No decision this cycle; retried next cycle.
    Deferred,
    /// Decision made but the Gmail call failed.
    Failed,
}

impl ActivityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Ignored => "ignored",
            Self::Deferred => "deferred",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "applied" => Self::Applied,
            "ignored" => Self::Ignored,
            "failed" => Self::Failed,
            _ => Self::Deferred,
        }
    }
}

/// One row of the activity log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub id: Uuid,
    pub message_id: String,
    pub sender: String,
    pub subject: String,
    /// `label`, `delete` or `ignore`.
    pub action: String,
    pub label: Option<String>,
    pub source: ClassificationSource,
    pub reason: String,
    pub status: ActivityStatus,
    pub created_at: DateTime<Utc>,
}

impl ActivityEntry {
    pub fn new(
        message: &EmailMessage,
        result: &ClassificationResult,
        status: ActivityStatus,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_id: message.id.clone(),
            sender: message.sender.clone(),
            subject: message.subject.clone(),
            action: result.action.kind().to_string(),
            label: result.action.label_name().map(String::from),
            source: result.source,
            reason: result.reason.clone(),
            status,
            created_at: Utc::now(),
        }
    }
}

/// A message whose terminal action has been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedRecord {
    pub message_id: String,
    pub action: String,
    pub label: Option<String>,
    pub processed_at: DateTime<Utc>,
}

impl ProcessedRecord {
    pub fn new(message_id: impl Into<String>, result: &ClassificationResult) -> Self {
        Self {
            message_id: message_id.into(),
            action: result.action.kind().to_string(),
            label: result.action.label_name().map(String::from),
            processed_at: Utc::now(),
        }
    }
}

/// Activity totals by status and action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityCounts {
    pub labeled: u64,
    pub deleted: u64,
    pub ignored: u64,
    pub deferred: u64,
    pub failed: u64,
}

/// Backend-agnostic persistence.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Activity log ────────────────────────────────────────────────

    async fn record_activity(&self, entry: &ActivityEntry) -> Result<(), DatabaseError>;

    /// Newest first.
    async fn recent_activity(&self, limit: usize) -> Result<Vec<ActivityEntry>, DatabaseError>;

    /// Totals for entries created at or after `since`.
    async fn activity_counts(&self, since: DateTime<Utc>)
    -> Result<ActivityCounts, DatabaseError>;

    /// Delete entries older than `keep_days`. Returns rows removed.
    async fn prune_activity(&self, keep_days: u32) -> Result<u64, DatabaseError>;

    /// Status of the newest entry for a message, if any.
    async fn latest_status(&self, message_id: &str)
    -> Result<Option<ActivityStatus>, DatabaseError>;

    // ── Processed ledger ────────────────────────────────────────────

    async fn is_processed(&self, message_id: &str) -> Result<bool, DatabaseError>;

    /// Idempotent; re-marking a message keeps the first record.
    async fn mark_processed(&self, record: &ProcessedRecord) -> Result<(), DatabaseError>;

    async fn processed_count(&self) -> Result<u64, DatabaseError>;

    /// Forget labeled and trashed messages processed more than `keep_days`
    /// ago. Those have left the inbox; ignored ones stay so they are not
    /// re-classified. Returns rows removed.
    async fn prune_processed(&self, keep_days: u32) -> Result<u64, DatabaseError>;

    // ── Settings ────────────────────────────────────────────────────

    async fn get_setting(&self, key: &str) -> Result<Option<String>, DatabaseError>;

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), DatabaseError>;
}
