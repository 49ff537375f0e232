//! Shared types for the classification pipeline.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

static ANGLE_ADDRESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<(.+?)>").expect("static regex"));

// ── Email message ───────────────────────────────────────────────────

/// Read-only view of a provider message.
///
/// Built from Gmail `format=metadata` responses; the body is the provider's
/// snippet, not the full MIME body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailMessage {
    /// Provider message ID.
    pub id: String,
    pub thread_id: Option<String>,
    /// Raw `From` header, e.g. `Alice <alice@example.com>`.
    pub from: String,
    /// Bare sender address extracted from `from`.
    pub sender: String,
    /// Lowercased sender domain, or `unknown`.
    pub sender_domain: String,
    pub subject: String,
    /// Body snippet.
    pub snippet: String,
    pub received_at: DateTime<Utc>,
    /// Label IDs currently on the message.
    #[serde(default)]
    pub label_ids: Vec<String>,
}

impl EmailMessage {
    /// Build a message, deriving sender address and domain from `from`.
    pub fn new(
        id: impl Into<String>,
        from: impl Into<String>,
        subject: impl Into<String>,
        snippet: impl Into<String>,
        received_at: DateTime<Utc>,
    ) -> Self {
        let from = from.into();
        let (sender, sender_domain) = parse_sender(&from);
        Self {
            id: id.into(),
            thread_id: None,
            from,
            sender,
            sender_domain,
            subject: subject.into(),
            snippet: snippet.into(),
            received_at,
            label_ids: Vec::new(),
        }
    }

    pub fn with_labels(mut self, label_ids: Vec<String>) -> Self {
        self.label_ids = label_ids;
        self
    }

    pub fn with_thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn has_label(&self, label_id: &str) -> bool {
        self.label_ids.iter().any(|l| l == label_id)
    }
}

/// Split a `From` header into `(address, domain)`.
///
/// `Name <user@Example.com>` → `("user@Example.com", "example.com")`.
/// A header without `@` yields domain `unknown`.
pub fn parse_sender(from: &str) -> (String, String) {
    let address = ANGLE_ADDRESS
        .captures(from)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(from)
        .trim()
        .to_string();

    let domain = match address.rsplit_once('@') {
        Some((_, domain)) if !domain.trim().is_empty() => domain.trim().to_lowercase(),
        _ => "unknown".to_string(),
    };

    (address, domain)
}

// ── Classification ──────────────────────────────────────────────────

/// Terminal action for a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// Apply a label and move out of the inbox.
    Label { name: String },
    /// Move to trash.
    Delete,
    /// Leave the message where it is.
    Ignore,
}

impl Action {
    pub fn label(name: impl Into<String>) -> Self {
        Self::Label { name: name.into() }
    }

    /// Short name for logging and storage.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Label { .. } => "label",
            Self::Delete => "delete",
            Self::Ignore => "ignore",
        }
    }

    pub fn label_name(&self) -> Option<&str> {
        match self {
            Self::Label { name } => Some(name),
            _ => None,
        }
    }
}

/// Which stage produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationSource {
    /// Sniper-mode sender rule.
    Rule,
    KillList,
    Llm,
    /// AI mode was needed but could not run; the message is retried next pass.
    Unavailable,
}

impl ClassificationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rule => "rule",
            Self::KillList => "kill_list",
            Self::Llm => "llm",
            Self::Unavailable => "unavailable",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "rule" => Self::Rule,
            "kill_list" => Self::KillList,
            "llm" => Self::Llm,
            _ => Self::Unavailable,
        }
    }
}

/// Per-message routing decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    #[serde(flatten)]
    pub action: Action,
    pub source: ClassificationSource,
    pub reason: String,
}

impl ClassificationResult {
    pub fn new(action: Action, source: ClassificationSource, reason: impl Into<String>) -> Self {
        Self {
            action,
            source,
            reason: reason.into(),
        }
    }

    /// Decision could not be made this pass.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::new(Action::Ignore, ClassificationSource::Unavailable, reason)
    }

    /// Whether this decision is final and may be recorded in the ledger.
    pub fn is_final(&self) -> bool {
        self.source != ClassificationSource::Unavailable
    }
}
