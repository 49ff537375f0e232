//! Error types for Calm Mail.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Gmail error: {0}")]
    Gmail(#[from] GmailError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration file {path}: {reason}")]
    ParseError { path: String, reason: String },

    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// OAuth credential and token errors.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("No credentials file at {path}. Import your Google OAuth client secrets first.")]
    MissingCredentials { path: String },

    #[error("Invalid credentials file {path}: {reason}")]
    InvalidCredentials { path: String, reason: String },

    #[error("Stored token was rejected ({reason}). Re-import credentials and authorize again.")]
    ReauthRequired { reason: String },

    #[error("OAuth server returned {error}: {description}")]
    OAuth { error: String, description: String },

    #[error("Authorization flow failed: {0}")]
    Flow(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Gmail REST API errors.
#[derive(Debug, thiserror::Error)]
pub enum GmailError {
    #[error("Gmail request {operation} failed with status {status}: {body}")]
    Api {
        operation: String,
        status: u16,
        body: String,
    },

    #[error("Gmail rate limited on {operation}, retry after {retry_after:?}")]
    RateLimited {
        operation: String,
        retry_after: Option<Duration>,
    },

    #[error("Resource already exists: {0}")]
    Conflict(String),

    #[error("Gmail rejected the access token")]
    Unauthorized,

    #[error("Malformed Gmail response for {operation}: {reason}")]
    InvalidResponse { operation: String, reason: String },

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl GmailError {
    /// Whether a retry with backoff may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Api { status, .. } => matches!(status, 500 | 502 | 503 | 504),
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::Conflict(_)
            | Self::Unauthorized
            | Self::InvalidResponse { .. }
            | Self::Auth(_) => false,
        }
    }
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} unreachable: {reason}")]
    Unreachable { provider: String, reason: String },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Model {model} not available on provider {provider}")]
    ModelNotAvailable { provider: String, model: String },
}

/// Pipeline-related errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Inbox fetch failed: {0}")]
    Fetch(#[source] GmailError),

    #[error("Message {id} could not be read: {source}")]
    Message {
        id: String,
        #[source]
        source: GmailError,
    },

    #[error("Batch action {action} failed for {count} message(s): {source}")]
    Execute {
        action: String,
        count: usize,
        #[source]
        source: GmailError,
    },

    #[error("Ledger error: {0}")]
    Ledger(#[from] DatabaseError),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses() {
        let api = |status| GmailError::Api {
            operation: "list".into(),
            status,
            body: String::new(),
        };
        assert!(api(503).is_retryable());
        assert!(api(500).is_retryable());
        assert!(!api(400).is_retryable());
        assert!(!api(404).is_retryable());
        assert!(
            GmailError::RateLimited {
                operation: "list".into(),
                retry_after: None
            }
            .is_retryable()
        );
        assert!(!GmailError::Conflict("Work".into()).is_retryable());
        assert!(!GmailError::Unauthorized.is_retryable());
    }

    #[test]
    fn auth_error_message_tells_user_to_reimport() {
        let err = AuthError::ReauthRequired {
            reason: "invalid_grant".into(),
        };
        assert!(err.to_string().contains("Re-import"));
    }
}
