//! Gmail integration: OAuth credentials, REST client and label cache.

pub mod auth;
pub mod client;
pub mod labels;
pub mod retry;
pub mod types;

#[cfg(test)]
pub(crate) mod mock;

pub use auth::{ClientSecrets, CredentialStore, StaticToken, Token, TokenProvider};
pub use client::{BATCH_MODIFY_LIMIT, GMAIL_API_BASE, GmailApi, GmailClient};
pub use labels::{LabelManager, SYSTEM_LABELS, system_label_id};
pub use types::{GmailLabel, MessageRef};
