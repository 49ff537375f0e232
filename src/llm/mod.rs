//! LLM integration for Calm Mail.
//!
//! Supports:
//! - **Ollama**: local inference over the native `/api/chat` endpoint
//!
//! Everything outside this module talks to the `LlmProvider` trait, so tests
//! substitute a mock and additional local backends slot in here.

pub mod ollama;
pub mod provider;

pub use ollama::OllamaProvider;
pub use provider::*;

use std::sync::Arc;
use std::time::Duration;

use crate::config::MailConfig;
use crate::error::LlmError;

/// Supported LLM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Ollama,
}

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
}

impl LlmConfig {
    pub fn from_mail_config(config: &MailConfig) -> Self {
        Self {
            backend: LlmBackend::Ollama,
            base_url: config.ollama_url.clone(),
            model: config.model.clone(),
            timeout: Duration::from_secs(config.llm_timeout_secs),
        }
    }
}

/// Create an LLM provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    match config.backend {
        LlmBackend::Ollama => {
            let provider = OllamaProvider::new(&config.base_url, &config.model, config.timeout)?;
            tracing::info!("Using Ollama at {} (model: {})", config.base_url, config.model);
            Ok(Arc::new(provider))
        }
    }
}
