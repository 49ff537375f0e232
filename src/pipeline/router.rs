//! Hybrid router: sniper rules, then kill list, then AI mode.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::MailConfig;
use crate::error::ConfigError;
use crate::llm::provider::LlmProvider;
use crate::pipeline::classifier::LlmClassifier;
use crate::pipeline::rules::RulesEngine;
use crate::pipeline::types::{ClassificationResult, EmailMessage};

/// Routes one message to a terminal action.
///
/// Built from a config snapshot; the dashboard swaps in a new router when
/// settings change instead of mutating this one.
pub struct HybridRouter {
    rules: RulesEngine,
    classifier: Option<LlmClassifier>,
}

impl HybridRouter {
    pub fn new(rules: RulesEngine, classifier: Option<LlmClassifier>) -> Self {
        Self { rules, classifier }
    }

    /// Compile rules from `config`. The LLM is attached only when AI mode
    /// is enabled and a provider is supplied.
    pub fn from_config(
        config: &MailConfig,
        llm: Option<Arc<dyn LlmProvider>>,
    ) -> Result<Self, ConfigError> {
        let rules = RulesEngine::from_config(config)?;
        let classifier = llm.filter(|_| config.ai_enabled).map(|llm| {
            LlmClassifier::new(llm, config.fixed_labels.clone(), config.allow_new_labels)
        });
        Ok(Self::new(rules, classifier))
    }

    pub fn rules(&self) -> &RulesEngine {
        &self.rules
    }

    pub fn ai_enabled(&self) -> bool {
        self.classifier.is_some()
    }

    pub fn model_name(&self) -> Option<&str> {
        self.classifier.as_ref().map(|c| c.model_name())
    }

    /// Classify a message. Never fails: an LLM outage yields an
    /// `unavailable` result so the caller retries the message later.
    pub async fn route(&self, message: &EmailMessage) -> ClassificationResult {
        if let Some(result) = self.rules.evaluate(message) {
            return result;
        }

        let Some(classifier) = &self.classifier else {
            debug!(id = %message.id, "No rule matched and AI mode is off");
            return ClassificationResult::unavailable("AI mode disabled");
        };

        match classifier.classify(message).await {
            Ok(result) => result,
            Err(e) => {
                warn!(
                    id = %message.id,
                    sender = %message.sender,
                    error = %e,
                    "LLM classification failed, will retry next cycle"
                );
                ClassificationResult::unavailable(format!("LLM unavailable: {e}"))
            }
        }
    }
}
