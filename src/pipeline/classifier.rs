//! AI mode: classify a message with the local LLM.
//!
//! The model sees sender, domain, subject and snippet plus the closed label
//! set, and answers with `{"reasoning": "...", "category": "..."}`. The
//! category token is resolved against the label set; anything unusable
//! becomes `Ignore` so the message stays in the inbox.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::LlmError;
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::pipeline::types::{Action, ClassificationResult, ClassificationSource, EmailMessage};

/// Max tokens for the classification call (runs on every unmatched message).
const CLASSIFY_MAX_TOKENS: u32 = 256;

const CLASSIFY_TEMPERATURE: f32 = 0.1;

/// Snippet characters sent to the model.
const SNIPPET_PREVIEW_CHARS: usize = 500;

/// Longest label the model may invent when new labels are allowed.
const MAX_NEW_LABEL_LEN: usize = 24;

/// Tokens that mean "trash it".
const DELETE_TOKENS: [&str; 3] = ["DELETE", "SPAM", "TRASH"];

/// LLM-backed classifier over a closed label set.
pub struct LlmClassifier {
    llm: Arc<dyn LlmProvider>,
    labels: Vec<String>,
    allow_new_labels: bool,
}

impl LlmClassifier {
    pub fn new(llm: Arc<dyn LlmProvider>, labels: Vec<String>, allow_new_labels: bool) -> Self {
        Self {
            llm,
            labels,
            allow_new_labels,
        }
    }

    pub fn model_name(&self) -> &str {
        self.llm.model_name()
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Ask the model for a category.
    ///
    /// Transport and backend failures are returned as errors; a response
    /// that arrives but cannot be used resolves to `Ignore`.
    pub async fn classify(&self, message: &EmailMessage) -> Result<ClassificationResult, LlmError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_classify_system_prompt(
                &self.labels,
                self.allow_new_labels,
            )),
            ChatMessage::user(build_classify_user_prompt(message)),
        ])
        .with_temperature(CLASSIFY_TEMPERATURE)
        .with_max_tokens(CLASSIFY_MAX_TOKENS)
        .with_json_format();

        let response = self.llm.complete(request).await?;
        let result = parse_category_response(&response.content, &self.labels, self.allow_new_labels);

        debug!(
            id = %message.id,
            model = self.llm.model_name(),
            action = result.action.kind(),
            label = result.action.label_name().unwrap_or("-"),
            "LLM classification"
        );
        Ok(result)
    }
}

// ── Prompt construction ─────────────────────────────────────────────

/// Build the classification system prompt.
fn build_classify_system_prompt(labels: &[String], allow_new_labels: bool) -> String {
    let labels_json = serde_json::to_string(labels).unwrap_or_else(|_| "[]".to_string());

    let mut prompt = String::with_capacity(1024);
    prompt.push_str("You are an email sorting engine. Output JSON only.\n\n");
    prompt.push_str(&format!("Labels: {labels_json}\n\n"));
    prompt.push_str(
        "Rules:\n\
         - Check the sender domain first. Trust it above the subject.\n\
         - Social network notifications (Quora, Reddit and similar) are DELETE.\n\
         - \"Finance\" is for bills and banks.\n\
         - Useless promotions and spam are DELETE.\n\
         - If the message needs the user's attention and fits no label, answer INBOX.\n",
    );
    if allow_new_labels {
        prompt.push_str(
            "- If it fits no label, you may invent a short one-word label (e.g. \"Gaming\").\n",
        );
    } else {
        prompt.push_str("- Never invent labels. Use one from the list, DELETE or INBOX.\n");
    }
    prompt.push_str(
        "\nRespond with ONLY a JSON object:\n\
         {\"reasoning\": \"Sender is X, subject is Y...\", \"category\": \"LabelName\" or \"DELETE\" or \"INBOX\"}",
    );
    prompt
}

/// Build the classification user prompt from a message.
fn build_classify_user_prompt(message: &EmailMessage) -> String {
    let snippet: String = message.snippet.chars().take(SNIPPET_PREVIEW_CHARS).collect();
    format!(
        "From: {} (Domain: {})\nSubject: {}\nSnippet: {}",
        message.sender, message.sender_domain, message.subject, snippet
    )
}

// ── Response parsing ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CategoryResponse {
    #[serde(default)]
    category: String,
    #[serde(default)]
    reasoning: String,
}

/// Resolve raw model output into a classification.
pub fn parse_category_response(
    raw: &str,
    labels: &[String],
    allow_new_labels: bool,
) -> ClassificationResult {
    let json_str = extract_json_object(raw);
    let (category, reasoning) = match serde_json::from_str::<CategoryResponse>(&json_str) {
        Ok(parsed) => (parsed.category, parsed.reasoning),
        // Bare token answers like `Finance` or `"DELETE"`.
        Err(_) => (bare_token(raw).unwrap_or_default(), String::new()),
    };

    let category = category.trim().trim_matches('"').trim();
    let reason = |fallback: String| {
        if reasoning.trim().is_empty() {
            fallback
        } else {
            reasoning.trim().to_string()
        }
    };

    if category.is_empty() {
        warn!(raw_response = %raw, "Unparseable classification, leaving in inbox");
        return ClassificationResult::new(
            Action::Ignore,
            ClassificationSource::Llm,
            "unparseable model output",
        );
    }

    let upper = category.to_uppercase();
    if DELETE_TOKENS.contains(&upper.as_str()) {
        return ClassificationResult::new(
            Action::Delete,
            ClassificationSource::Llm,
            reason(format!("model answered {upper}")),
        );
    }
    if upper == "INBOX" {
        return ClassificationResult::new(
            Action::Ignore,
            ClassificationSource::Llm,
            reason("model answered INBOX".into()),
        );
    }

    if let Some(label) = labels.iter().find(|l| l.eq_ignore_ascii_case(category)) {
        return ClassificationResult::new(
            Action::label(label),
            ClassificationSource::Llm,
            reason(format!("model answered {label}")),
        );
    }

    if allow_new_labels && is_plausible_new_label(category) {
        return ClassificationResult::new(
            Action::label(category),
            ClassificationSource::Llm,
            reason(format!("model invented {category}")),
        );
    }

    warn!(category = %category, "Model answered a label outside the configured set");
    ClassificationResult::new(
        Action::Ignore,
        ClassificationSource::Llm,
        format!("unknown label '{category}'"),
    )
}

fn is_plausible_new_label(category: &str) -> bool {
    !category.is_empty()
        && category.chars().count() <= MAX_NEW_LABEL_LEN
        && category
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
}

/// First word of a non-JSON answer.
fn bare_token(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.contains('{') {
        return None;
    }
    trimmed
        .split_whitespace()
        .next()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric() && c != '-' && c != '_'))
        .filter(|w| !w.is_empty())
        .map(String::from)
}

/// Extract a JSON object from LLM output (handles markdown wrapping).
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    // Already a JSON object
    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    // Wrapped in markdown code block
    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    // Reasoning models may think out loud before the object.
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}
