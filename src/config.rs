//! Configuration types.
//!
//! Settings live in a JSON file (`config.json` by default) so the dashboard
//! can edit and persist them. A handful of environment variables override
//! the file for deployment.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{info, warn};

use crate::error::ConfigError;

/// Default config file location.
pub const DEFAULT_CONFIG_PATH: &str = "config.json";

/// Gmail scope required to label, move and trash messages.
pub const GMAIL_MODIFY_SCOPE: &str = "https://www.googleapis.com/auth/gmail.modify";

/// Where a kill-list pattern is matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillScope {
    /// Sender domain (`example.com` in `a@example.com`).
    Domain,
    /// Full sender address.
    Sender,
    Subject,
    /// Body snippet.
    Body,
}

/// A deny-list entry. Matching messages are trashed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillListEntry {
    pub pattern: String,
    #[serde(default = "default_kill_scope")]
    pub scope: KillScope,
}

fn default_kill_scope() -> KillScope {
    KillScope::Domain
}

/// Sniper-mode rules for one label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelRule {
    pub label: String,
    pub patterns: Vec<String>,
}

/// Ordered `label -> [sender pattern]` table.
///
/// Serialized as a JSON object; evaluation follows document order, so the
/// first label listed in the file wins when two labels share a pattern.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelRules(Vec<LabelRule>);

impl LabelRules {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn iter(&self) -> impl Iterator<Item = &LabelRule> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Patterns for a label (case-sensitive label name).
    pub fn get(&self, label: &str) -> Option<&[String]> {
        self.0
            .iter()
            .find(|r| r.label == label)
            .map(|r| r.patterns.as_slice())
    }

    /// Replace a label's patterns, appending the label if it is new.
    /// Blank patterns are dropped and the rest trimmed.
    pub fn set(&mut self, label: &str, patterns: Vec<String>) {
        let patterns: Vec<String> = patterns
            .into_iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        match self.0.iter_mut().find(|r| r.label == label) {
            Some(rule) => rule.patterns = patterns,
            None => self.0.push(LabelRule {
                label: label.to_string(),
                patterns,
            }),
        }
    }

    /// Append patterns to a label, creating it if needed.
    pub fn extend(&mut self, label: &str, patterns: impl IntoIterator<Item = String>) {
        let mut merged = self.get(label).map(<[String]>::to_vec).unwrap_or_default();
        merged.extend(patterns);
        self.set(label, merged);
    }

    /// Make sure `label` has an entry, even if it has no patterns.
    pub fn ensure_label(&mut self, label: &str) {
        if self.get(label).is_none() {
            self.0.push(LabelRule {
                label: label.to_string(),
                patterns: Vec::new(),
            });
        }
    }
}

impl Serialize for LabelRules {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.0.iter().map(|r| (&r.label, &r.patterns)))
    }
}

impl<'de> Deserialize<'de> for LabelRules {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RulesVisitor;

        impl<'de> Visitor<'de> for RulesVisitor {
            type Value = LabelRules;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an object mapping label names to sender patterns")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut rules = LabelRules::new();
                while let Some((label, patterns)) = map.next_entry::<String, Vec<String>>()? {
                    rules.set(&label, patterns);
                }
                Ok(rules)
            }
        }

        deserializer.deserialize_map(RulesVisitor)
    }
}

/// Full application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MailConfig {
    /// Ollama model ID used in AI mode.
    pub model: String,
    /// Base URL of the local inference endpoint.
    pub ollama_url: String,
    pub llm_timeout_secs: u64,
    /// Maximum messages fetched per cycle.
    pub batch_size: u32,
    /// Gmail search query selecting candidate messages.
    pub query: String,
    pub poll_interval_secs: u64,
    /// Fall back to the LLM when no rule or kill-list entry matches.
    pub ai_enabled: bool,
    /// Accept LLM labels outside `fixed_labels`.
    pub allow_new_labels: bool,
    /// Domain-scoped kill list kept in the legacy flat format.
    pub blacklist_domains: Vec<String>,
    /// Kill-list entries with an explicit scope.
    pub kill_list: Vec<KillListEntry>,
    /// Closed label set offered to the LLM.
    pub fixed_labels: Vec<String>,
    pub label_rules: LabelRules,
    pub credentials_path: PathBuf,
    pub token_path: PathBuf,
    pub db_path: PathBuf,
    /// Dashboard API port; 0 disables the server.
    pub dashboard_port: u16,
}

impl Default for MailConfig {
    fn default() -> Self {
        let fixed_labels: Vec<String> = ["Finance", "Work", "Personal", "Receipts", "Family"]
            .into_iter()
            .map(String::from)
            .collect();

        let mut label_rules = LabelRules::new();
        for label in ["Family", "Work", "Finance"] {
            label_rules.ensure_label(label);
        }
        for label in &fixed_labels {
            label_rules.ensure_label(label);
        }

        Self {
            model: "qwen3:8b".to_string(),
            ollama_url: "http://127.0.0.1:11434".to_string(),
            llm_timeout_secs: 60,
            batch_size: 20,
            query: "label:INBOX".to_string(),
            poll_interval_secs: 300,
            ai_enabled: true,
            allow_new_labels: false,
            blacklist_domains: vec![
                "quora.com".to_string(),
                "reddit.com".to_string(),
                "temu.com".to_string(),
            ],
            kill_list: Vec::new(),
            fixed_labels,
            label_rules,
            credentials_path: PathBuf::from("credentials.json"),
            token_path: PathBuf::from("token.json"),
            db_path: PathBuf::from("./data/calm-mail.db"),
            dashboard_port: 8080,
        }
    }
}

impl MailConfig {
    /// Load the config file, writing defaults if it does not exist yet.
    ///
    /// A file that exists but cannot be parsed is an error; silently
    /// replacing a user's rules with defaults would re-route their inbox.
    pub fn load_or_init(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            let config = Self::default();
            config.save(path)?;
            info!(path = %path.display(), "Wrote default configuration");
            return Ok(config);
        }

        let raw = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&raw).map_err(|e| ConfigError::ParseError {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        info!(
            path = %path.display(),
            rules = config.label_rules.len(),
            kill_list = config.kill_list_entries().len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Parse config JSON, migrating legacy keys and filling defaults.
    pub fn from_json_str(raw: &str) -> Result<Self, serde_json::Error> {
        let mut value: serde_json::Value = serde_json::from_str(raw)?;

        // Legacy `family_emails` list folds into label_rules["Family"].
        let legacy_family = value
            .as_object_mut()
            .and_then(|obj| obj.remove("family_emails"));

        let mut config: Self = serde_json::from_value(value)?;

        if let Some(serde_json::Value::Array(emails)) = legacy_family {
            let emails: Vec<String> = emails
                .into_iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect();
            if !emails.is_empty() {
                warn!(
                    count = emails.len(),
                    "Migrating legacy family_emails into label_rules.Family"
                );
                config.label_rules.extend("Family", emails);
            }
        }

        for label in &config.fixed_labels {
            config.label_rules.ensure_label(label);
        }

        Ok(config)
    }

    /// Write the config as pretty JSON, replacing the file atomically.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|e| ConfigError::ParseError {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Check value ranges. Pattern syntax is checked by the rules engine.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 || self.batch_size > 500 {
            return Err(ConfigError::InvalidValue {
                key: "batch_size".into(),
                message: format!("must be between 1 and 500, got {}", self.batch_size),
            });
        }
        if self.llm_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "llm_timeout_secs".into(),
                message: "must be greater than zero".into(),
            });
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "poll_interval_secs".into(),
                message: "must be greater than zero".into(),
            });
        }
        if self.ai_enabled && self.model.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "model".into(),
                message: "required when ai_enabled is true".into(),
            });
        }
        Ok(())
    }

    /// All kill-list entries: legacy domains first, then scoped entries.
    pub fn kill_list_entries(&self) -> Vec<KillListEntry> {
        self.blacklist_domains
            .iter()
            .map(|d| d.trim())
            .filter(|d| !d.is_empty())
            .map(|d| KillListEntry {
                pattern: d.to_lowercase(),
                scope: KillScope::Domain,
            })
            .chain(self.kill_list.iter().cloned())
            .collect()
    }
}

/// Deployment settings from `CALM_MAIL_*` variables.
///
/// Applied on top of the file for the running process only; `config.json`
/// never receives these values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    pub model: Option<String>,
    pub ollama_url: Option<String>,
    pub poll_interval_secs: Option<u64>,
    pub db_path: Option<PathBuf>,
    pub dashboard_port: Option<u16>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read overrides through `lookup`. Unparseable numbers are ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn number<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Option<T> {
            let raw = raw?;
            match raw.trim().parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(key, value = %raw, "Ignoring invalid environment override");
                    None
                }
            }
        }

        Self {
            model: lookup("CALM_MAIL_MODEL"),
            ollama_url: lookup("CALM_MAIL_OLLAMA_URL"),
            poll_interval_secs: number(
                "CALM_MAIL_POLL_INTERVAL_SECS",
                lookup("CALM_MAIL_POLL_INTERVAL_SECS"),
            ),
            db_path: lookup("CALM_MAIL_DB_PATH").map(PathBuf::from),
            dashboard_port: number("CALM_MAIL_DASHBOARD_PORT", lookup("CALM_MAIL_DASHBOARD_PORT")),
        }
    }

    /// Effective settings: `file` with every present override applied.
    pub fn apply(&self, file: &MailConfig) -> MailConfig {
        let mut config = file.clone();
        if let Some(model) = &self.model {
            config.model.clone_from(model);
        }
        if let Some(url) = &self.ollama_url {
            config.ollama_url.clone_from(url);
        }
        if let Some(secs) = self.poll_interval_secs {
            config.poll_interval_secs = secs;
        }
        if let Some(path) = &self.db_path {
            config.db_path.clone_from(path);
        }
        if let Some(port) = self.dashboard_port {
            config.dashboard_port = port;
        }
        config
    }
}
