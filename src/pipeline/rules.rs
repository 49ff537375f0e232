//! Pre-LLM rules engine: sniper-mode sender rules and the kill list.
//!
//! Runs before AI mode to short-circuit known senders:
//! 1. Sender rules, in config order, first match wins → `Label`
//! 2. Kill list, any match → `Delete`
//!
//! If the rules engine returns a result, the LLM call is skipped entirely.

use regex::{Regex, RegexBuilder};
use tracing::debug;

use crate::config::{KillListEntry, KillScope, MailConfig};
use crate::error::ConfigError;
use crate::pipeline::types::{Action, ClassificationResult, ClassificationSource, EmailMessage};

/// A user-supplied match pattern.
///
/// Plain text matches as a case-insensitive substring. Text wrapped in
/// slashes (`/^billing@/`) is a case-insensitive regular expression.
#[derive(Debug, Clone)]
pub enum Pattern {
    /// Lowercased needle.
    Substring(String),
    Regex(Regex),
}

impl Pattern {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ConfigError::InvalidPattern {
                pattern: raw.to_string(),
                reason: "pattern is empty".into(),
            });
        }

        if trimmed.len() >= 2 && trimmed.starts_with('/') && trimmed.ends_with('/') {
            let expr = &trimmed[1..trimmed.len() - 1];
            let regex = RegexBuilder::new(expr)
                .case_insensitive(true)
                .build()
                .map_err(|e| ConfigError::InvalidPattern {
                    pattern: raw.to_string(),
                    reason: e.to_string(),
                })?;
            return Ok(Self::Regex(regex));
        }

        Ok(Self::Substring(trimmed.to_lowercase()))
    }

    pub fn is_match(&self, haystack: &str) -> bool {
        match self {
            Self::Substring(needle) => haystack.to_lowercase().contains(needle.as_str()),
            Self::Regex(regex) => regex.is_match(haystack),
        }
    }
}

/// A sender pattern routed to a label.
#[derive(Debug, Clone)]
pub struct SniperRule {
    /// Pattern as written in the config.
    pub raw: String,
    pub pattern: Pattern,
    pub label: String,
}

/// A kill-list entry with a compiled pattern.
#[derive(Debug, Clone)]
pub struct KillRule {
    pub raw: String,
    pub pattern: Pattern,
    pub scope: KillScope,
}

impl KillRule {
    fn field<'a>(&self, message: &'a EmailMessage) -> &'a str {
        match self.scope {
            KillScope::Domain => &message.sender_domain,
            KillScope::Sender => &message.sender,
            KillScope::Subject => &message.subject,
            KillScope::Body => &message.snippet,
        }
    }
}

/// Sender rules plus kill list.
#[derive(Debug, Clone, Default)]
pub struct RulesEngine {
    sniper_rules: Vec<SniperRule>,
    kill_rules: Vec<KillRule>,
}

impl RulesEngine {
    /// Create an empty rules engine.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Compile every rule and kill-list entry from the config.
    ///
    /// Fails on the first invalid pattern so a bad edit is rejected whole.
    pub fn from_config(config: &MailConfig) -> Result<Self, ConfigError> {
        let mut engine = Self::empty();
        for rule in config.label_rules.iter() {
            for pattern in &rule.patterns {
                engine.add_rule(pattern, &rule.label)?;
            }
        }
        for entry in config.kill_list_entries() {
            engine.add_kill_entry(&entry)?;
        }
        debug!(
            rules = engine.sniper_rules.len(),
            kill_list = engine.kill_rules.len(),
            "Rules engine compiled"
        );
        Ok(engine)
    }

    /// Append a sender rule. Later rules lose to earlier ones.
    pub fn add_rule(&mut self, pattern: &str, label: &str) -> Result<(), ConfigError> {
        self.sniper_rules.push(SniperRule {
            raw: pattern.trim().to_string(),
            pattern: Pattern::parse(pattern)?,
            label: label.to_string(),
        });
        Ok(())
    }

    /// Append a kill-list entry.
    pub fn add_kill_entry(&mut self, entry: &KillListEntry) -> Result<(), ConfigError> {
        self.kill_rules.push(KillRule {
            raw: entry.pattern.trim().to_string(),
            pattern: Pattern::parse(&entry.pattern)?,
            scope: entry.scope,
        });
        Ok(())
    }

    pub fn rule_count(&self) -> usize {
        self.sniper_rules.len()
    }

    pub fn kill_count(&self) -> usize {
        self.kill_rules.len()
    }

    /// First sender rule matching the message.
    pub fn match_rule(&self, message: &EmailMessage) -> Option<&SniperRule> {
        self.sniper_rules
            .iter()
            .find(|rule| rule.pattern.is_match(&message.sender))
    }

    /// First kill-list entry matching the message.
    pub fn match_kill_list(&self, message: &EmailMessage) -> Option<&KillRule> {
        self.kill_rules
            .iter()
            .find(|rule| rule.pattern.is_match(rule.field(message)))
    }

    /// Evaluate a message against all rules.
    ///
    /// Returns `Some` if a rule or kill-list entry matches (short-circuits
    /// the LLM), `None` to fall through to AI mode.
    pub fn evaluate(&self, message: &EmailMessage) -> Option<ClassificationResult> {
        if let Some(rule) = self.match_rule(message) {
            debug!(
                id = %message.id,
                sender = %message.sender,
                rule = %rule.raw,
                label = %rule.label,
                "Message matched sender rule"
            );
            return Some(ClassificationResult::new(
                Action::label(&rule.label),
                ClassificationSource::Rule,
                format!("sender matches '{}'", rule.raw),
            ));
        }

        if let Some(rule) = self.match_kill_list(message) {
            debug!(
                id = %message.id,
                sender = %message.sender,
                pattern = %rule.raw,
                scope = ?rule.scope,
                "Message matched kill list"
            );
            return Some(ClassificationResult::new(
                Action::Delete,
                ClassificationSource::KillList,
                format!("kill list {:?} '{}'", rule.scope, rule.raw).to_lowercase(),
            ));
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn make_message(from: &str, subject: &str, snippet: &str) -> EmailMessage {
        EmailMessage::new("test-1", from, subject, snippet, Utc::now())
    }

    fn domain(pattern: &str) -> KillListEntry {
        KillListEntry {
            pattern: pattern.into(),
            scope: KillScope::Domain,
        }
    }

    #[test]
    fn rule_labels_matching_sender() {
        let mut engine = RulesEngine::empty();
        engine.add_rule("mom@family.net", "Family").unwrap();

        let msg = make_message("Mom <Mom@Family.net>", "Dinner", "Sunday?");
        let result = engine.evaluate(&msg).unwrap();
        assert_eq!(result.action, Action::label("Family"));
        assert_eq!(result.source, ClassificationSource::Rule);
    }

    #[test]
    fn rule_substring_matches_domain_fragment() {
        let mut engine = RulesEngine::empty();
        engine.add_rule("@corp.com", "Work").unwrap();

        let msg = make_message("boss@corp.com", "Standup", "");
        assert_eq!(engine.evaluate(&msg).unwrap().action, Action::label("Work"));
    }

    #[test]
    fn first_matching_rule_wins() {
        let mut engine = RulesEngine::empty();
        engine.add_rule("bank.com", "Finance").unwrap();
        engine.add_rule("alerts@bank.com", "Receipts").unwrap();

        let msg = make_message("alerts@bank.com", "Alert", "");
        assert_eq!(engine.evaluate(&msg).unwrap().action, Action::label("Finance"));
    }

    #[test]
    fn rule_beats_kill_list() {
        let mut engine = RulesEngine::empty();
        engine.add_rule("friend@reddit.com", "Personal").unwrap();
        engine.add_kill_entry(&domain("reddit.com")).unwrap();

        let msg = make_message("friend@reddit.com", "hi", "");
        let result = engine.evaluate(&msg).unwrap();
        assert_eq!(result.action, Action::label("Personal"));

        let other = make_message("digest@reddit.com", "Top posts", "");
        assert_eq!(engine.evaluate(&other).unwrap().action, Action::Delete);
    }

    #[test]
    fn kill_list_domain_scope_uses_sender_domain() {
        let mut engine = RulesEngine::empty();
        engine.add_kill_entry(&domain("temu.com")).unwrap();

        let msg = make_message("Deals <deals@mail.temu.com>", "Sale", "");
        let result = engine.evaluate(&msg).unwrap();
        assert_eq!(result.action, Action::Delete);
        assert_eq!(result.source, ClassificationSource::KillList);

        // Domain in subject only does not match a domain-scoped entry
        let msg = make_message("friend@x.com", "check temu.com", "");
        assert!(engine.evaluate(&msg).is_none());
    }

    #[test]
    fn kill_list_subject_and_body_scopes() {
        let mut engine = RulesEngine::empty();
        engine
            .add_kill_entry(&KillListEntry {
                pattern: "you have won".into(),
                scope: KillScope::Subject,
            })
            .unwrap();
        engine
            .add_kill_entry(&KillListEntry {
                pattern: "/crypto\\s+giveaway/".into(),
                scope: KillScope::Body,
            })
            .unwrap();

        let subject_hit = make_message("x@y.com", "YOU HAVE WON a prize", "");
        assert_eq!(engine.evaluate(&subject_hit).unwrap().action, Action::Delete);

        let body_hit = make_message("x@y.com", "hello", "Join our Crypto   Giveaway now");
        assert_eq!(engine.evaluate(&body_hit).unwrap().action, Action::Delete);
    }

    #[test]
    fn regex_pattern_is_case_insensitive() {
        let pattern = Pattern::parse("/^billing@/").unwrap();
        assert!(pattern.is_match("Billing@power.com"));
        assert!(!pattern.is_match("me-billing@power.com"));
    }

    #[test]
    fn invalid_regex_is_rejected() {
        let err = Pattern::parse("/(unclosed/").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPattern { .. }));
    }

    #[test]
    fn empty_pattern_is_rejected() {
        assert!(Pattern::parse("   ").is_err());
    }

    #[test]
    fn unmatched_message_falls_through() {
        let engine = RulesEngine::from_config(&MailConfig::default()).unwrap();
        let msg = make_message("alice@company.com", "Meeting", "Tuesday?");
        assert!(engine.evaluate(&msg).is_none());
    }

    #[test]
    fn from_config_compiles_rules_and_default_kill_list() {
        let mut config = MailConfig::default();
        config.label_rules.set("Work", vec!["@corp.com".into()]);
        let engine = RulesEngine::from_config(&config).unwrap();
        assert_eq!(engine.rule_count(), 1);
        assert_eq!(engine.kill_count(), 3);

        let msg = make_message("noise@quora.com", "Answer", "");
        assert_eq!(engine.evaluate(&msg).unwrap().action, Action::Delete);
    }

    #[test]
    fn from_config_rejects_bad_pattern() {
        let mut config = MailConfig::default();
        config.label_rules.set("Work", vec!["/[/".into()]);
        assert!(RulesEngine::from_config(&config).is_err());
    }

    #[test]
    fn empty_rules_passes_everything() {
        let engine = RulesEngine::empty();
        let msg = make_message("noreply@quora.com", "Spam", "Buy now");
        assert!(engine.evaluate(&msg).is_none());
    }
}
