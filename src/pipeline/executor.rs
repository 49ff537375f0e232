//! Batch execution of routing decisions against Gmail.
//!
//! A cycle's decisions are grouped into a [`BatchPlan`]: one trash group and
//! one move group per target label. Each group becomes one `batchModify`
//! call (chunked at [`BATCH_MODIFY_LIMIT`] ids).

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::error::{GmailError, PipelineError};
use crate::gmail::{BATCH_MODIFY_LIMIT, GmailApi};

/// Labels stripped from trashed messages.
const TRASH_REMOVES: [&str; 3] = ["INBOX", "UNREAD", "IMPORTANT"];

/// Messages moved under one label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveGroup {
    pub label_id: String,
    pub label_name: String,
    pub message_ids: Vec<String>,
}

/// Pending Gmail mutations for one cycle.
#[derive(Debug, Default, Clone)]
pub struct BatchPlan {
    trash: Vec<String>,
    moves: Vec<MoveGroup>,
    seen: HashSet<String>,
}

impl BatchPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a message for trash. Returns false if it was already planned.
    pub fn add_trash(&mut self, message_id: &str) -> bool {
        if !self.seen.insert(message_id.to_string()) {
            return false;
        }
        self.trash.push(message_id.to_string());
        true
    }

    /// Queue a message to move under `label_id`.
    ///
    /// Returns false, planning nothing, when the target is `INBOX` (the
    /// message is already there) or the message was already planned.
    pub fn add_move(&mut self, label_id: &str, label_name: &str, message_id: &str) -> bool {
        if label_id.eq_ignore_ascii_case("INBOX") {
            return false;
        }
        if !self.seen.insert(message_id.to_string()) {
            return false;
        }
        match self.moves.iter_mut().find(|g| g.label_id == label_id) {
            Some(group) => group.message_ids.push(message_id.to_string()),
            None => self.moves.push(MoveGroup {
                label_id: label_id.to_string(),
                label_name: label_name.to_string(),
                message_ids: vec![message_id.to_string()],
            }),
        }
        true
    }

    pub fn trash(&self) -> &[String] {
        &self.trash
    }

    /// Move groups in first-planned order.
    pub fn moves(&self) -> &[MoveGroup] {
        &self.moves
    }

    /// Number of planned messages.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Per-message result of executing a plan.
#[derive(Debug, Default)]
pub struct ExecutionOutcome {
    /// Messages whose batch call succeeded.
    pub applied: Vec<String>,
    /// Messages whose batch call failed, with the error text.
    pub failed: Vec<(String, String)>,
}

impl ExecutionOutcome {
    pub fn is_applied(&self, message_id: &str) -> bool {
        self.applied.iter().any(|id| id == message_id)
    }

    pub fn failure(&self, message_id: &str) -> Option<&str> {
        self.failed
            .iter()
            .find(|(id, _)| id == message_id)
            .map(|(_, e)| e.as_str())
    }
}

/// Applies a [`BatchPlan`] through `batchModify`.
pub struct ActionExecutor {
    gmail: Arc<dyn GmailApi>,
}

impl ActionExecutor {
    pub fn new(gmail: Arc<dyn GmailApi>) -> Self {
        Self { gmail }
    }

    /// Run every group in the plan. A failed chunk never stops the rest.
    pub async fn execute(&self, plan: &BatchPlan) -> ExecutionOutcome {
        let mut outcome = ExecutionOutcome::default();

        if !plan.trash.is_empty() {
            let remove: Vec<String> = TRASH_REMOVES.iter().map(|s| s.to_string()).collect();
            self.apply_group(
                "trash",
                &plan.trash,
                &["TRASH".to_string()],
                &remove,
                &mut outcome,
            )
            .await;
        }

        for group in &plan.moves {
            self.apply_group(
                &format!("label {}", group.label_name),
                &group.message_ids,
                std::slice::from_ref(&group.label_id),
                &["INBOX".to_string()],
                &mut outcome,
            )
            .await;
        }

        if !outcome.applied.is_empty() || !outcome.failed.is_empty() {
            info!(
                applied = outcome.applied.len(),
                failed = outcome.failed.len(),
                "Batch plan executed"
            );
        }
        outcome
    }

    async fn apply_group(
        &self,
        action: &str,
        ids: &[String],
        add: &[String],
        remove: &[String],
        outcome: &mut ExecutionOutcome,
    ) {
        for chunk in ids.chunks(BATCH_MODIFY_LIMIT) {
            match self.gmail.batch_modify(chunk, add, remove).await {
                Ok(()) => {
                    debug!(action, count = chunk.len(), "batchModify applied");
                    outcome.applied.extend(chunk.iter().cloned());
                }
                Err(e) => {
                    let err = execute_error(action, chunk.len(), e);
                    error!("{err}");
                    let text = err.to_string();
                    outcome
                        .failed
                        .extend(chunk.iter().map(|id| (id.clone(), text.clone())));
                }
            }
        }
    }
}

fn execute_error(action: &str, count: usize, source: GmailError) -> PipelineError {
    PipelineError::Execute {
        action: action.to_string(),
        count,
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gmail::mock::MockGmail;
    use crate::pipeline::types::EmailMessage;
    use chrono::Utc;

    fn inbox_message(id: &str) -> EmailMessage {
        EmailMessage::new(id, "a@example.com", "s", "", Utc::now())
            .with_labels(vec!["INBOX".into(), "UNREAD".into()])
    }

    #[test]
    fn plan_groups_moves_by_label() {
        let mut plan = BatchPlan::new();
        assert!(plan.add_move("Label_1", "Work", "m1"));
        assert!(plan.add_move("Label_2", "Finance", "m2"));
        assert!(plan.add_move("Label_1", "Work", "m3"));
        assert!(plan.add_trash("m4"));

        assert_eq!(plan.moves().len(), 2);
        assert_eq!(plan.moves()[0].message_ids, ["m1", "m3"]);
        assert_eq!(plan.moves()[1].label_name, "Finance");
        assert_eq!(plan.trash(), ["m4"]);
        assert_eq!(plan.len(), 4);
    }

    #[test]
    fn plan_drops_inbox_target_and_duplicates() {
        let mut plan = BatchPlan::new();
        assert!(!plan.add_move("INBOX", "Inbox", "m1"));
        assert!(plan.is_empty());

        assert!(plan.add_trash("m2"));
        assert!(!plan.add_move("Label_1", "Work", "m2"));
        assert!(!plan.add_trash("m2"));
        assert_eq!(plan.len(), 1);
    }

    #[tokio::test]
    async fn trash_and_moves_use_one_call_per_group() {
        let gmail = Arc::new(
            MockGmail::new()
                .with_message(inbox_message("m1"))
                .with_message(inbox_message("m2"))
                .with_message(inbox_message("m3")),
        );
        let executor = ActionExecutor::new(gmail.clone());

        let mut plan = BatchPlan::new();
        plan.add_trash("m1");
        plan.add_move("Label_9", "Work", "m2");
        plan.add_move("Label_9", "Work", "m3");

        let outcome = executor.execute(&plan).await;
        assert_eq!(outcome.applied.len(), 3);
        assert!(outcome.failed.is_empty());
        assert_eq!(gmail.batch_count(), 2);

        assert_eq!(gmail.label_ids_of("m1"), ["TRASH"]);
        assert_eq!(gmail.label_ids_of("m2"), ["UNREAD", "Label_9"]);

        let batches = gmail.batches.lock().unwrap();
        assert_eq!(batches[0].remove, ["INBOX", "UNREAD", "IMPORTANT"]);
        assert_eq!(batches[1].remove, ["INBOX"]);
    }

    #[tokio::test]
    async fn large_groups_are_chunked() {
        let gmail = Arc::new(MockGmail::new());
        let executor = ActionExecutor::new(gmail.clone());

        let mut plan = BatchPlan::new();
        for i in 0..(BATCH_MODIFY_LIMIT + 5) {
            plan.add_trash(&format!("m{i}"));
        }

        let outcome = executor.execute(&plan).await;
        assert_eq!(outcome.applied.len(), BATCH_MODIFY_LIMIT + 5);
        let batches = gmail.batches.lock().unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].ids.len(), BATCH_MODIFY_LIMIT);
        assert_eq!(batches[1].ids.len(), 5);
    }

    #[tokio::test]
    async fn failed_group_does_not_block_others() {
        let gmail = Arc::new(
            MockGmail::new()
                .with_message(inbox_message("m1"))
                .with_message(inbox_message("m2")),
        );
        *gmail.fail_batch_adding.lock().unwrap() = Some("Label_bad".into());
        let executor = ActionExecutor::new(gmail.clone());

        let mut plan = BatchPlan::new();
        plan.add_move("Label_bad", "Broken", "m1");
        plan.add_move("Label_ok", "Work", "m2");

        let outcome = executor.execute(&plan).await;
        assert!(outcome.is_applied("m2"));
        assert!(!outcome.is_applied("m1"));
        assert!(outcome.failure("m1").unwrap().contains("label Broken"));
        assert!(gmail.label_ids_of("m1").contains(&"INBOX".to_string()));
    }
}
