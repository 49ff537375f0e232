//! In-memory Gmail used by unit tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::error::GmailError;
use crate::gmail::client::GmailApi;
use crate::gmail::types::{GmailLabel, MessageRef};
use crate::pipeline::types::EmailMessage;

/// One recorded `batchModify` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchCall {
    pub ids: Vec<String>,
    pub add: Vec<String>,
    pub remove: Vec<String>,
}

/// Fake mailbox. `list_messages` ignores the query and returns messages
/// still carrying `INBOX`; `batch_modify` applies label changes in place.
#[derive(Default)]
pub struct MockGmail {
    pub messages: Mutex<Vec<EmailMessage>>,
    pub labels: Mutex<Vec<GmailLabel>>,
    pub batches: Mutex<Vec<BatchCall>>,
    /// `batchModify` calls adding this label ID fail with a 500.
    pub fail_batch_adding: Mutex<Option<String>>,
    /// `messages.list` fails with a 500 while set.
    pub fail_list: Mutex<bool>,
    pub metadata_calls: AtomicUsize,
    pub create_calls: AtomicUsize,
    next_label: AtomicUsize,
}

impl MockGmail {
    pub fn new() -> Self {
        let mock = Self::default();
        for id in ["INBOX", "SPAM", "TRASH", "UNREAD", "IMPORTANT", "STARRED"] {
            mock.push_label(id, id, "system");
        }
        mock
    }

    pub fn with_message(self, message: EmailMessage) -> Self {
        self.messages.lock().unwrap().push(message);
        self
    }

    pub fn push_label(&self, id: &str, name: &str, label_type: &str) {
        self.labels.lock().unwrap().push(GmailLabel {
            id: id.to_string(),
            name: name.to_string(),
            label_type: Some(label_type.to_string()),
        });
    }

    pub fn label_ids_of(&self, message_id: &str) -> Vec<String> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.id == message_id)
            .map(|m| m.label_ids.clone())
            .unwrap_or_default()
    }

    pub fn label_id_named(&self, name: &str) -> Option<String> {
        self.labels
            .lock()
            .unwrap()
            .iter()
            .find(|l| l.name.eq_ignore_ascii_case(name))
            .map(|l| l.id.clone())
    }

    pub fn batch_count(&self) -> usize {
        self.batches.lock().unwrap().len()
    }

    fn server_error(operation: &str) -> GmailError {
        GmailError::Api {
            operation: operation.to_string(),
            status: 500,
            body: "backend error".into(),
        }
    }
}

#[async_trait]
impl GmailApi for MockGmail {
    async fn list_messages(
        &self,
        _query: &str,
        max_results: u32,
    ) -> Result<Vec<MessageRef>, GmailError> {
        if *self.fail_list.lock().unwrap() {
            return Err(Self::server_error("messages.list"));
        }
        Ok(self
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.has_label("INBOX"))
            .take(max_results as usize)
            .map(|m| MessageRef {
                id: m.id.clone(),
                thread_id: m.thread_id.clone(),
            })
            .collect())
    }

    async fn get_message_metadata(&self, id: &str) -> Result<EmailMessage, GmailError> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        self.messages
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.id == id)
            .cloned()
            .ok_or_else(|| GmailError::Api {
                operation: "messages.get".into(),
                status: 404,
                body: "Requested entity was not found.".into(),
            })
    }

    async fn list_labels(&self) -> Result<Vec<GmailLabel>, GmailError> {
        Ok(self.labels.lock().unwrap().clone())
    }

    async fn create_label(&self, name: &str) -> Result<GmailLabel, GmailError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if self.label_id_named(name).is_some() {
            return Err(GmailError::Conflict(format!("Label name exists: {name}")));
        }
        let id = format!("Label_{}", self.next_label.fetch_add(1, Ordering::SeqCst) + 1);
        self.push_label(&id, name, "user");
        Ok(GmailLabel {
            id,
            name: name.to_string(),
            label_type: Some("user".into()),
        })
    }

    async fn batch_modify(
        &self,
        ids: &[String],
        add_label_ids: &[String],
        remove_label_ids: &[String],
    ) -> Result<(), GmailError> {
        if let Some(failing) = self.fail_batch_adding.lock().unwrap().as_ref()
            && add_label_ids.contains(failing)
        {
            return Err(Self::server_error("messages.batchModify"));
        }

        self.batches.lock().unwrap().push(BatchCall {
            ids: ids.to_vec(),
            add: add_label_ids.to_vec(),
            remove: remove_label_ids.to_vec(),
        });

        let mut messages = self.messages.lock().unwrap();
        for message in messages.iter_mut().filter(|m| ids.contains(&m.id)) {
            message.label_ids.retain(|l| !remove_label_ids.contains(l));
            for add in add_label_ids {
                if !message.label_ids.contains(add) {
                    message.label_ids.push(add.clone());
                }
            }
        }
        Ok(())
    }
}
