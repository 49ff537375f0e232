//! Gmail REST v1 wire types.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::types::EmailMessage;

/// Fallback subject for messages without one.
pub const NO_SUBJECT: &str = "(No Subject)";
/// Fallback sender for messages without a `From` header.
pub const UNKNOWN_SENDER: &str = "(Unknown)";

/// `users.messages.list` response.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageList {
    #[serde(default)]
    pub messages: Vec<MessageRef>,
    #[serde(default)]
    pub next_page_token: Option<String>,
    #[serde(default)]
    pub result_size_estimate: u32,
}

/// Message ID pair returned by list calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRef {
    pub id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
}

/// `users.messages.get` response (`format=metadata`).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailMessage {
    pub id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub label_ids: Vec<String>,
    #[serde(default)]
    pub snippet: String,
    /// Milliseconds since the epoch, as a decimal string.
    #[serde(default)]
    pub internal_date: Option<String>,
    #[serde(default)]
    pub payload: Option<MessagePayload>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessagePayload {
    #[serde(default)]
    pub headers: Vec<Header>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Header {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

impl GmailMessage {
    /// First header with this name, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.payload
            .as_ref()?
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    pub fn received_at(&self) -> Option<DateTime<Utc>> {
        let millis: i64 = self.internal_date.as_deref()?.parse().ok()?;
        Utc.timestamp_millis_opt(millis).single()
    }

    pub fn into_email(self) -> EmailMessage {
        let from = self
            .header("From")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(UNKNOWN_SENDER)
            .to_string();
        let subject = self
            .header("Subject")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(NO_SUBJECT)
            .to_string();
        let received_at = self.received_at().unwrap_or_else(Utc::now);

        let mut email = EmailMessage::new(
            self.id,
            from,
            subject,
            unescape_snippet(&self.snippet),
            received_at,
        )
        .with_labels(self.label_ids);
        if let Some(thread_id) = self.thread_id {
            email = email.with_thread_id(thread_id);
        }
        email
    }
}

/// Gmail returns snippets HTML-escaped.
fn unescape_snippet(snippet: &str) -> String {
    snippet
        .replace("&#39;", "'")
        .replace("&quot;", "\"")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

/// `users.labels.list` response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LabelList {
    #[serde(default)]
    pub labels: Vec<GmailLabel>,
}

/// A Gmail label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GmailLabel {
    pub id: String,
    pub name: String,
    /// `system` or `user`.
    #[serde(rename = "type", default)]
    pub label_type: Option<String>,
}

/// `users.labels.create` request body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateLabelRequest<'a> {
    pub name: &'a str,
    pub label_list_visibility: &'static str,
    pub message_list_visibility: &'static str,
}

impl<'a> CreateLabelRequest<'a> {
    pub fn visible(name: &'a str) -> Self {
        Self {
            name,
            label_list_visibility: "labelShow",
            message_list_visibility: "show",
        }
    }
}

/// `users.messages.batchModify` request body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchModifyRequest<'a> {
    pub ids: &'a [String],
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    pub add_label_ids: &'a [String],
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    pub remove_label_ids: &'a [String],
}

/// Google API error envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorDetail {
    #[serde(default)]
    pub code: u16,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub status: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_message_converts_to_email() {
        let raw = r#"{
            "id": "18c1",
            "threadId": "18c0",
            "labelIds": ["INBOX", "UNREAD"],
            "snippet": "Your bill is ready &amp; it&#39;s due",
            "internalDate": "1700000000000",
            "payload": {"headers": [
                {"name": "from", "value": "Power Co <billing@power.com>"},
                {"name": "Subject", "value": "March bill"}
            ]}
        }"#;
        let msg: GmailMessage = serde_json::from_str(raw).unwrap();
        let email = msg.into_email();

        assert_eq!(email.id, "18c1");
        assert_eq!(email.thread_id.as_deref(), Some("18c0"));
        assert_eq!(email.sender, "billing@power.com");
        assert_eq!(email.sender_domain, "power.com");
        assert_eq!(email.subject, "March bill");
        assert_eq!(email.snippet, "Your bill is ready & it's due");
        assert_eq!(email.received_at.timestamp(), 1_700_000_000);
        assert!(email.has_label("INBOX"));
    }

    #[test]
    fn missing_headers_get_placeholders() {
        let msg: GmailMessage = serde_json::from_str(r#"{"id": "x"}"#).unwrap();
        let email = msg.into_email();
        assert_eq!(email.from, UNKNOWN_SENDER);
        assert_eq!(email.subject, NO_SUBJECT);
        assert_eq!(email.sender_domain, "unknown");
    }

    #[test]
    fn empty_list_has_no_messages_field() {
        let list: MessageList = serde_json::from_str(r#"{"resultSizeEstimate": 0}"#).unwrap();
        assert!(list.messages.is_empty());
    }

    #[test]
    fn batch_modify_omits_empty_lists() {
        let ids = vec!["a".to_string()];
        let add = vec!["TRASH".to_string()];
        let body = BatchModifyRequest {
            ids: &ids,
            add_label_ids: &add,
            remove_label_ids: &[],
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["addLabelIds"][0], "TRASH");
        assert!(json.get("removeLabelIds").is_none());
    }

    #[test]
    fn label_type_field_is_renamed() {
        let label: GmailLabel =
            serde_json::from_str(r#"{"id": "Label_1", "name": "Work", "type": "user"}"#).unwrap();
        assert_eq!(label.label_type.as_deref(), Some("user"));
    }
}
