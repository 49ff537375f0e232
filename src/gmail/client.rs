//! Gmail REST v1 client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::GmailError;
use crate::gmail::auth::TokenProvider;
use crate::gmail::retry::{RetryConfig, with_retry};
use crate::gmail::types::{
    ApiErrorBody, BatchModifyRequest, CreateLabelRequest, GmailLabel, GmailMessage, LabelList,
    MessageList, MessageRef,
};
use crate::pipeline::types::EmailMessage;

/// Production Gmail API root.
pub const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";

/// Gmail's per-call limit for `batchModify`.
pub const BATCH_MODIFY_LIMIT: usize = 1000;

/// Gmail's page size ceiling for `messages.list`.
const LIST_PAGE_LIMIT: u32 = 500;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Gmail operations the poller needs.
#[async_trait]
pub trait GmailApi: Send + Sync {
    /// Message IDs matching `query`, newest first, at most `max_results`.
    async fn list_messages(&self, query: &str, max_results: u32)
    -> Result<Vec<MessageRef>, GmailError>;

    /// Sender, subject, snippet and labels for one message.
    async fn get_message_metadata(&self, id: &str) -> Result<EmailMessage, GmailError>;

    async fn list_labels(&self) -> Result<Vec<GmailLabel>, GmailError>;

    /// Create a visible user label. An existing name is `GmailError::Conflict`.
    async fn create_label(&self, name: &str) -> Result<GmailLabel, GmailError>;

    /// Add and remove labels on up to [`BATCH_MODIFY_LIMIT`] messages.
    async fn batch_modify(
        &self,
        ids: &[String],
        add_label_ids: &[String],
        remove_label_ids: &[String],
    ) -> Result<(), GmailError>;
}

/// reqwest-backed [`GmailApi`] for the authenticated user (`me`).
pub struct GmailClient {
    base_url: String,
    http: reqwest::Client,
    tokens: Arc<dyn TokenProvider>,
    retry: RetryConfig,
}

impl GmailClient {
    pub fn new(tokens: Arc<dyn TokenProvider>) -> Result<Self, GmailError> {
        Self::with_base_url(tokens, GMAIL_API_BASE)
    }

    /// Point the client at another API root (a local fake in tests).
    pub fn with_base_url(
        tokens: Arc<dyn TokenProvider>,
        base_url: impl Into<String>,
    ) -> Result<Self, GmailError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            tokens,
            retry: RetryConfig::default(),
        })
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/users/me/{}", self.base_url, path)
    }

    /// Send once with the current token; on 401 refresh and send again.
    async fn send(
        &self,
        operation: &str,
        build: impl Fn() -> RequestBuilder,
    ) -> Result<Response, GmailError> {
        let token = self.tokens.access_token().await?;
        let response = build().bearer_auth(token.expose_secret()).send().await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return check_status(operation, response).await;
        }

        debug!(operation, "Access token rejected, forcing refresh");
        let token = self.tokens.force_refresh().await?;
        let response = build().bearer_auth(token.expose_secret()).send().await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(GmailError::Unauthorized);
        }
        check_status(operation, response).await
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        build: impl Fn() -> RequestBuilder,
    ) -> Result<T, GmailError> {
        let response = self.send(operation, build).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| GmailError::InvalidResponse {
                operation: operation.to_string(),
                reason: e.to_string(),
            })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http.request(method, self.url(path))
    }
}

/// Map non-success statuses to typed errors.
async fn check_status(operation: &str, response: Response) -> Result<Response, GmailError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let text = response.text().await.unwrap_or_default();
    let body = serde_json::from_str::<ApiErrorBody>(&text)
        .map(|b| b.error.message)
        .unwrap_or(text);

    // Gmail reports per-user quota exhaustion as 403 rateLimitExceeded.
    let quota = status == StatusCode::FORBIDDEN
        && (body.contains("rateLimitExceeded")
            || body.to_lowercase().contains("rate limit exceeded"));

    match status {
        StatusCode::TOO_MANY_REQUESTS => Err(GmailError::RateLimited {
            operation: operation.to_string(),
            retry_after,
        }),
        _ if quota => Err(GmailError::RateLimited {
            operation: operation.to_string(),
            retry_after,
        }),
        StatusCode::CONFLICT => Err(GmailError::Conflict(body)),
        _ => Err(GmailError::Api {
            operation: operation.to_string(),
            status: status.as_u16(),
            body,
        }),
    }
}

#[async_trait]
impl GmailApi for GmailClient {
    async fn list_messages(
        &self,
        query: &str,
        max_results: u32,
    ) -> Result<Vec<MessageRef>, GmailError> {
        let mut refs = Vec::new();
        let mut page_token: Option<String> = None;

        while (refs.len() as u32) < max_results {
            let page_size = (max_results - refs.len() as u32).min(LIST_PAGE_LIMIT);
            let page: MessageList = with_retry(&self.retry, "messages.list", || {
                self.send_json("messages.list", || {
                    let mut req = self
                        .request(Method::GET, "messages")
                        .query(&[("q", query)])
                        .query(&[("maxResults", page_size)]);
                    if let Some(token) = &page_token {
                        req = req.query(&[("pageToken", token.as_str())]);
                    }
                    req
                })
            })
            .await?;

            refs.extend(page.messages);
            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        refs.truncate(max_results as usize);
        debug!(query, count = refs.len(), "Listed messages");
        Ok(refs)
    }

    async fn get_message_metadata(&self, id: &str) -> Result<EmailMessage, GmailError> {
        let path = format!("messages/{id}");
        let message: GmailMessage = with_retry(&self.retry, "messages.get", || {
            self.send_json("messages.get", || {
                self.request(Method::GET, &path).query(&[
                    ("format", "metadata"),
                    ("metadataHeaders", "From"),
                    ("metadataHeaders", "Subject"),
                ])
            })
        })
        .await?;
        Ok(message.into_email())
    }

    async fn list_labels(&self) -> Result<Vec<GmailLabel>, GmailError> {
        let list: LabelList = with_retry(&self.retry, "labels.list", || {
            self.send_json("labels.list", || self.request(Method::GET, "labels"))
        })
        .await?;
        Ok(list.labels)
    }

    async fn create_label(&self, name: &str) -> Result<GmailLabel, GmailError> {
        let body = CreateLabelRequest::visible(name);
        let label: GmailLabel = with_retry(&self.retry, "labels.create", || {
            self.send_json("labels.create", || {
                self.request(Method::POST, "labels").json(&body)
            })
        })
        .await?;
        debug!(name, id = %label.id, "Created label");
        Ok(label)
    }

    async fn batch_modify(
        &self,
        ids: &[String],
        add_label_ids: &[String],
        remove_label_ids: &[String],
    ) -> Result<(), GmailError> {
        if ids.is_empty() {
            return Ok(());
        }
        if ids.len() > BATCH_MODIFY_LIMIT {
            warn!(count = ids.len(), "batchModify called above Gmail's limit");
        }
        let body = BatchModifyRequest {
            ids,
            add_label_ids,
            remove_label_ids,
        };
        with_retry(&self.retry, "messages.batchModify", || async {
            self.send("messages.batchModify", || {
                self.request(Method::POST, "messages/batchModify").json(&body)
            })
            .await
            .map(|_| ())
        })
        .await
    }
}
