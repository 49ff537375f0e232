//! Ollama backend over the native `/api/chat` endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider,
};

const PROVIDER: &str = "ollama";

/// Connect timeout; the overall request timeout comes from config.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Ollama chat request (native API format, not OpenAI-compatible).
#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'static str>,
    options: OllamaOptions,
}

#[derive(Debug, Default, Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: OllamaResponseMessage,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: u32,
    #[serde(default)]
    eval_count: u32,
}

#[derive(Debug, Deserialize)]
struct OllamaResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct OllamaTags {
    #[serde(default)]
    models: Vec<OllamaModel>,
}

#[derive(Debug, Deserialize)]
struct OllamaModel {
    name: String,
}

/// Local Ollama server.
pub struct OllamaProvider {
    base_url: String,
    model: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: format!("Failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            timeout,
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn map_transport_error(&self, e: reqwest::Error) -> LlmError {
        if e.is_timeout() {
            LlmError::Timeout {
                provider: PROVIDER.to_string(),
                timeout: self.timeout,
            }
        } else if e.is_connect() {
            LlmError::Unreachable {
                provider: PROVIDER.to_string(),
                reason: e.to_string(),
            }
        } else {
            LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: e.to_string(),
            }
        }
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let url = format!("{}/api/chat", self.base_url);
        let body = OllamaChatRequest {
            model: &self.model,
            messages: &request.messages,
            stream: false,
            format: request.json_format.then_some("json"),
            options: OllamaOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
            },
        };

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(LlmError::ModelNotAvailable {
                provider: PROVIDER.to_string(),
                model: self.model.clone(),
            });
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: format!("status {status}: {}", text.trim()),
            });
        }

        let chat: OllamaChatResponse =
            resp.json().await.map_err(|e| LlmError::InvalidResponse {
                provider: PROVIDER.to_string(),
                reason: e.to_string(),
            })?;

        let content = chat.message.content.trim().to_string();
        if content.is_empty() {
            return Err(LlmError::InvalidResponse {
                provider: PROVIDER.to_string(),
                reason: "empty response".into(),
            });
        }

        let finish_reason = match chat.done_reason.as_deref() {
            Some("stop") => FinishReason::Stop,
            Some("length") => FinishReason::Length,
            _ => FinishReason::Unknown,
        };

        debug!(
            model = %self.model,
            input_tokens = chat.prompt_eval_count,
            output_tokens = chat.eval_count,
            "Ollama completion"
        );

        Ok(CompletionResponse {
            content,
            input_tokens: chat.prompt_eval_count,
            output_tokens: chat.eval_count,
            finish_reason,
        })
    }

    async fn health_check(&self) -> Result<(), LlmError> {
        // Ollama health check: GET /api/tags
        let url = format!("{}/api/tags", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        if !resp.status().is_success() {
            return Err(LlmError::Unreachable {
                provider: PROVIDER.to_string(),
                reason: format!("status {}", resp.status()),
            });
        }

        let tags: OllamaTags = resp.json().await.map_err(|e| LlmError::InvalidResponse {
            provider: PROVIDER.to_string(),
            reason: e.to_string(),
        })?;

        if tags
            .models
            .iter()
            .any(|m| model_matches(&m.name, &self.model))
        {
            Ok(())
        } else {
            Err(LlmError::ModelNotAvailable {
                provider: PROVIDER.to_string(),
                model: self.model.clone(),
            })
        }
    }
}

/// `llama3` matches an installed `llama3:latest`.
fn model_matches(installed: &str, wanted: &str) -> bool {
    if installed == wanted {
        return true;
    }
    !wanted.contains(':') && installed.strip_suffix(":latest") == Some(wanted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, http::StatusCode as AxumStatus, routing::{get, post}};

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn provider(url: &str) -> OllamaProvider {
        OllamaProvider::new(url, "qwen3:8b", Duration::from_secs(5)).unwrap()
    }

    fn request() -> CompletionRequest {
        CompletionRequest::new(vec![ChatMessage::user("classify")]).with_json_format()
    }

    #[test]
    fn model_name_matching() {
        assert!(model_matches("qwen3:8b", "qwen3:8b"));
        assert!(model_matches("llama3:latest", "llama3"));
        assert!(!model_matches("llama3:70b", "llama3"));
        assert!(!model_matches("qwen3:4b", "qwen3:8b"));
    }

    #[test]
    fn request_serializes_native_format() {
        let messages = vec![ChatMessage::system("s"), ChatMessage::user("u")];
        let body = OllamaChatRequest {
            model: "qwen3:8b",
            messages: &messages,
            stream: false,
            format: Some("json"),
            options: OllamaOptions {
                temperature: Some(0.0),
                num_predict: None,
            },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["stream"], false);
        assert_eq!(json["format"], "json");
        assert_eq!(json["messages"][1]["role"], "user");
        assert!(json["options"].get("num_predict").is_none());
    }

    #[tokio::test]
    async fn complete_returns_message_content() {
        let app = Router::new().route(
            "/api/chat",
            post(|Json(body): Json<serde_json::Value>| async move {
                assert_eq!(body["model"], "qwen3:8b");
                Json(serde_json::json!({
                    "message": {"role": "assistant", "content": " {\"category\": \"Work\"} "},
                    "done_reason": "stop",
                    "prompt_eval_count": 42,
                    "eval_count": 7
                }))
            }),
        );
        let url = serve(app).await;

        let resp = provider(&url).complete(request()).await.unwrap();
        assert_eq!(resp.content, "{\"category\": \"Work\"}");
        assert_eq!(resp.finish_reason, FinishReason::Stop);
        assert_eq!(resp.input_tokens, 42);
    }

    #[tokio::test]
    async fn missing_model_maps_to_model_not_available() {
        let app = Router::new().route(
            "/api/chat",
            post(|| async {
                (
                    AxumStatus::NOT_FOUND,
                    Json(serde_json::json!({"error": "model 'qwen3:8b' not found"})),
                )
            }),
        );
        let url = serve(app).await;

        let err = provider(&url).complete(request()).await.unwrap_err();
        assert!(matches!(err, LlmError::ModelNotAvailable { .. }));
    }

    #[tokio::test]
    async fn server_error_maps_to_request_failed() {
        let app = Router::new().route(
            "/api/chat",
            post(|| async { (AxumStatus::INTERNAL_SERVER_ERROR, "boom") }),
        );
        let url = serve(app).await;

        let err = provider(&url).complete(request()).await.unwrap_err();
        assert!(matches!(err, LlmError::RequestFailed { .. }));
    }

    #[tokio::test]
    async fn refused_connection_is_unreachable() {
        // Bind then drop to get a port with nothing listening.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = provider(&format!("http://{addr}"))
            .complete(request())
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Unreachable { .. }));
    }

    #[tokio::test]
    async fn health_check_requires_installed_model() {
        let app = Router::new().route(
            "/api/tags",
            get(|| async {
                Json(serde_json::json!({"models": [{"name": "llama3:latest"}]}))
            }),
        );
        let url = serve(app).await;

        let err = provider(&url).health_check().await.unwrap_err();
        assert!(matches!(err, LlmError::ModelNotAvailable { .. }));

        let llama = OllamaProvider::new(&url, "llama3", Duration::from_secs(5)).unwrap();
        assert!(llama.health_check().await.is_ok());
    }
}
