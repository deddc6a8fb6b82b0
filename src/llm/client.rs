//! Completion client trait and the OpenAI-compatible HTTP implementation.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};

use super::types::{ChatRole, CompletionRequest, CompletionResponse};

/// Client for chat-completion calls.
///
/// Implementations must be thread-safe to allow concurrent subquery
/// planning and group summarization.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Complete a chat exchange.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse>;
}

/// Configuration for the chat-completions client.
#[derive(Debug, Clone)]
pub struct LlmClientConfig {
    /// API key sent as a bearer token.
    pub api_key: String,
    /// Base URL of an OpenAI-compatible API.
    pub base_url: String,
    /// Default model when the request names none.
    pub default_model: String,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl LlmClientConfig {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: base_url.into(),
            default_model: "llama-3.3-70b-versatile".to_string(),
            timeout_secs: 30,
        }
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

/// OpenAI-compatible `/chat/completions` client.
pub struct ChatCompletionsClient {
    config: LlmClientConfig,
    http: Client,
}

// Wire types for the chat-completions API.
#[derive(Debug, Serialize)]
struct ApiRequest {
    model: String,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    model: Option<String>,
    choices: Vec<ApiChoice>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

impl ChatCompletionsClient {
    pub fn new(config: LlmClientConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { config, http })
    }
}

#[async_trait]
impl CompletionClient for ChatCompletionsClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.config.default_model.clone());

        let messages = request
            .messages
            .iter()
            .map(|message| ApiMessage {
                role: match message.role {
                    ChatRole::System => "system".to_string(),
                    ChatRole::User => "user".to_string(),
                    ChatRole::Assistant => "assistant".to_string(),
                },
                content: message.content.clone(),
            })
            .collect();

        let api_request = ApiRequest {
            model: model.clone(),
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            response_format: request.json_mode.then(|| ResponseFormat {
                format_type: "json_object".to_string(),
            }),
        };

        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&api_request)
            .send()
            .await
            .map_err(|e| Error::Llm(format!("request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Llm(format!("failed to read response: {e}")))?;

        if !status.is_success() {
            if let Ok(parsed) = serde_json::from_str::<ApiError>(&body) {
                return Err(Error::Llm(format!(
                    "API error ({status}): {}",
                    parsed.error.message
                )));
            }
            return Err(Error::Llm(format!("API error ({status}): {body}")));
        }

        let parsed: ApiResponse = serde_json::from_str(&body)
            .map_err(|e| Error::Llm(format!("failed to parse response: {e}")))?;
        let content = parsed
            .choices
            .first()
            .map(|choice| choice.message.content.clone())
            .unwrap_or_default();

        Ok(CompletionResponse {
            content,
            model: parsed.model.unwrap_or(model),
        })
    }
}

#[cfg(test)]
pub(crate) mod doubles {
    //! In-memory completion client for tests.

    use std::sync::Mutex;

    use super::*;
    use crate::llm::types::CompletionRequest;

    /// Returns canned responses in order; errors once exhausted.
    pub struct ScriptedCompletionClient {
        responses: Mutex<Vec<String>>,
    }

    impl ScriptedCompletionClient {
        pub fn new(responses: Vec<String>) -> Self {
            Self {
                responses: Mutex::new(responses),
            }
        }
    }

    #[async_trait]
    impl CompletionClient for ScriptedCompletionClient {
        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse> {
            let mut guard = self
                .responses
                .lock()
                .map_err(|_| Error::Internal("poisoned scripted client".to_string()))?;
            if guard.is_empty() {
                return Err(Error::Llm("scripted client exhausted".to_string()));
            }
            Ok(CompletionResponse {
                content: guard.remove(0),
                model: "scripted".to_string(),
            })
        }
    }
}
