//! `OpenAI`-compatible chat completions (Groq and `OpenAI`)

use super::types::{LlmRequest, LlmResponse, MessageRole, ResponseFormat, Usage};
use super::{LlmError, LlmErrorKind, LlmService, Provider};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const GROQ_CHAT_URL: &str = "https://api.groq.com/openai/v1/chat/completions";
const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";

/// Chat models reachable through an `OpenAI`-compatible endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatModel {
    /// Groq-hosted Llama 3.1 70B
    Llama31Versatile,
    /// Groq-hosted Llama 3.1 8B
    Llama31Instant,
    Gpt4oMini,
}

impl ChatModel {
    pub fn api_name(self) -> &'static str {
        match self {
            ChatModel::Llama31Versatile => "llama-3.1-70b-versatile",
            ChatModel::Llama31Instant => "llama-3.1-8b-instant",
            ChatModel::Gpt4oMini => "gpt-4o-mini",
        }
    }

    pub fn provider(self) -> Provider {
        match self {
            ChatModel::Llama31Versatile | ChatModel::Llama31Instant => Provider::Groq,
            ChatModel::Gpt4oMini => Provider::OpenAI,
        }
    }

    fn endpoint(self, gateway: Option<&str>) -> String {
        match (gateway, self.provider()) {
            (Some(gw), Provider::Groq) => {
                format!("{}/groq/openai/v1/chat/completions", gw.trim_end_matches('/'))
            }
            (Some(gw), Provider::OpenAI) => {
                format!("{}/openai/v1/chat/completions", gw.trim_end_matches('/'))
            }
            (None, Provider::Groq) => GROQ_CHAT_URL.to_string(),
            (None, Provider::OpenAI) => OPENAI_CHAT_URL.to_string(),
        }
    }
}

/// OpenAI-compatible service implementation
pub struct OpenAIService {
    client: Client,
    api_key: String,
    model: ChatModel,
    base_url: String,
}

impl OpenAIService {
    pub fn new(api_key: String, model: ChatModel, gateway: Option<&str>) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| LlmError::unknown(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_key,
            model,
            base_url: model.endpoint(gateway),
        })
    }

    fn translate_request(&self, request: &LlmRequest) -> ChatRequest {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);

        if !request.system.is_empty() {
            let system_text = request
                .system
                .iter()
                .map(|s| s.text.as_str())
                .collect::<Vec<_>>()
                .join("\n\n");
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: system_text,
            });
        }

        for msg in &request.messages {
            let role = match msg.role {
                MessageRole::User => "user",
                MessageRole::Assistant => "assistant",
            };
            messages.push(ChatMessage {
                role: role.to_string(),
                content: msg.content.clone(),
            });
        }

        let response_format = match request.response_format {
            ResponseFormat::Text => None,
            ResponseFormat::JsonObject => Some(ChatResponseFormat {
                r#type: "json_object".to_string(),
            }),
        };

        ChatRequest {
            model: self.model.api_name().to_string(),
            messages,
            max_tokens: request.max_tokens,
            response_format,
            stream: false,
        }
    }

    fn normalize_response(resp: ChatResponse) -> Result<LlmResponse, LlmError> {
        let choice = resp
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::invalid_response("No choices in response"))?;

        let usage = resp.usage.unwrap_or_default();
        Ok(LlmResponse {
            content: choice.message.content.unwrap_or_default(),
            end_turn: choice.finish_reason.as_deref() == Some("stop"),
            usage: Usage {
                input_tokens: u64::from(usage.prompt_tokens),
                output_tokens: u64::from(usage.completion_tokens),
            },
        })
    }
}

#[async_trait]
impl LlmService for OpenAIService {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let chat_request = self.translate_request(request);

        let response = self
            .client
            .post(&self.base_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&chat_request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::network(format!("Request timeout: {e}"))
                } else if e.is_connect() {
                    LlmError::network(format!("Connection failed: {e}"))
                } else {
                    LlmError::unknown(format!("Request failed: {e}"))
                }
            })?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response
            .text()
            .await
            .map_err(|e| LlmError::network(format!("Failed to read response: {e}")))?;

        if !status.is_success() {
            let message = serde_json::from_str::<ChatErrorResponse>(&body)
                .map_or(body, |e| e.error.message);
            let error = LlmError::new(
                LlmErrorKind::from_status(status.as_u16()),
                format!("HTTP {status}: {message}"),
            );
            return Err(match retry_after {
                Some(after) => error.with_retry_after(after),
                None => error,
            });
        }

        let chat_response: ChatResponse = serde_json::from_str(&body).map_err(|e| {
            LlmError::invalid_response(format!("Failed to parse response: {e} - body: {body}"))
        })?;

        Self::normalize_response(chat_response)
    }

    fn model_id(&self) -> &str {
        self.model.api_name()
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ChatResponseFormat>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatResponseFormat {
    r#type: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[allow(clippy::struct_field_names)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatErrorResponse {
    error: ChatError,
}

#[derive(Debug, Deserialize)]
struct ChatError {
    message: String,
}
