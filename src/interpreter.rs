//! Turn interpretation using the configured chat model
//!
//! Turns raw user text into a [`TurnResult`]: the reply to show plus the
//! risk and medication signals the escalation engine consumes.

use crate::db::{Sender, TurnSignals};
use crate::llm::{
    LlmError, LlmMessage, LlmRequest, LlmService, ModelRegistry, ResponseFormat, SystemContent,
};
use crate::state_machine::{InvalidRiskLevel, RiskLevel};
use crate::system_prompt::build_system_prompt;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;

/// Reply shown whenever interpretation fails
pub const FALLBACK_REPLY: &str = "아이구 할머니, 잠시 반디가 졸았나봐요. 다시 말씀해 주시겠어요?";

const INTERPRET_TIMEOUT: Duration = Duration::from_secs(20);
const MAX_REPLY_TOKENS: u32 = 512;

#[derive(Debug, Error)]
pub enum InterpretError {
    #[error("Model call failed: {}", .0.message)]
    Provider(LlmError),
    #[error("Model call timed out")]
    Timeout,
    #[error("Malformed model output: {0}")]
    Malformed(String),
    #[error(transparent)]
    InvalidRiskLevel(#[from] InvalidRiskLevel),
    #[error("No language model configured")]
    Unavailable,
}

/// One earlier turn given to the model as context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub time: DateTime<Utc>,
    pub speaker: Sender,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterpretRequest {
    pub user_id: String,
    pub display_name: Option<String>,
    pub message: String,
    /// Oldest first
    pub recent_history: Vec<HistoryEntry>,
    pub medication_confirmed_today: bool,
}

/// Structured model output for one user message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnResult {
    pub reply: String,
    pub level: RiskLevel,
    pub reason: String,
    pub medication_checked: bool,
    pub medication_taken: Option<bool>,
    pub play_media_keyword: Option<String>,
    pub show_media_keyword: Option<String>,
}

impl TurnResult {
    /// Signals stored on the ai turn
    pub fn signals(&self) -> TurnSignals {
        TurnSignals {
            risk_level: self.level,
            reason: self.reason.clone(),
            medication_checked: self.medication_checked,
            medication_taken: self.medication_taken,
        }
    }
}

/// Boundary to whatever turns user text into a [`TurnResult`]
#[async_trait]
pub trait TurnInterpreter: Send + Sync {
    async fn interpret(&self, request: &InterpretRequest) -> Result<TurnResult, InterpretError>;
}

#[async_trait]
impl<T: TurnInterpreter + ?Sized> TurnInterpreter for Arc<T> {
    async fn interpret(&self, request: &InterpretRequest) -> Result<TurnResult, InterpretError> {
        (**self).interpret(request).await
    }
}

/// Interpreter backed by an [`LlmService`] in JSON-object mode
pub struct LlmTurnInterpreter {
    service: Option<Arc<dyn LlmService>>,
    timeout: Duration,
}

impl LlmTurnInterpreter {
    pub fn new(service: Option<Arc<dyn LlmService>>) -> Self {
        Self {
            service,
            timeout: INTERPRET_TIMEOUT,
        }
    }

    /// Use the registry's default model, if any
    pub fn from_registry(registry: &ModelRegistry) -> Self {
        let service = registry.default();
        match &service {
            Some(s) => tracing::info!(model = %s.model_id(), "Turn interpreter ready"),
            None => tracing::warn!("No LLM configured, every turn will get the fallback reply"),
        }
        Self::new(service)
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl TurnInterpreter for LlmTurnInterpreter {
    async fn interpret(&self, request: &InterpretRequest) -> Result<TurnResult, InterpretError> {
        let service = self.service.as_ref().ok_or(InterpretError::Unavailable)?;
        let llm_request = build_llm_request(request);

        let response = match timeout(self.timeout, service.complete(&llm_request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(InterpretError::Provider(e)),
            Err(_) => return Err(InterpretError::Timeout),
        };

        parse_turn_result(&response.content)
    }
}

/// Prompt, history and the new message as one JSON-mode request
pub fn build_llm_request(request: &InterpretRequest) -> LlmRequest {
    let mut messages: Vec<LlmMessage> = request
        .recent_history
        .iter()
        .filter(|entry| !entry.text.trim().is_empty())
        .map(|entry| match entry.speaker {
            Sender::User => LlmMessage::user(entry.text.clone()),
            Sender::Ai => LlmMessage::assistant(entry.text.clone()),
        })
        .collect();
    messages.push(LlmMessage::user(request.message.clone()));

    LlmRequest {
        system: vec![SystemContent::new(build_system_prompt(
            request.display_name.as_deref(),
            request.medication_confirmed_today,
        ))],
        messages,
        max_tokens: Some(MAX_REPLY_TOKENS),
        response_format: ResponseFormat::JsonObject,
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTurnResult {
    reply: String,
    level: RawLevel,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    medication_checked: bool,
    #[serde(default)]
    medication_taken: Option<bool>,
    #[serde(default)]
    play_media_keyword: Option<String>,
    #[serde(default)]
    show_media_keyword: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawLevel {
    Number(i64),
    Text(String),
}

/// Parse model output, tolerating Markdown fences and `"2"` style levels
pub fn parse_turn_result(raw: &str) -> Result<TurnResult, InterpretError> {
    let json = strip_code_fence(raw);
    let parsed: RawTurnResult =
        serde_json::from_str(json).map_err(|e| InterpretError::Malformed(e.to_string()))?;

    let level = match parsed.level {
        RawLevel::Number(n) => n,
        RawLevel::Text(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| InterpretError::Malformed(format!("level {s:?} is not a number")))?,
    };
    let level = RiskLevel::try_from(level)?;

    let reply = parsed.reply.trim().to_string();
    if reply.is_empty() {
        return Err(InterpretError::Malformed("empty reply".to_string()));
    }

    Ok(TurnResult {
        reply,
        level,
        reason: parsed.reason.trim().to_string(),
        medication_checked: parsed.medication_checked,
        medication_taken: parsed.medication_taken,
        play_media_keyword: non_blank(parsed.play_media_keyword),
        show_media_keyword: non_blank(parsed.show_media_keyword),
    })
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Skip the info string (```json)
    let body = rest.split_once('\n').map_or(rest, |(_, body)| body);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
