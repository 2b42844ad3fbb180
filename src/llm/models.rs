//! Centralized model definitions for all LLM providers

use super::openai::{ChatModel, OpenAIService};
use super::LlmService;
use std::sync::Arc;

/// LLM provider enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    Groq,
    OpenAI,
}

impl Provider {
    pub fn display_name(self) -> &'static str {
        match self {
            Provider::Groq => "Groq",
            Provider::OpenAI => "OpenAI",
        }
    }

    /// Environment variable holding this provider's API key
    pub fn api_key_env_var(self) -> &'static str {
        match self {
            Provider::Groq => "GROQ_API_KEY",
            Provider::OpenAI => "OPENAI_API_KEY",
        }
    }
}

/// Model definition with metadata
#[derive(Debug, Clone)]
pub struct ModelDef {
    /// Model ID, also the provider's API name
    pub id: &'static str,
    pub provider: Provider,
    pub description: &'static str,
    /// Factory function to create the service
    pub factory: fn(&str, Option<&str>) -> Result<Arc<dyn LlmService>, String>,
}

fn chat_factory(
    model: ChatModel,
    api_key: &str,
    gateway: Option<&str>,
) -> Result<Arc<dyn LlmService>, String> {
    if api_key.is_empty() {
        return Err(format!(
            "{} requires {} or gateway",
            model.api_name(),
            model.provider().api_key_env_var()
        ));
    }
    OpenAIService::new(api_key.to_string(), model, gateway)
        .map(|svc| Arc::new(svc) as Arc<dyn LlmService>)
        .map_err(|e| e.message)
}

/// Get all available model definitions
pub fn all_models() -> &'static [ModelDef] {
    &[
        ModelDef {
            id: "llama-3.1-70b-versatile",
            provider: Provider::Groq,
            description: "Llama 3.1 70B on Groq (default companion model)",
            factory: |api_key, gateway| chat_factory(ChatModel::Llama31Versatile, api_key, gateway),
        },
        ModelDef {
            id: "llama-3.1-8b-instant",
            provider: Provider::Groq,
            description: "Llama 3.1 8B on Groq (fast, cheaper)",
            factory: |api_key, gateway| chat_factory(ChatModel::Llama31Instant, api_key, gateway),
        },
        ModelDef {
            id: "gpt-4o-mini",
            provider: Provider::OpenAI,
            description: "GPT-4o mini (OpenAI alternative)",
            factory: |api_key, gateway| chat_factory(ChatModel::Gpt4oMini, api_key, gateway),
        },
    ]
}
