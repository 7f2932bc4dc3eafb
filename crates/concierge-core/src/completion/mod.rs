//! Text completion service abstraction
//!
//! Agents only need "prompt in, text out". Implementations speak the
//! OpenAI-compatible chat-completions wire format ([`OpenAiCompletionClient`])
//! and can be composed with [`FailoverCompletion`] for automatic failover.

pub mod openai;
pub mod router;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use openai::{CompletionHttpError, OpenAiCompletionClient};
pub use router::FailoverCompletion;

/// Model used when neither the agent nor the configuration names one
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Per-call generation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionOptions {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl CompletionOptions {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: 0.7,
            max_tokens: 1024,
            system_prompt: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        let prompt = system_prompt.into();
        self.system_prompt = if prompt.is_empty() { None } else { Some(prompt) };
        self
    }
}

/// Trait that all completion backends implement
#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Human-readable backend name (e.g. "openai", "groq")
    fn provider_name(&self) -> &str;

    /// Complete `prompt` and return the generated text
    async fn complete(&self, prompt: &str, options: &CompletionOptions) -> Result<String>;
}
