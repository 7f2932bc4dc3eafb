//! General-purpose language-model responder

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use super::{Agent, parse_agent_config};
use crate::completion::{CompletionOptions, CompletionService};
use crate::context::{MAX_PROMPT_HISTORY_TURNS, OrchestrationContext, build_agent_prompt, strip_speaker_label};
use crate::error::AgentError;
use crate::signal::{DEFAULT_RELEVANCE, extract_score};
use crate::types::{AgentConfig, AgentResult, Message, clamp_unit};

const RESPONSE_CONFIDENCE: f64 = 0.9;
const APOLOGY: &str = "I'm sorry, I'm having trouble answering right now. A member of our team will follow up shortly.";

/// Stored language-model agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub model: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub system_prompt: Option<String>,
    /// Minimum relevance score needed to engage
    pub relevance_threshold: f64,
    /// Skip the relevance check entirely
    pub always_respond: bool,
    /// Cheaper model for the relevance check. Falls back to `model`.
    pub relevance_model: Option<String>,
    pub history_turns: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: None,
            temperature: 0.7,
            max_tokens: 512,
            system_prompt: None,
            relevance_threshold: 0.6,
            always_respond: false,
            relevance_model: None,
            history_turns: MAX_PROMPT_HISTORY_TURNS,
        }
    }
}

pub struct LlmAgent {
    config: AgentConfig,
    settings: LlmConfig,
    model: String,
    completion: Arc<dyn CompletionService>,
}

impl std::fmt::Debug for LlmAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmAgent")
            .field("id", &self.config.id)
            .field("model", &self.model)
            .field("provider", &self.completion.provider_name())
            .finish()
    }
}

impl LlmAgent {
    pub fn new(
        config: AgentConfig,
        settings: LlmConfig,
        completion: Arc<dyn CompletionService>,
        default_model: &str,
    ) -> Self {
        let model = settings
            .model
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| default_model.to_string());
        Self {
            config,
            settings: LlmConfig {
                relevance_threshold: clamp_unit(settings.relevance_threshold),
                history_turns: settings.history_turns.min(MAX_PROMPT_HISTORY_TURNS),
                ..settings
            },
            model,
            completion,
        }
    }

    pub fn from_config(
        config: AgentConfig,
        completion: Arc<dyn CompletionService>,
        default_model: &str,
    ) -> Result<Self, AgentError> {
        let settings: LlmConfig = parse_agent_config(&config)?;
        if settings.max_tokens == 0 {
            return Err(AgentError::invalid_config(&config.id, "max_tokens must be positive"));
        }
        Ok(Self::new(config, settings, completion, default_model))
    }

    pub fn settings(&self) -> &LlmConfig {
        &self.settings
    }

    /// Ask the model how relevant `message` is to this agent. Never fails.
    pub async fn relevance_score(&self, message: &Message) -> f64 {
        let model = self
            .settings
            .relevance_model
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(&self.model);
        let options = CompletionOptions::new(model)
            .with_temperature(0.0)
            .with_max_tokens(10);

        let description = if self.config.description.is_empty() {
            "general customer support"
        } else {
            self.config.description.as_str()
        };
        let prompt = format!(
            "You decide whether an assistant should answer a customer message.\n\
             Assistant: {}\nRole: {}\n\nMessage: {}\n\n\
             How relevant is this message to the assistant's role? Answer with ONLY a number between 0 and 1.",
            self.config.name,
            description,
            message.content.trim()
        );

        match self.completion.complete(&prompt, &options).await {
            Ok(reply) => extract_score(&reply, DEFAULT_RELEVANCE),
            Err(e) => {
                warn!(
                    "Relevance check for agent '{}' failed, using default {}: {}",
                    self.config.id, DEFAULT_RELEVANCE, e
                );
                DEFAULT_RELEVANCE
            }
        }
    }

    fn system_prompt(&self) -> String {
        match self.settings.system_prompt.as_deref().filter(|p| !p.trim().is_empty()) {
            Some(prompt) => prompt.to_string(),
            None if self.config.description.is_empty() => format!(
                "You are {}, a customer support assistant. Reply to the customer helpfully and concisely.",
                self.config.name
            ),
            None => format!(
                "You are {}. {} Reply to the customer helpfully and concisely.",
                self.config.name,
                self.config.description.trim()
            ),
        }
    }
}

#[async_trait]
impl Agent for LlmAgent {
    fn config(&self) -> &AgentConfig {
        &self.config
    }

    async fn should_process(&self, ctx: &OrchestrationContext) -> bool {
        if self.settings.always_respond {
            return true;
        }
        let score = self.relevance_score(&ctx.message).await;
        debug!(
            "Agent '{}' relevance {:.2} (threshold {:.2})",
            self.config.id, score, self.settings.relevance_threshold
        );
        score >= self.settings.relevance_threshold
    }

    async fn generate_response(&self, _message: &Message, ctx: &OrchestrationContext) -> AgentResult {
        let prompt = build_agent_prompt(ctx, self.settings.history_turns);
        let options = CompletionOptions::new(&self.model)
            .with_temperature(self.settings.temperature)
            .with_max_tokens(self.settings.max_tokens)
            .with_system_prompt(self.system_prompt());

        let reply = match self.completion.complete(&prompt, &options).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Agent '{}' completion failed: {}", self.config.id, e);
                return AgentResult::failure(APOLOGY);
            }
        };

        let text = strip_speaker_label(&reply);
        if text.is_empty() {
            warn!("Agent '{}' got an empty completion", self.config.id);
            return AgentResult::failure(APOLOGY);
        }

        AgentResult::success(text, RESPONSE_CONFIDENCE).with_metadata(json!({
            "model": self.model,
            "provider": self.completion.provider_name(),
            "memory_used": !ctx.memory.is_empty(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::test_support::{ScriptedCompletion, context};
    use crate::context::MemoryContext;
    use crate::types::AgentType;

    fn agent(
        replies: Vec<Result<&str, &str>>,
        config: serde_json::Value,
    ) -> (LlmAgent, Arc<ScriptedCompletion>) {
        let completion = Arc::new(ScriptedCompletion::new(replies));
        let config = AgentConfig::new("general", "General", AgentType::Llm)
            .with_description("Answers questions about orders")
            .with_config(config);
        let agent = LlmAgent::from_config(config, completion.clone(), "big-model").unwrap();
        (agent, completion)
    }

    #[tokio::test]
    async fn test_relevance_failure_defaults_below_threshold() {
        let (agent, _) = agent(
            vec![Err("connection refused"), Err("connection refused")],
            serde_json::Value::Null,
        );
        let ctx = context("Where is my parcel?");
        assert_eq!(agent.relevance_score(&ctx.message).await, DEFAULT_RELEVANCE);
        // 0.5 < 0.6 default threshold
        assert!(!agent.should_process(&ctx).await);
    }

    #[tokio::test]
    async fn test_relevance_uses_cheap_model() {
        let (agent, completion) = agent(
            vec![Ok("0.85")],
            json!({ "relevance_model": "small-model" }),
        );
        assert!(agent.should_process(&context("Where is my order?")).await);

        let prompts = completion.prompts.lock().unwrap();
        assert_eq!(prompts[0].1.model, "small-model");
        assert_eq!(prompts[0].1.temperature, 0.0);
    }

    #[tokio::test]
    async fn test_unparseable_relevance_defaults() {
        let (agent, _) = agent(vec![Ok("very relevant!")], json!({ "relevance_threshold": 0.5 }));
        assert!(agent.should_process(&context("hi")).await);
    }

    #[tokio::test]
    async fn test_always_respond_skips_relevance_call() {
        let (agent, completion) = agent(vec![], json!({ "always_respond": true }));
        assert!(agent.should_process(&context("anything")).await);
        assert_eq!(completion.call_count(), 0);
    }

    #[tokio::test]
    async fn test_generate_strips_labels() {
        let (agent, completion) = agent(vec![Ok("Assistant: Your order ships tomorrow.")], serde_json::Value::Null);
        let ctx = context("Where is my order?").with_memory(MemoryContext {
            formatted: "- Ordered a blue kettle".to_string(),
            memories: vec![],
        });

        let result = agent.generate_response(&ctx.message, &ctx).await;
        assert!(result.success);
        assert_eq!(result.response, "Your order ships tomorrow.");
        assert_eq!(result.confidence, 0.9);

        let prompts = completion.prompts.lock().unwrap();
        let (prompt, options) = &prompts[0];
        assert!(prompt.contains("blue kettle"));
        assert_eq!(options.model, "big-model");
        assert!(options.system_prompt.as_deref().unwrap().contains("Answers questions about orders"));
    }

    #[tokio::test]
    async fn test_failure_does_not_leak_provider_error() {
        let (agent, _) = agent(vec![Err("status 401: invalid api key sk-abc")], serde_json::Value::Null);
        let ctx = context("hello");
        let result = agent.generate_response(&ctx.message, &ctx).await;
        assert!(!result.success);
        assert_eq!(result.confidence, 0.0);
        assert!(!result.response.contains("sk-abc"));
    }

    #[tokio::test]
    async fn test_empty_completion_is_failure() {
        let (agent, _) = agent(vec![Ok("AI:   ")], serde_json::Value::Null);
        let ctx = context("hello");
        assert!(!agent.generate_response(&ctx.message, &ctx).await.success);
    }

    #[test]
    fn test_history_turns_capped() {
        let (agent, _) = agent(vec![], json!({ "history_turns": 50 }));
        assert_eq!(agent.settings().history_turns, MAX_PROMPT_HISTORY_TURNS);
    }

    #[test]
    fn test_zero_max_tokens_rejected() {
        let completion = Arc::new(ScriptedCompletion::new(vec![]));
        let config = AgentConfig::new("x", "X", AgentType::Llm).with_config(json!({ "max_tokens": 0 }));
        assert!(LlmAgent::from_config(config, completion, "m").is_err());
    }
}
