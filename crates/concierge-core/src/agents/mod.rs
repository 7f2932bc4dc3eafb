//! Agent contract, concrete agent variants, and the factory that builds them
//!
//! Every agent is shared as `Arc<dyn Agent>`. The factory is keyed by the
//! stored `type` field; each variant parses its own config struct out of the
//! opaque per-agent JSON.

pub mod classifier;
pub mod llm;
pub mod rules;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};

use crate::completion::{CompletionService, DEFAULT_MODEL};
use crate::context::OrchestrationContext;
use crate::error::AgentError;
use crate::types::{AgentConfig, AgentPriority, AgentResult, AgentType, Message, ProcessResult};

pub use classifier::{Category, Classification, ClassifierAgent, ClassifierConfig};
pub use llm::{LlmAgent, LlmConfig};
pub use rules::{Rule, RuleMatch, RuleOutput, RuleResponse, RulesAgent, RulesConfig};

/// Capability set every agent variant implements
#[async_trait]
pub trait Agent: Send + Sync {
    /// The stored definition this agent was built from
    fn config(&self) -> &AgentConfig;

    fn id(&self) -> &str {
        &self.config().id
    }

    fn name(&self) -> &str {
        &self.config().name
    }

    fn agent_type(&self) -> AgentType {
        self.config().agent_type
    }

    fn priority(&self) -> AgentPriority {
        self.config().priority
    }

    fn is_enabled(&self) -> bool {
        self.config().enabled
    }

    /// Whether `AgentResult::response` is meant for the customer.
    /// Routing agents return an explanation instead.
    fn produces_reply(&self) -> bool {
        true
    }

    /// One-time setup after construction
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Structural sanity check run before registration
    fn validate(&self) -> bool {
        let config = self.config();
        !config.id.trim().is_empty() && !config.name.trim().is_empty()
    }

    /// Cheap, read-only gate deciding whether this agent takes the current step
    async fn should_process(&self, ctx: &OrchestrationContext) -> bool;

    /// Decision or generation logic. Errors are reported as `success: false`.
    async fn generate_response(&self, message: &Message, ctx: &OrchestrationContext) -> AgentResult;

    /// Run the agent and wrap its output in the chain handoff envelope
    async fn process(&self, ctx: &OrchestrationContext) -> ProcessResult {
        let result = self.generate_response(&ctx.message, ctx).await;
        into_process_result(self.id(), self.produces_reply(), result)
    }
}

/// Translate an [`AgentResult`] into a [`ProcessResult`] for `agent_id`
pub fn into_process_result(agent_id: &str, produces_reply: bool, result: AgentResult) -> ProcessResult {
    let mut data = json!({ "metadata": result.metadata });
    if produces_reply && result.success {
        data["response"] = Value::String(result.response.clone());
    }

    ProcessResult::new(result.success, result.response, result.confidence)
        .with_agent(agent_id)
        .with_next_action(result.next_agent_id)
        .with_data(data)
}

/// Builds agents for types without a built-in implementation
pub type AgentBuilder = Arc<dyn Fn(&AgentConfig) -> Result<Arc<dyn Agent>, AgentError> + Send + Sync>;

/// Creates concrete agents from stored definitions
#[derive(Clone)]
pub struct AgentFactory {
    completion: Arc<dyn CompletionService>,
    default_model: String,
    builders: HashMap<AgentType, AgentBuilder>,
}

impl AgentFactory {
    pub fn new(completion: Arc<dyn CompletionService>) -> Self {
        Self {
            completion,
            default_model: DEFAULT_MODEL.to_string(),
            builders: HashMap::new(),
        }
    }

    /// Model for language-model agents whose config leaves it unset
    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        let model = model.into();
        if !model.trim().is_empty() {
            self.default_model = model;
        }
        self
    }

    /// Provide an implementation for `router`, `qa` or `custom` agents
    pub fn register_builder(&mut self, agent_type: AgentType, builder: AgentBuilder) {
        self.builders.insert(agent_type, builder);
    }

    /// Build the agent for `config`. Unknown types fail closed.
    pub fn build(&self, config: &AgentConfig) -> Result<Arc<dyn Agent>, AgentError> {
        match config.agent_type {
            AgentType::Rules => Ok(Arc::new(RulesAgent::from_config(config.clone())?)),
            AgentType::Classifier => Ok(Arc::new(ClassifierAgent::from_config(
                config.clone(),
                self.completion.clone(),
                &self.default_model,
            )?)),
            AgentType::Llm => Ok(Arc::new(LlmAgent::from_config(
                config.clone(),
                self.completion.clone(),
                &self.default_model,
            )?)),
            other => match self.builders.get(&other) {
                Some(builder) => builder(config),
                None => Err(AgentError::UnsupportedType {
                    id: config.id.clone(),
                    agent_type: other,
                }),
            },
        }
    }
}

/// Parse a variant's config out of the opaque JSON. `null` means "all defaults".
pub(crate) fn parse_agent_config<T>(config: &AgentConfig) -> Result<T, AgentError>
where
    T: serde::de::DeserializeOwned + Default,
{
    if config.config.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(config.config.clone())
        .map_err(|e| AgentError::invalid_config(&config.id, e.to_string()))
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Mutex;

    use anyhow::anyhow;
    use async_trait::async_trait;
    use chrono::Utc;

    use crate::completion::{CompletionOptions, CompletionService};
    use crate::context::OrchestrationContext;
    use crate::types::{Contact, Message, MessageDirection, MessageStatus};

    /// Completion service that replays canned replies and records prompts
    pub struct ScriptedCompletion {
        replies: Mutex<Vec<Result<String, String>>>,
        pub prompts: Mutex<Vec<(String, CompletionOptions)>>,
    }

    impl ScriptedCompletion {
        pub fn new(replies: Vec<Result<&str, &str>>) -> Self {
            Self {
                replies: Mutex::new(
                    replies
                        .into_iter()
                        .map(|r| r.map(str::to_string).map_err(str::to_string))
                        .collect(),
                ),
                prompts: Mutex::new(Vec::new()),
            }
        }

        pub fn call_count(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl CompletionService for ScriptedCompletion {
        fn provider_name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, prompt: &str, options: &CompletionOptions) -> anyhow::Result<String> {
            self.prompts
                .lock()
                .unwrap()
                .push((prompt.to_string(), options.clone()));
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                return Err(anyhow!("no scripted reply left"));
            }
            replies.remove(0).map_err(|e| anyhow!(e))
        }
    }

    pub fn message(content: &str) -> Message {
        Message {
            id: "m1".to_string(),
            contact_id: "c1".to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
            direction: MessageDirection::Incoming,
            is_ai_response: false,
            is_from_customer: true,
            is_sent: false,
            is_viewed: false,
            status: MessageStatus::Processing,
            agent_id: None,
            original_message_id: None,
        }
    }

    pub fn context(content: &str) -> OrchestrationContext {
        OrchestrationContext::new(
            message(content),
            Contact {
                id: "c1".to_string(),
                name: "Dana".to_string(),
                contact_info: "+15550100".to_string(),
                last_contact: None,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::ScriptedCompletion;
    use super::*;

    fn factory() -> AgentFactory {
        AgentFactory::new(Arc::new(ScriptedCompletion::new(vec![])))
    }

    #[test]
    fn test_factory_builds_builtin_types() {
        let factory = factory();

        let rules = AgentConfig::new("rules", "Rules", AgentType::Rules)
            .with_config(json!({ "rules": [{ "id": "hi", "pattern": "hello", "response": "Hi!" }] }));
        assert_eq!(factory.build(&rules).unwrap().agent_type(), AgentType::Rules);

        let classifier = AgentConfig::new("triage", "Triage", AgentType::Classifier)
            .with_config(json!({ "categories": [{ "id": "a", "name": "billing" }] }));
        assert_eq!(factory.build(&classifier).unwrap().agent_type(), AgentType::Classifier);

        let llm = AgentConfig::new("general", "General", AgentType::Llm);
        assert_eq!(factory.build(&llm).unwrap().agent_type(), AgentType::Llm);
    }

    #[test]
    fn test_factory_rejects_unsupported_type() {
        let config = AgentConfig::new("router", "Router", AgentType::Router);
        let err = factory().build(&config).err().unwrap();
        assert!(matches!(err, AgentError::UnsupportedType { agent_type: AgentType::Router, .. }));
    }

    #[test]
    fn test_factory_custom_builder() {
        let mut factory = factory();
        factory.register_builder(
            AgentType::Custom,
            Arc::new(|config: &AgentConfig| {
                let mut as_rules = config.clone();
                as_rules.agent_type = AgentType::Rules;
                Ok(Arc::new(RulesAgent::from_config(as_rules)?) as Arc<dyn Agent>)
            }),
        );
        let config = AgentConfig::new("custom", "Custom", AgentType::Custom);
        assert!(factory.build(&config).is_ok());
    }

    #[test]
    fn test_factory_reports_bad_config() {
        let config = AgentConfig::new("rules", "Rules", AgentType::Rules)
            .with_config(json!({ "rules": "not a list" }));
        let err = factory().build(&config).err().unwrap();
        assert!(matches!(err, AgentError::InvalidConfig { .. }));
    }

    #[test]
    fn test_into_process_result_carries_reply() {
        let result = AgentResult::success("Hello!", 0.9).with_next_agent(Some("next".to_string()));
        let processed = into_process_result("a1", true, result);
        assert!(processed.success);
        assert_eq!(processed.agent_id.as_deref(), Some("a1"));
        assert_eq!(processed.next_action.as_deref(), Some("next"));
        assert_eq!(processed.response_text(), Some("Hello!"));
        assert_eq!(processed.confidence, 0.9);
    }

    #[test]
    fn test_into_process_result_without_reply() {
        let result = AgentResult::success("Classified as billing", 0.9);
        let processed = into_process_result("triage", false, result);
        assert!(processed.response_text().is_none());
        assert_eq!(processed.message, "Classified as billing");
    }

    #[test]
    fn test_into_process_result_failure_has_no_reply() {
        let processed = into_process_result("a1", true, AgentResult::failure("Sorry"));
        assert!(!processed.success);
        assert!(processed.response_text().is_none());
        assert_eq!(processed.confidence, 0.0);
    }
}
