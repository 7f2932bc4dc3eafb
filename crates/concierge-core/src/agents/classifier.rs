//! Category classifier agent
//!
//! Asks the completion service to sort a message into one of the configured
//! categories and hands off to that category's `next_agent_id`. Replies it
//! cannot trust (unknown category, unparseable, below threshold) fall back to
//! the default category with a fixed confidence of 0.5.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use super::{Agent, parse_agent_config};
use crate::completion::{CompletionOptions, CompletionService};
use crate::context::OrchestrationContext;
use crate::error::AgentError;
use crate::signal::{RawClassification, parse_classification};
use crate::types::{AgentConfig, AgentResult, Message, clamp_unit};

const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.7;
const FALLBACK_CONFIDENCE: f64 = 0.5;

/// A category a message can be sorted into
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Agent that handles messages in this category
    #[serde(default)]
    pub next_agent_id: Option<String>,
}

impl Category {
    fn matches(&self, label: &str) -> bool {
        let label = label.trim();
        self.name.eq_ignore_ascii_case(label) || self.id.eq_ignore_ascii_case(label)
    }
}

/// Stored classifier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default)]
    pub categories: Vec<Category>,
    #[serde(default)]
    pub default_category_id: Option<String>,
    #[serde(default = "default_threshold")]
    pub confidence_threshold: f64,
    #[serde(default)]
    pub model: Option<String>,
}

fn default_threshold() -> f64 {
    DEFAULT_CONFIDENCE_THRESHOLD
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            categories: Vec::new(),
            default_category_id: None,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            model: None,
        }
    }
}

/// Outcome of resolving a model reply against the configured categories
#[derive(Debug, Clone)]
pub struct Classification {
    pub category: Category,
    pub confidence: f64,
    pub is_default: bool,
}

pub struct ClassifierAgent {
    config: AgentConfig,
    settings: ClassifierConfig,
    model: String,
    completion: Arc<dyn CompletionService>,
}

impl ClassifierAgent {
    pub fn new(
        config: AgentConfig,
        settings: ClassifierConfig,
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
            settings: ClassifierConfig {
                confidence_threshold: clamp_unit(settings.confidence_threshold),
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
        let settings: ClassifierConfig = parse_agent_config(&config)?;
        Ok(Self::new(config, settings, completion, default_model))
    }

    /// Configured default, or the first category
    fn default_category(&self) -> Option<&Category> {
        self.settings
            .default_category_id
            .as_deref()
            .and_then(|id| self.settings.categories.iter().find(|c| c.id == id))
            .or_else(|| self.settings.categories.first())
    }

    /// Map a parsed reply onto a configured category
    pub fn resolve(&self, raw: Option<RawClassification>) -> Option<Classification> {
        let named = raw.as_ref().and_then(|r| {
            self.settings
                .categories
                .iter()
                .find(|c| c.matches(&r.category))
                .map(|c| (c, r.confidence))
        });

        match named {
            Some((category, Some(confidence))) if confidence >= self.settings.confidence_threshold => {
                Some(Classification {
                    category: category.clone(),
                    confidence,
                    is_default: false,
                })
            }
            _ => {
                debug!(
                    "Classifier '{}' falling back to default category (reply: {:?})",
                    self.config.id, raw
                );
                self.default_category().map(|category| Classification {
                    category: category.clone(),
                    confidence: FALLBACK_CONFIDENCE,
                    is_default: true,
                })
            }
        }
    }

    fn build_prompt(&self, message: &Message) -> String {
        let mut prompt = String::from(
            "Classify the customer message into exactly one of the categories below.\n\n# CATEGORIES\n\n",
        );
        for category in &self.settings.categories {
            if category.description.is_empty() {
                prompt.push_str(&format!("- {}\n", category.name));
            } else {
                prompt.push_str(&format!("- {}: {}\n", category.name, category.description));
            }
        }
        prompt.push_str("\n# MESSAGE\n\n");
        prompt.push_str(message.content.trim());
        prompt.push_str(
            "\n\nRespond with ONLY valid JSON: {\"category\": \"<category name>\", \"confidence\": <number between 0 and 1>}",
        );
        prompt
    }
}

#[async_trait]
impl Agent for ClassifierAgent {
    fn config(&self) -> &AgentConfig {
        &self.config
    }

    fn produces_reply(&self) -> bool {
        false
    }

    fn validate(&self) -> bool {
        !self.config.id.trim().is_empty()
            && !self.config.name.trim().is_empty()
            && !self.settings.categories.is_empty()
    }

    async fn should_process(&self, _ctx: &OrchestrationContext) -> bool {
        self.is_enabled()
    }

    async fn generate_response(&self, message: &Message, _ctx: &OrchestrationContext) -> AgentResult {
        let options = CompletionOptions::new(&self.model)
            .with_temperature(0.0)
            .with_max_tokens(100);

        let reply = match self.completion.complete(&self.build_prompt(message), &options).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Classifier '{}' completion failed: {}", self.config.id, e);
                return AgentResult::failure("Unable to classify the message");
            }
        };

        let raw = parse_classification(&reply);
        let raw_category = raw.as_ref().map(|r| r.category.clone());
        let Some(classification) = self.resolve(raw) else {
            return AgentResult::failure("No categories configured");
        };

        let Classification {
            category,
            confidence,
            is_default,
        } = classification;

        debug!(
            "Classifier '{}': {} (confidence {:.2}, default={})",
            self.config.id, category.name, confidence, is_default
        );

        AgentResult::success(
            format!("Classified as {} (confidence {:.2})", category.name, confidence),
            confidence,
        )
        .with_metadata(json!({
            "category_id": category.id,
            "category_name": category.name,
            "is_default": is_default,
            "raw_category": raw_category,
        }))
        .with_next_agent(category.next_agent_id)
    }
}
