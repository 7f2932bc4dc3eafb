//! Deterministic pattern-matching agent
//!
//! Rules are tried in descending priority order; the first enabled rule whose
//! pattern matches answers with confidence 1.0. Ties keep configured order.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::{Captures, Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use super::{Agent, parse_agent_config};
use crate::context::OrchestrationContext;
use crate::error::AgentError;
use crate::types::{AgentConfig, AgentResult, Message};

const DEFAULT_FALLBACK: &str = "Sorry, I don't have an answer for that yet.";

static CONTACT_SEPARATOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\s*(?:,|&|\band\b)\s*").expect("separator pattern is valid")
});

/// Stored rules configuration (the agent's opaque `config` JSON)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulesConfig {
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
    #[serde(default)]
    pub fallback_message: Option<String>,
}

/// One rule as written in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSpec {
    #[serde(default)]
    pub id: String,
    /// Plain regex or `/body/flags`
    pub pattern: String,
    /// Static text or a template using `$1` / `${name}`
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub action: Option<RuleAction>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Built-in handlers selectable from configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    CallContacts,
}

/// Captures of a successful match
#[derive(Debug, Clone, Serialize)]
pub struct RuleMatch {
    pub rule_id: String,
    /// Index 0 is the whole match
    pub captures: Vec<Option<String>>,
    pub named: Map<String, Value>,
}

impl RuleMatch {
    fn from_captures(rule_id: &str, regex: &Regex, caps: &Captures<'_>) -> Self {
        let captures = caps
            .iter()
            .map(|m| m.map(|m| m.as_str().to_string()))
            .collect();
        let named = regex
            .capture_names()
            .flatten()
            .filter_map(|name| {
                caps.name(name)
                    .map(|m| (name.to_string(), Value::String(m.as_str().to_string())))
            })
            .collect();

        Self {
            rule_id: rule_id.to_string(),
            captures,
            named,
        }
    }

    /// Capture group `index`, trimmed. Missing or empty groups are `None`.
    pub fn group(&self, index: usize) -> Option<&str> {
        self.captures
            .get(index)
            .and_then(|c| c.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// What a matched rule hands back
#[derive(Debug, Clone, Default)]
pub struct RuleOutput {
    pub response: String,
    /// Structured data merged into the result metadata
    pub data: Map<String, Value>,
}

pub type RuleHandler = Arc<dyn Fn(&RuleMatch, &OrchestrationContext) -> RuleOutput + Send + Sync>;

/// How a rule turns a match into a reply
#[derive(Clone)]
pub enum RuleResponse {
    /// Text with `$1` / `${name}` substitution. `$$` is a literal dollar.
    Template(String),
    Handler(RuleHandler),
}

impl std::fmt::Debug for RuleResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Template(t) => f.debug_tuple("Template").field(t).finish(),
            Self::Handler(_) => f.write_str("Handler(..)"),
        }
    }
}

/// A compiled rule
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: String,
    pub pattern: String,
    regex: Regex,
    pub response: RuleResponse,
    pub priority: i32,
    pub enabled: bool,
}

impl Rule {
    pub fn new(
        id: impl Into<String>,
        pattern: &str,
        response: RuleResponse,
        priority: i32,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            id: id.into(),
            pattern: pattern.to_string(),
            regex: compile_pattern(pattern)?,
            response,
            priority,
            enabled: true,
        })
    }

    /// Shorthand for a template-response rule
    pub fn template(
        id: impl Into<String>,
        pattern: &str,
        response: impl Into<String>,
        priority: i32,
    ) -> Result<Self, regex::Error> {
        Self::new(id, pattern, RuleResponse::Template(response.into()), priority)
    }

    fn from_spec(spec: RuleSpec, index: usize) -> Result<Self, regex::Error> {
        let id = if spec.id.trim().is_empty() {
            format!("rule-{}", index + 1)
        } else {
            spec.id
        };
        let response = match spec.action {
            Some(RuleAction::CallContacts) => RuleResponse::Handler(Arc::new(call_contacts)),
            None => RuleResponse::Template(spec.response.unwrap_or_default()),
        };
        let mut rule = Self::new(id, &spec.pattern, response, spec.priority)?;
        rule.enabled = spec.enabled;
        Ok(rule)
    }

    fn matches(&self, content: &str) -> Option<RuleMatch> {
        self.regex
            .captures(content)
            .map(|caps| RuleMatch::from_captures(&self.id, &self.regex, &caps))
    }

    fn respond(&self, content: &str, m: &RuleMatch, ctx: &OrchestrationContext) -> RuleOutput {
        match &self.response {
            RuleResponse::Template(template) => {
                let mut response = String::new();
                if let Some(caps) = self.regex.captures(content) {
                    caps.expand(template, &mut response);
                }
                RuleOutput {
                    response,
                    data: Map::new(),
                }
            }
            RuleResponse::Handler(handler) => handler(m, ctx),
        }
    }
}

/// Compile a plain regex or a `/body/flags` literal
pub fn compile_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    let Some((body, flags)) = split_literal(pattern) else {
        return Regex::new(pattern);
    };

    let mut builder = RegexBuilder::new(body);
    for flag in flags.chars() {
        match flag {
            'i' => {
                builder.case_insensitive(true);
            }
            'm' => {
                builder.multi_line(true);
            }
            's' => {
                builder.dot_matches_new_line(true);
            }
            'x' => {
                builder.ignore_whitespace(true);
            }
            // global/unicode have no meaning for a single match
            _ => {}
        }
    }
    builder.build()
}

fn split_literal(pattern: &str) -> Option<(&str, &str)> {
    let rest = pattern.strip_prefix('/')?;
    let end = rest.rfind('/')?;
    let flags = &rest[end + 1..];
    if !flags.chars().all(|c| "imsxgu".contains(c)) {
        return None;
    }
    Some((&rest[..end], flags))
}

/// Built-in `call_contacts` handler: group 1 names the contacts, group 2 is the message
pub fn call_contacts(m: &RuleMatch, _ctx: &OrchestrationContext) -> RuleOutput {
    let contacts: Vec<String> = m
        .group(1)
        .map(|names| {
            CONTACT_SEPARATOR
                .split(names)
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let message = m.group(2).unwrap_or_default().to_string();

    let response = if contacts.is_empty() {
        "I couldn't tell who to call.".to_string()
    } else {
        format!("Calling {} to say: {}", contacts.join(", "), message)
    };

    let mut data = Map::new();
    data.insert("action".to_string(), json!("call_contacts"));
    data.insert("contacts".to_string(), json!(contacts));
    data.insert("message".to_string(), json!(message));

    RuleOutput { response, data }
}

/// Agent answering from an ordered list of regex rules
pub struct RulesAgent {
    config: AgentConfig,
    rules: Vec<Rule>,
    fallback_message: String,
}

impl RulesAgent {
    pub fn new(config: AgentConfig, rules: Vec<Rule>) -> Self {
        let mut agent = Self {
            config,
            rules,
            fallback_message: DEFAULT_FALLBACK.to_string(),
        };
        agent.sort_rules();
        agent
    }

    pub fn with_fallback_message(mut self, message: impl Into<String>) -> Self {
        self.fallback_message = message.into();
        self
    }

    /// Build from the stored definition, compiling every pattern
    pub fn from_config(config: AgentConfig) -> Result<Self, AgentError> {
        let parsed: RulesConfig = parse_agent_config(&config)?;

        let mut rules = Vec::with_capacity(parsed.rules.len());
        for (index, spec) in parsed.rules.into_iter().enumerate() {
            let rule_id = spec.id.clone();
            let rule = Rule::from_spec(spec, index).map_err(|source| AgentError::InvalidPattern {
                id: config.id.clone(),
                rule_id,
                source,
            })?;
            rules.push(rule);
        }

        debug!("Rules agent '{}' compiled {} rules", config.id, rules.len());

        let fallback = parsed
            .fallback_message
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_FALLBACK.to_string());
        Ok(Self::new(config, rules).with_fallback_message(fallback))
    }

    // sort_by is stable, so equal priorities keep insertion order
    fn sort_rules(&mut self) {
        self.rules.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn add_rule(&mut self, rule: Rule) {
        info!("Rules agent '{}': added rule '{}'", self.config.id, rule.id);
        self.rules.push(rule);
        self.sort_rules();
    }

    pub fn remove_rule(&mut self, rule_id: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|r| r.id != rule_id);
        self.sort_rules();
        before != self.rules.len()
    }

    pub fn set_rule_enabled(&mut self, rule_id: &str, enabled: bool) -> bool {
        let found = match self.rules.iter_mut().find(|r| r.id == rule_id) {
            Some(rule) => {
                rule.enabled = enabled;
                true
            }
            None => false,
        };
        self.sort_rules();
        found
    }

    /// First enabled rule matching `content`
    pub fn find_match(&self, content: &str) -> Option<(&Rule, RuleMatch)> {
        self.rules
            .iter()
            .filter(|r| r.enabled)
            .find_map(|r| r.matches(content).map(|m| (r, m)))
    }
}

#[async_trait]
impl Agent for RulesAgent {
    fn config(&self) -> &AgentConfig {
        &self.config
    }

    async fn should_process(&self, ctx: &OrchestrationContext) -> bool {
        self.find_match(&ctx.message.content).is_some()
    }

    async fn generate_response(&self, message: &Message, ctx: &OrchestrationContext) -> AgentResult {
        let Some((rule, m)) = self.find_match(&message.content) else {
            debug!("Rules agent '{}': no rule matched", self.config.id);
            return AgentResult::failure(self.fallback_message.clone());
        };

        debug!("Rules agent '{}': rule '{}' matched", self.config.id, rule.id);
        let output = rule.respond(&message.content, &m, ctx);

        let mut metadata = output.data;
        metadata.insert("rule_id".to_string(), json!(m.rule_id));
        metadata.insert("captures".to_string(), json!(m.captures));
        if !m.named.is_empty() {
            metadata.insert("named".to_string(), Value::Object(m.named.clone()));
        }

        AgentResult::success(output.response, 1.0).with_metadata(Value::Object(metadata))
    }
}
