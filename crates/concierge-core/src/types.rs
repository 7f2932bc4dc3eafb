//! Shared types for concierge-core

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Clamp a confidence or score into `[0, 1]`. NaN becomes 0.
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}

/// Kind of agent, selects the concrete implementation in the factory
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    Llm,
    Rules,
    Classifier,
    Router,
    Qa,
    Custom,
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Llm => "llm",
            Self::Rules => "rules",
            Self::Classifier => "classifier",
            Self::Router => "router",
            Self::Qa => "qa",
            Self::Custom => "custom",
        }
    }

    /// Parse from the stored string representation
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "llm" => Some(Self::Llm),
            "rules" => Some(Self::Rules),
            "classifier" => Some(Self::Classifier),
            "router" => Some(Self::Router),
            "qa" => Some(Self::Qa),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Scheduling priority of an agent. Ordered so that `High > Medium > Low`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentPriority {
    Low,
    #[default]
    Medium,
    High,
}

impl AgentPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Stored agent definition. Immutable once loaded into the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub agent_type: AgentType,
    #[serde(default)]
    pub priority: AgentPriority,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Per-type configuration, parsed by the concrete agent
    #[serde(default)]
    pub config: Value,
}

fn default_true() -> bool {
    true
}

impl AgentConfig {
    pub fn new(id: impl Into<String>, name: impl Into<String>, agent_type: AgentType) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            agent_type,
            priority: AgentPriority::default(),
            enabled: true,
            config: Value::Null,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: AgentPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Which way a message travels
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageDirection {
    Incoming,
    Outgoing,
}

impl MessageDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incoming => "incoming",
            Self::Outgoing => "outgoing",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "incoming" => Some(Self::Incoming),
            "outgoing" => Some(Self::Outgoing),
            _ => None,
        }
    }
}

/// Lifecycle status of a message
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Processing,
    Sent,
    Delivered,
    Failed,
    Read,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Read => "read",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "failed" => Some(Self::Failed),
            "read" => Some(Self::Read),
            _ => None,
        }
    }

    /// Terminal statuses are never reverted to pending except by an explicit reprocess
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Delivered | Self::Failed | Self::Read)
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// A customer or agent message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub contact_id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub direction: MessageDirection,
    pub is_ai_response: bool,
    pub is_from_customer: bool,
    pub is_sent: bool,
    pub is_viewed: bool,
    pub status: MessageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_message_id: Option<String>,
}

/// Fields needed to create a message; the store assigns id and timestamp
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub contact_id: String,
    pub content: String,
    pub direction: MessageDirection,
    pub is_ai_response: bool,
    pub is_from_customer: bool,
    pub is_sent: bool,
    pub status: MessageStatus,
    pub agent_id: Option<String>,
    pub original_message_id: Option<String>,
}

impl NewMessage {
    /// An inbound customer message awaiting processing
    pub fn incoming(contact_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            contact_id: contact_id.into(),
            content: content.into(),
            direction: MessageDirection::Incoming,
            is_ai_response: false,
            is_from_customer: true,
            is_sent: false,
            status: MessageStatus::Pending,
            agent_id: None,
            original_message_id: None,
        }
    }

    /// A generated reply to `original`, not yet delivered
    pub fn response_to(original: &Message, content: impl Into<String>, agent_id: Option<String>) -> Self {
        Self {
            contact_id: original.contact_id.clone(),
            content: content.into(),
            direction: MessageDirection::Outgoing,
            is_ai_response: true,
            is_from_customer: false,
            is_sent: false,
            status: MessageStatus::Pending,
            agent_id,
            original_message_id: Some(original.id.clone()),
        }
    }
}

/// A customer the dashboard talks to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub name: String,
    /// Channel address used for delivery (phone number, chat id, email)
    pub contact_info: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_contact: Option<DateTime<Utc>>,
}

/// A fact remembered about a contact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: String,
    /// Contact id the memory belongs to
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub content: String,
    pub memory_type: String,
    pub importance: f64,
    #[serde(default)]
    pub memory_data: Value,
    pub created_at: DateTime<Utc>,
}

/// Outcome of one agent's generation step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub success: bool,
    pub response: String,
    pub confidence: f64,
    #[serde(default)]
    pub metadata: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_agent_id: Option<String>,
}

impl AgentResult {
    pub fn success(response: impl Into<String>, confidence: f64) -> Self {
        Self {
            success: true,
            response: response.into(),
            confidence: clamp_unit(confidence),
            metadata: Value::Null,
            next_agent_id: None,
        }
    }

    /// A failed generation always carries zero confidence
    pub fn failure(response: impl Into<String>) -> Self {
        Self {
            success: false,
            response: response.into(),
            confidence: 0.0,
            metadata: Value::Null,
            next_agent_id: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_next_agent(mut self, next_agent_id: Option<String>) -> Self {
        self.next_agent_id = next_agent_id;
        self
    }
}

/// Handoff envelope produced by `Agent::process` and returned by the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessResult {
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub confidence: f64,
}

impl ProcessResult {
    pub fn new(success: bool, message: impl Into<String>, confidence: f64) -> Self {
        Self {
            success,
            message: message.into(),
            data: Value::Null,
            next_action: None,
            agent_id: None,
            confidence: if success { clamp_unit(confidence) } else { 0.0 },
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self::new(false, message, 0.0)
    }

    /// The single "nothing handled this message" result
    pub fn unhandled() -> Self {
        Self::failure("No agent processed the message")
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_next_action(mut self, next_action: Option<String>) -> Self {
        self.next_action = next_action;
        self
    }

    /// Customer-facing text carried in the payload, if any
    pub fn response_text(&self) -> Option<&str> {
        self.data
            .get("response")
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
    }
}
