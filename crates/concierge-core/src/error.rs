//! Error types for agent construction and orchestration

use thiserror::Error;

use crate::types::AgentType;

/// Configuration errors raised while building or registering an agent
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent '{id}': unsupported agent type '{agent_type}'")]
    UnsupportedType { id: String, agent_type: AgentType },

    #[error("agent '{id}': invalid config: {reason}")]
    InvalidConfig { id: String, reason: String },

    #[error("agent '{id}': rule '{rule_id}' has an invalid pattern: {source}")]
    InvalidPattern {
        id: String,
        rule_id: String,
        #[source]
        source: regex::Error,
    },

    #[error("agent '{id}' failed validation")]
    ValidationFailed { id: String },

    #[error("agent '{id}' failed to initialize: {source}")]
    Initialization {
        id: String,
        #[source]
        source: anyhow::Error,
    },
}

impl AgentError {
    pub fn invalid_config(id: &str, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            id: id.to_string(),
            reason: reason.into(),
        }
    }
}

/// Failures that abort a single `process_message` call
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("contact '{0}' not found")]
    ContactNotFound(String),

    #[error("message '{0}' not found")]
    MessageNotFound(String),

    #[error("no enabled agent is registered")]
    NoAgentAvailable,

    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: &'static str, secs: u64 },

    #[error(transparent)]
    Gateway(#[from] anyhow::Error),
}
