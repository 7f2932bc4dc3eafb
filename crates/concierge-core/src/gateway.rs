//! Collaborator interfaces the orchestrator consumes
//!
//! Persistence, memory and outbound delivery live outside the engine. These
//! traits are the only way the orchestrator reaches them; concrete
//! implementations live in `concierge-store` and `concierge-channels`.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{AgentConfig, Contact, Memory, Message, MessageStatus, NewMessage};

/// Read/write access to agents, contacts and messages
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Enabled agent definitions
    async fn get_active_agents(&self) -> Result<Vec<AgentConfig>>;

    async fn get_contact_by_id(&self, id: &str) -> Result<Option<Contact>>;

    async fn get_message_by_id(&self, id: &str) -> Result<Option<Message>>;

    /// Most recent `limit` messages for a contact, in chronological order
    async fn get_message_history(&self, contact_id: &str, limit: usize) -> Result<Vec<Message>>;

    async fn save_message(&self, message: NewMessage) -> Result<Message>;

    /// Set a message's status. Setting the status it already has is a no-op.
    async fn update_message_status(&self, id: &str, status: MessageStatus) -> Result<Option<Message>>;

    /// Atomically move a message from `pending` to `processing`.
    /// Returns false when another worker already claimed it.
    async fn claim_message(&self, id: &str) -> Result<bool>;

    /// Atomically move an incoming message from a terminal status back to
    /// `pending`. Returns false when it is not incoming or not terminal.
    async fn requeue_message(&self, id: &str) -> Result<bool>;

    /// Mark an outgoing message as sent (`status = sent`, `is_sent = true`)
    async fn mark_message_sent(&self, id: &str) -> Result<Option<Message>>;

    async fn update_contact_last_contact(&self, id: &str) -> Result<Contact>;
}

/// Result of extracting memories from a message
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryWriteOutcome {
    pub stored: bool,
    pub memory_count: usize,
}

/// Memories relevant to a query
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryRetrieval {
    pub memories: Vec<Memory>,
}

impl MemoryRetrieval {
    pub fn is_empty(&self) -> bool {
        self.memories.is_empty()
    }
}

/// Extraction and retrieval of facts about a contact
#[async_trait]
pub trait MemoryService: Send + Sync {
    async fn process_message_memory(
        &self,
        content: &str,
        contact_id: &str,
        message_id: &str,
    ) -> Result<MemoryWriteOutcome>;

    async fn retrieve_memories(&self, contact_id: &str, query: &str) -> Result<MemoryRetrieval>;

    /// Render retrieved memories as a prompt block. Empty retrieval → empty string.
    fn format_memory_context(&self, retrieval: &MemoryRetrieval) -> String;
}

/// Result of an outbound send attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeliveryReceipt {
    pub fn delivered() -> Self {
        Self { success: true, error: None }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Outbound send API
#[async_trait]
pub trait DeliveryGateway: Send + Sync {
    /// Human-readable name for logs (e.g. "webhook")
    fn name(&self) -> &str;

    /// Send `text` to a contact's channel address. `attribution` names the agent.
    async fn send(&self, address: &str, text: &str, attribution: Option<&str>) -> Result<DeliveryReceipt>;
}

/// Memory service that never remembers anything
pub struct NoopMemory;

#[async_trait]
impl MemoryService for NoopMemory {
    async fn process_message_memory(&self, _content: &str, _contact_id: &str, _message_id: &str) -> Result<MemoryWriteOutcome> {
        Ok(MemoryWriteOutcome::default())
    }

    async fn retrieve_memories(&self, _contact_id: &str, _query: &str) -> Result<MemoryRetrieval> {
        Ok(MemoryRetrieval::default())
    }

    fn format_memory_context(&self, _retrieval: &MemoryRetrieval) -> String {
        String::new()
    }
}
