//! Message orchestration
//!
//! The orchestrator owns the agent registry and drives one inbound message
//! through claim → context assembly → agent chain → persistence → delivery.
//! Collaborators are injected; nothing here is global.

use std::future::Future;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::agents::{Agent, AgentFactory};
use crate::context::{MemoryContext, OrchestrationContext};
use crate::error::{AgentError, OrchestratorError};
use crate::gateway::{DeliveryGateway, MemoryService, MessageStore};
use crate::registry::AgentRegistry;
use crate::types::{AgentConfig, Message, MessageDirection, MessageStatus, NewMessage, ProcessResult};

const ALREADY_PROCESSED: &str = "Message already processed";
const IN_FLIGHT: &str = "Message is already being processed";
const NOT_INCOMING: &str = "Only incoming messages can be processed";

/// Orchestrator tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Hard cap on agents attempted per message
    pub max_agent_iterations: usize,
    /// Agent tried when the current one declines the message
    pub fallback_agent_id: Option<String>,
    pub save_responses: bool,
    pub update_contact_timestamp: bool,
    /// Messages of history loaded into the context
    pub history_limit: usize,
    /// Timeout for each store, memory or delivery call
    pub call_timeout_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_agent_iterations: 5,
            fallback_agent_id: None,
            save_responses: true,
            update_contact_timestamp: true,
            history_limit: 10,
            call_timeout_secs: 30,
        }
    }
}

/// Outcome of loading agents from the store
#[derive(Debug, Default)]
pub struct InitReport {
    pub registered: Vec<String>,
    /// Agent id and the reason it was skipped
    pub failed: Vec<(String, String)>,
}

enum Claim {
    Acquired,
    Rejected(&'static str),
}

/// Why `stored` cannot be picked up at all right now
fn blocked(stored: &Message) -> Option<&'static str> {
    if stored.direction != MessageDirection::Incoming {
        Some(NOT_INCOMING)
    } else if stored.status == MessageStatus::Processing {
        Some(IN_FLIGHT)
    } else {
        None
    }
}

pub struct Orchestrator {
    registry: RwLock<AgentRegistry>,
    factory: AgentFactory,
    store: Arc<dyn MessageStore>,
    memory: Arc<dyn MemoryService>,
    delivery: Arc<dyn DeliveryGateway>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        factory: AgentFactory,
        store: Arc<dyn MessageStore>,
        memory: Arc<dyn MemoryService>,
        delivery: Arc<dyn DeliveryGateway>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry: RwLock::new(AgentRegistry::new()),
            factory,
            store,
            memory,
            delivery,
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    fn read_registry(&self) -> RwLockReadGuard<'_, AgentRegistry> {
        self.registry.read().unwrap_or_else(|poisoned| {
            warn!("Agent registry lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write_registry(&self) -> RwLockWriteGuard<'_, AgentRegistry> {
        self.registry.write().unwrap_or_else(|poisoned| {
            warn!("Agent registry lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Run a collaborator call under the configured timeout
    async fn guarded<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = anyhow::Result<T>>,
    ) -> Result<T, OrchestratorError> {
        let secs = self.config.call_timeout_secs;
        match tokio::time::timeout(Duration::from_secs(secs), call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(OrchestratorError::Timeout { operation, secs }),
        }
    }

    // ── registry ──

    /// Load, build and register every active agent from the store
    pub async fn initialize(&self) -> Result<InitReport, OrchestratorError> {
        let configs = self
            .guarded("get_active_agents", self.store.get_active_agents())
            .await?;
        info!("Initializing orchestrator with {} agent definitions", configs.len());

        let mut report = InitReport::default();
        for config in configs {
            match self.build(&config).await {
                Ok(agent) => {
                    self.write_registry().upsert(agent);
                    report.registered.push(config.id);
                }
                Err(e) => {
                    error!("Skipping agent '{}': {}", config.id, e);
                    report.failed.push((config.id, e.to_string()));
                }
            }
        }

        info!(
            "Orchestrator ready: {} agents registered, {} failed",
            report.registered.len(),
            report.failed.len()
        );
        Ok(report)
    }

    async fn build(&self, config: &AgentConfig) -> Result<Arc<dyn Agent>, AgentError> {
        let agent = self.factory.build(config)?;
        self.prepare(agent).await
    }

    async fn prepare(&self, agent: Arc<dyn Agent>) -> Result<Arc<dyn Agent>, AgentError> {
        agent
            .initialize()
            .await
            .map_err(|source| AgentError::Initialization {
                id: agent.id().to_string(),
                source,
            })?;
        if !agent.validate() {
            return Err(AgentError::ValidationFailed {
                id: agent.id().to_string(),
            });
        }
        Ok(agent)
    }

    /// Build and register an agent from its definition, replacing any agent with the same id
    pub async fn register_agent(&self, config: &AgentConfig) -> Result<(), AgentError> {
        let agent = self.build(config).await?;
        self.write_registry().upsert(agent);
        Ok(())
    }

    /// Register an already constructed agent
    pub async fn register(&self, agent: Arc<dyn Agent>) -> Result<(), AgentError> {
        let agent = self.prepare(agent).await?;
        self.write_registry().upsert(agent);
        Ok(())
    }

    pub fn unregister_agent(&self, id: &str) -> bool {
        self.write_registry().remove(id).is_some()
    }

    pub fn agent(&self, id: &str) -> Option<Arc<dyn Agent>> {
        self.read_registry().get(id)
    }

    /// Snapshot of registered agents in registration order
    pub fn agents(&self) -> Vec<Arc<dyn Agent>> {
        self.read_registry().ordered()
    }

    pub fn reset(&self) {
        self.write_registry().clear();
        info!("Agent registry cleared");
    }

    /// Enabled agents ranked by keyword relevance to `content`
    pub fn rank_agents(&self, content: &str) -> Vec<(Arc<dyn Agent>, f64)> {
        self.read_registry().rank(content)
    }

    pub fn select_entry_agent(&self, content: &str) -> Option<Arc<dyn Agent>> {
        self.read_registry().select_entry(content)
    }

    // ── chain ──

    /// Walk the agent chain starting at `entry_agent_id`.
    ///
    /// Returns the last result produced, or [`ProcessResult::unhandled`] when
    /// no agent produced one.
    pub async fn run_chain(&self, entry_agent_id: &str, ctx: &OrchestrationContext) -> ProcessResult {
        let max = self.config.max_agent_iterations;
        let mut current = Some(entry_agent_id.to_string());
        let mut last = None;
        let mut iterations = 0;

        while let Some(agent_id) = current.take() {
            if iterations >= max {
                warn!(
                    "Agent chain for message {} stopped after {} iterations (next: '{}')",
                    ctx.message.id, max, agent_id
                );
                break;
            }
            iterations += 1;

            let Some(agent) = self.agent(&agent_id).filter(|a| a.is_enabled()) else {
                warn!("Agent '{}' is missing or disabled, ending chain", agent_id);
                break;
            };

            if !agent.should_process(ctx).await {
                match &self.config.fallback_agent_id {
                    Some(fallback) if *fallback != agent_id => {
                        debug!("Agent '{}' declined, trying fallback '{}'", agent_id, fallback);
                        current = Some(fallback.clone());
                    }
                    _ => debug!("Agent '{}' declined, ending chain", agent_id),
                }
                continue;
            }

            debug!("Agent '{}' processing message {}", agent_id, ctx.message.id);
            let result = agent.process(ctx).await;
            current = result.next_action.clone();
            last = Some(result);
        }

        last.unwrap_or_else(ProcessResult::unhandled)
    }

    // ── message lifecycle ──

    /// Process one inbound message end to end. Never returns an error: failures
    /// come back as `success: false` and leave the message `failed`.
    pub async fn process_message(&self, message: &Message) -> ProcessResult {
        info!("Processing message {} from contact {}", message.id, message.contact_id);

        match self.claim(message).await {
            Ok(Claim::Acquired) => {}
            Ok(Claim::Rejected(reason)) => {
                info!("Message {} skipped: {}", message.id, reason);
                return ProcessResult::failure(reason);
            }
            Err(e) => {
                error!("Could not claim message {}: {}", message.id, e);
                return ProcessResult::failure(format!("Could not claim message: {}", e));
            }
        }

        match self.handle_claimed(message).await {
            Ok(result) => {
                self.set_status(&message.id, MessageStatus::Read).await;
                info!(
                    "Message {} handled by {} (success={}, confidence={:.2})",
                    message.id,
                    result.agent_id.as_deref().unwrap_or("no agent"),
                    result.success,
                    result.confidence
                );
                result
            }
            Err(e) => {
                error!("Processing message {} failed: {}", message.id, e);
                self.set_status(&message.id, MessageStatus::Failed).await;
                ProcessResult::failure(format!("Processing failed: {}", e))
            }
        }
    }

    /// Load a message by id and process it
    pub async fn process_message_id(&self, id: &str) -> ProcessResult {
        match self.guarded("get_message_by_id", self.store.get_message_by_id(id)).await {
            Ok(Some(message)) => self.process_message(&message).await,
            Ok(None) => ProcessResult::failure(OrchestratorError::MessageNotFound(id.to_string()).to_string()),
            Err(e) => ProcessResult::failure(e.to_string()),
        }
    }

    /// Put a finished incoming message back to `pending` and process it again.
    /// A message that is in flight is left alone.
    pub async fn reprocess_message(&self, id: &str) -> ProcessResult {
        let stored = match self.guarded("get_message_by_id", self.store.get_message_by_id(id)).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                return ProcessResult::failure(OrchestratorError::MessageNotFound(id.to_string()).to_string());
            }
            Err(e) => return ProcessResult::failure(e.to_string()),
        };
        if let Some(reason) = blocked(&stored) {
            info!("Message {} not reprocessed: {}", id, reason);
            return ProcessResult::failure(reason);
        }

        if stored.status.is_terminal() {
            match self.guarded("requeue_message", self.store.requeue_message(id)).await {
                Ok(true) => {}
                // lost a race with another worker
                Ok(false) => return ProcessResult::failure(IN_FLIGHT),
                Err(e) => {
                    error!("Could not requeue message {}: {}", id, e);
                    return ProcessResult::failure(e.to_string());
                }
            }
        }

        info!("Reprocessing message {}", id);
        self.process_message(&stored).await
    }

    async fn claim(&self, message: &Message) -> Result<Claim, OrchestratorError> {
        let stored = self
            .guarded("get_message_by_id", self.store.get_message_by_id(&message.id))
            .await?
            .ok_or_else(|| OrchestratorError::MessageNotFound(message.id.clone()))?;

        if let Some(reason) = blocked(&stored) {
            return Ok(Claim::Rejected(reason));
        }
        if stored.status.is_terminal() {
            return Ok(Claim::Rejected(ALREADY_PROCESSED));
        }

        let claimed = self
            .guarded("claim_message", self.store.claim_message(&message.id))
            .await?;
        if claimed {
            Ok(Claim::Acquired)
        } else {
            Ok(Claim::Rejected(IN_FLIGHT))
        }
    }

    async fn set_status(&self, id: &str, status: MessageStatus) {
        let update = self
            .guarded("update_message_status", self.store.update_message_status(id, status))
            .await;
        if let Err(e) = update {
            error!("Could not mark message {} as {}: {}", id, status, e);
        }
    }

    async fn handle_claimed(&self, message: &Message) -> Result<ProcessResult, OrchestratorError> {
        let contact = self
            .guarded("get_contact_by_id", self.store.get_contact_by_id(&message.contact_id))
            .await?
            .ok_or_else(|| OrchestratorError::ContactNotFound(message.contact_id.clone()))?;

        let history = self
            .guarded(
                "get_message_history",
                self.store.get_message_history(&contact.id, self.config.history_limit),
            )
            .await?;

        let memory = self.load_memory(message).await;

        let mut current = message.clone();
        current.status = MessageStatus::Processing;
        let agents: Vec<AgentConfig> = self.agents().iter().map(|a| a.config().clone()).collect();
        let ctx = OrchestrationContext::new(current, contact)
            .with_history(history)
            .with_agents(agents)
            .with_memory(memory);

        let entry = self
            .select_entry_agent(&message.content)
            .ok_or(OrchestratorError::NoAgentAvailable)?;
        info!("Message {} entering chain at agent '{}'", message.id, entry.id());

        let mut result = self.run_chain(entry.id(), &ctx).await;

        if result.success && self.config.save_responses {
            if let Some(text) = result.response_text().map(str::to_string) {
                let outgoing = self
                    .persist_and_deliver(&ctx, result.agent_id.as_deref(), &text)
                    .await?;
                if let Some(data) = result.data.as_object_mut() {
                    data.insert("outgoing_message_id".to_string(), Value::String(outgoing.id));
                    data.insert(
                        "delivery_status".to_string(),
                        Value::String(outgoing.status.to_string()),
                    );
                }
            }
        }

        Ok(result)
    }

    /// Extract, retrieve and format memories. Failures leave the context without memory.
    async fn load_memory(&self, message: &Message) -> MemoryContext {
        let write = self
            .guarded(
                "process_message_memory",
                self.memory
                    .process_message_memory(&message.content, &message.contact_id, &message.id),
            )
            .await;
        match write {
            Ok(outcome) if outcome.stored => {
                debug!("Stored {} memories from message {}", outcome.memory_count, message.id)
            }
            Ok(_) => {}
            Err(e) => warn!("Memory extraction failed for message {}: {}", message.id, e),
        }

        let retrieval = self
            .guarded(
                "retrieve_memories",
                self.memory.retrieve_memories(&message.contact_id, &message.content),
            )
            .await;
        match retrieval {
            Ok(retrieval) => MemoryContext {
                formatted: self.memory.format_memory_context(&retrieval),
                memories: retrieval.memories,
            },
            Err(e) => {
                warn!("Memory retrieval failed for message {}: {}", message.id, e);
                MemoryContext::default()
            }
        }
    }

    /// Save the reply as an outgoing message and hand it to delivery.
    ///
    /// A failed send marks the outgoing message `failed`; it does not fail the
    /// inbound message. Once `send` has run, nothing here returns an error: a
    /// status write that fails is logged and the returned message carries the
    /// delivery outcome.
    pub async fn persist_and_deliver(
        &self,
        ctx: &OrchestrationContext,
        agent_id: Option<&str>,
        text: &str,
    ) -> Result<Message, OrchestratorError> {
        let outgoing = self
            .guarded(
                "save_message",
                self.store.save_message(NewMessage::response_to(
                    &ctx.message,
                    text,
                    agent_id.map(str::to_string),
                )),
            )
            .await?;
        debug!("Saved response {} for message {}", outgoing.id, ctx.message.id);

        if self.config.update_contact_timestamp {
            let bump = self
                .guarded(
                    "update_contact_last_contact",
                    self.store.update_contact_last_contact(&ctx.contact.id),
                )
                .await;
            if let Err(e) = bump {
                warn!("Could not update last contact for {}: {}", ctx.contact.id, e);
            }
        }

        let send = self
            .guarded(
                "send",
                self.delivery.send(&ctx.contact.contact_info, text, agent_id),
            )
            .await;

        let status = match send {
            Ok(receipt) if receipt.success => {
                info!("Response {} sent via {}", outgoing.id, self.delivery.name());
                MessageStatus::Sent
            }
            Ok(receipt) => {
                warn!(
                    "Delivery of response {} failed: {}",
                    outgoing.id,
                    receipt.error.as_deref().unwrap_or("unknown error")
                );
                MessageStatus::Failed
            }
            Err(e) => {
                warn!("Delivery of response {} failed: {}", outgoing.id, e);
                MessageStatus::Failed
            }
        };

        let recorded = if status == MessageStatus::Sent {
            self.guarded("mark_message_sent", self.store.mark_message_sent(&outgoing.id))
                .await
        } else {
            self.guarded(
                "update_message_status",
                self.store.update_message_status(&outgoing.id, status),
            )
            .await
        };

        match recorded {
            Ok(Some(message)) => Ok(message),
            Ok(None) => {
                warn!("Response {} disappeared before it could be marked {}", outgoing.id, status);
                Ok(Self::with_outcome(outgoing, status))
            }
            Err(e) => {
                error!("Response {} is {} but the store was not updated: {}", outgoing.id, status, e);
                Ok(Self::with_outcome(outgoing, status))
            }
        }
    }

    fn with_outcome(mut outgoing: Message, status: MessageStatus) -> Message {
        outgoing.is_sent = status == MessageStatus::Sent;
        outgoing.status = status;
        outgoing
    }
}
