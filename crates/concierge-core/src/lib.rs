//! Concierge core: agent contract, agent variants and the message orchestrator

pub mod agents;
pub mod completion;
pub mod context;
pub mod error;
pub mod gateway;
pub mod orchestrator;
pub mod registry;
pub mod signal;
pub mod types;

pub use agents::{Agent, AgentFactory, ClassifierAgent, LlmAgent, RulesAgent};
pub use completion::{CompletionOptions, CompletionService, FailoverCompletion, OpenAiCompletionClient};
pub use context::{MemoryContext, OrchestrationContext};
pub use error::{AgentError, OrchestratorError};
pub use gateway::{
    DeliveryGateway, DeliveryReceipt, MemoryRetrieval, MemoryService, MemoryWriteOutcome, MessageStore,
    NoopMemory,
};
pub use orchestrator::{InitReport, Orchestrator, OrchestratorConfig};
pub use types::*;
