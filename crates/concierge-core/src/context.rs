//! Per-invocation orchestration context and prompt building

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{AgentConfig, Contact, Memory, Message, MessageDirection};

/// Hard cap on history turns rendered into a prompt
pub const MAX_PROMPT_HISTORY_TURNS: usize = 5;

/// Memory block passed along the chain
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryContext {
    /// Rendered memory block, empty when nothing was retrieved
    pub formatted: String,
    pub memories: Vec<Memory>,
}

impl MemoryContext {
    pub fn is_empty(&self) -> bool {
        self.formatted.trim().is_empty()
    }
}

/// Everything an agent may look at while handling one message. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationContext {
    pub message: Message,
    pub contact: Contact,
    /// Chronological, oldest first
    pub history: Vec<Message>,
    #[serde(default)]
    pub agents: Option<Vec<AgentConfig>>,
    #[serde(default)]
    pub memory: MemoryContext,
}

impl OrchestrationContext {
    pub fn new(message: Message, contact: Contact) -> Self {
        Self {
            message,
            contact,
            history: Vec::new(),
            agents: None,
            memory: MemoryContext::default(),
        }
    }

    /// Attach history. Drops the current message if the store already returned it.
    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        let current = self.message.id.clone();
        self.history = history.into_iter().filter(|m| m.id != current).collect();
        self
    }

    pub fn with_agents(mut self, agents: Vec<AgentConfig>) -> Self {
        self.agents = Some(agents);
        self
    }

    pub fn with_memory(mut self, memory: MemoryContext) -> Self {
        self.memory = memory;
        self
    }

    /// The last `n` history entries (capped at [`MAX_PROMPT_HISTORY_TURNS`]), chronological
    pub fn recent_history(&self, n: usize) -> &[Message] {
        let n = n.min(MAX_PROMPT_HISTORY_TURNS);
        let start = self.history.len().saturating_sub(n);
        &self.history[start..]
    }
}

fn speaker(message: &Message) -> &'static str {
    if message.direction == MessageDirection::Incoming || message.is_from_customer {
        "Customer"
    } else {
        "Assistant"
    }
}

/// Build the single prompt sent to a language-model agent
pub fn build_agent_prompt(ctx: &OrchestrationContext, history_turns: usize) -> String {
    let mut prompt = String::new();

    prompt.push_str("# CONTACT\n\n");
    prompt.push_str(&format!("Name: {}\n", ctx.contact.name));
    if let Some(last) = ctx.contact.last_contact {
        prompt.push_str(&format!("Last contact: {}\n", last.to_rfc3339()));
    }
    prompt.push('\n');

    if !ctx.memory.is_empty() {
        prompt.push_str("# WHAT WE KNOW ABOUT THIS CUSTOMER\n\n");
        prompt.push_str(ctx.memory.formatted.trim());
        prompt.push_str("\n\n");
    }

    let history = ctx.recent_history(history_turns);
    if !history.is_empty() {
        prompt.push_str("# CONVERSATION HISTORY\n\n");
        for turn in history {
            prompt.push_str(&format!("{}: {}\n", speaker(turn), turn.content.trim()));
        }
        prompt.push('\n');
    }

    prompt.push_str("# NEW MESSAGE\n\n");
    prompt.push_str(&format!("Customer: {}\n\n", ctx.message.content.trim()));
    prompt.push_str("Assistant:");

    debug!("Built agent prompt ({} chars, {} history turns)", prompt.len(), history.len());

    prompt
}

/// Remove leading speaker labels the model sometimes echoes back
pub fn strip_speaker_label(text: &str) -> String {
    let mut rest = text.trim();
    loop {
        let label = ["assistant:", "ai:"]
            .into_iter()
            .find(|l| rest.get(..l.len()).is_some_and(|p| p.eq_ignore_ascii_case(l)));
        match label {
            Some(l) => rest = rest[l.len()..].trim_start(),
            None => break,
        }
    }
    rest.trim().to_string()
}
