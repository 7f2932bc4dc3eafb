//! SQLite persistence for agents, contacts, messages and memories

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde_json::Value as JsonValue;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use concierge_core::gateway::MessageStore;
use concierge_core::types::{
    AgentConfig, AgentPriority, AgentType, Contact, Memory, Message, MessageDirection, MessageStatus,
    NewMessage,
};

const MESSAGE_COLUMNS: &str = "id, contact_id, content, timestamp, direction, is_ai_response, \
     is_from_customer, is_sent, is_viewed, status, agent_id, original_message_id";

/// SQLite database wrapper (thread-safe via Arc<Mutex>)
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

/// Fixed-width RFC 3339 so text ordering matches time ordering
fn timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    s.parse().unwrap_or_else(|_| Utc::now())
}

fn conversion_error(col: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, Box::new(e))
}

fn unknown_value(col: usize, what: &str, value: String) -> rusqlite::Error {
    conversion_error(col, std::io::Error::other(format!("unknown {}: {}", what, value)))
}

impl SqliteStore {
    /// Open (or create) the database file and apply the schema
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).context("Failed to open SQLite database")?;
        info!("Opening message store at {:?}", path.as_ref());
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;

             CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                agent_type TEXT NOT NULL,
                priority TEXT NOT NULL DEFAULT 'medium',
                enabled INTEGER NOT NULL DEFAULT 1,
                config TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
             );

             CREATE TABLE IF NOT EXISTS contacts (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                contact_info TEXT NOT NULL,
                last_contact TEXT,
                created_at TEXT NOT NULL
             );

             CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                contact_id TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                direction TEXT NOT NULL,
                is_ai_response INTEGER NOT NULL DEFAULT 0,
                is_from_customer INTEGER NOT NULL DEFAULT 0,
                is_sent INTEGER NOT NULL DEFAULT 0,
                is_viewed INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                agent_id TEXT,
                original_message_id TEXT
             );

             CREATE TABLE IF NOT EXISTS memories (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                message_id TEXT,
                content TEXT NOT NULL,
                memory_type TEXT NOT NULL,
                importance REAL NOT NULL DEFAULT 0.5,
                memory_data TEXT,
                created_at TEXT NOT NULL
             );

             CREATE INDEX IF NOT EXISTS idx_messages_contact ON messages(contact_id, timestamp);
             CREATE INDEX IF NOT EXISTS idx_messages_status ON messages(status);
             CREATE INDEX IF NOT EXISTS idx_memories_user ON memories(user_id);",
        )
        .context("Failed to apply message store schema")?;

        debug!("Message store schema ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool
    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|poisoned| {
                warn!("Database mutex was poisoned, recovering");
                poisoned.into_inner()
            });
            f(&*conn)
        })
        .await
        .context("spawn_blocking task panicked")?
    }

    // ── agents ──

    /// Insert or replace an agent definition
    pub async fn upsert_agent(&self, agent: &AgentConfig) -> Result<()> {
        let agent = agent.clone();
        let config = serde_json::to_string(&agent.config)?;
        self.run(move |conn| {
            let now = timestamp(&Utc::now());
            conn.execute(
                "INSERT INTO agents (id, name, description, agent_type, priority, enabled, config, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    description = excluded.description,
                    agent_type = excluded.agent_type,
                    priority = excluded.priority,
                    enabled = excluded.enabled,
                    config = excluded.config,
                    updated_at = excluded.updated_at",
                params![
                    &agent.id,
                    &agent.name,
                    &agent.description,
                    agent.agent_type.as_str(),
                    agent.priority.as_str(),
                    agent.enabled,
                    config,
                    now,
                ],
            )?;
            debug!("Upserted agent: {} ({})", agent.name, agent.id);
            Ok(())
        })
        .await
    }

    /// All agent definitions, enabled or not
    pub async fn list_agents(&self) -> Result<Vec<AgentConfig>> {
        self.run(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, description, agent_type, priority, enabled, config
                 FROM agents ORDER BY created_at, id",
            )?;
            let agents = stmt
                .query_map([], Self::row_to_agent)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(agents)
        })
        .await
    }

    fn row_to_agent(row: &Row) -> rusqlite::Result<AgentConfig> {
        let agent_type: String = row.get(3)?;
        let priority: String = row.get(4)?;
        let config: Option<String> = row.get(6)?;
        let config = config
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(|e| conversion_error(6, e))?
            .unwrap_or(JsonValue::Null);

        Ok(AgentConfig {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            agent_type: AgentType::parse(&agent_type).ok_or_else(|| unknown_value(3, "agent type", agent_type))?,
            priority: AgentPriority::parse(&priority).unwrap_or_default(),
            enabled: row.get(5)?,
            config,
        })
    }

    // ── contacts ──

    /// Create a contact with a fresh id
    pub async fn add_contact(&self, name: &str, contact_info: &str) -> Result<Contact> {
        let contact = Contact {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            contact_info: contact_info.to_string(),
            last_contact: None,
        };
        self.upsert_contact(&contact).await?;
        Ok(contact)
    }

    pub async fn upsert_contact(&self, contact: &Contact) -> Result<()> {
        let contact = contact.clone();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO contacts (id, name, contact_info, last_contact, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    contact_info = excluded.contact_info,
                    last_contact = COALESCE(excluded.last_contact, contacts.last_contact)",
                params![
                    &contact.id,
                    &contact.name,
                    &contact.contact_info,
                    contact.last_contact.as_ref().map(timestamp),
                    timestamp(&Utc::now()),
                ],
            )?;
            debug!("Upserted contact: {} ({})", contact.name, contact.id);
            Ok(())
        })
        .await
    }

    pub async fn list_contacts(&self) -> Result<Vec<Contact>> {
        self.run(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, contact_info, last_contact FROM contacts ORDER BY name",
            )?;
            let contacts = stmt
                .query_map([], Self::row_to_contact)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(contacts)
        })
        .await
    }

    fn row_to_contact(row: &Row) -> rusqlite::Result<Contact> {
        Ok(Contact {
            id: row.get(0)?,
            name: row.get(1)?,
            contact_info: row.get(2)?,
            last_contact: row.get::<_, Option<String>>(3)?.map(|s| parse_timestamp(&s)),
        })
    }

    fn fetch_contact(conn: &Connection, id: &str) -> Result<Option<Contact>> {
        let contact = conn
            .query_row(
                "SELECT id, name, contact_info, last_contact FROM contacts WHERE id = ?1",
                params![id],
                Self::row_to_contact,
            )
            .optional()?;
        Ok(contact)
    }

    // ── messages ──

    fn row_to_message(row: &Row) -> rusqlite::Result<Message> {
        let direction: String = row.get(4)?;
        let status: String = row.get(9)?;
        Ok(Message {
            id: row.get(0)?,
            contact_id: row.get(1)?,
            content: row.get(2)?,
            timestamp: parse_timestamp(&row.get::<_, String>(3)?),
            direction: MessageDirection::parse(&direction)
                .ok_or_else(|| unknown_value(4, "direction", direction))?,
            is_ai_response: row.get(5)?,
            is_from_customer: row.get(6)?,
            is_sent: row.get(7)?,
            is_viewed: row.get(8)?,
            status: MessageStatus::parse(&status).ok_or_else(|| unknown_value(9, "status", status))?,
            agent_id: row.get(10)?,
            original_message_id: row.get(11)?,
        })
    }

    fn fetch_message(conn: &Connection, id: &str) -> Result<Option<Message>> {
        let message = conn
            .query_row(
                &format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS),
                params![id],
                Self::row_to_message,
            )
            .optional()?;
        Ok(message)
    }

    /// Messages across all contacts, newest first, optionally filtered by status
    pub async fn list_messages(&self, status: Option<MessageStatus>, limit: usize) -> Result<Vec<Message>> {
        self.run(move |conn| {
            let messages = match status {
                Some(status) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {} FROM messages WHERE status = ?1 ORDER BY timestamp DESC, rowid DESC LIMIT ?2",
                        MESSAGE_COLUMNS
                    ))?;
                    stmt.query_map(params![status.as_str(), limit as i64], Self::row_to_message)?
                        .collect::<rusqlite::Result<Vec<_>>>()?
                }
                None => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {} FROM messages ORDER BY timestamp DESC, rowid DESC LIMIT ?1",
                        MESSAGE_COLUMNS
                    ))?;
                    stmt.query_map(params![limit as i64], Self::row_to_message)?
                        .collect::<rusqlite::Result<Vec<_>>>()?
                }
            };
            Ok(messages)
        })
        .await
    }

    /// Oldest pending inbound message ids, for the dispatcher
    pub async fn pending_message_ids(&self, limit: usize) -> Result<Vec<String>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM messages
                 WHERE status = 'pending' AND direction = 'incoming'
                 ORDER BY timestamp ASC, rowid ASC LIMIT ?1",
            )?;
            let ids = stmt
                .query_map(params![limit as i64], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(ids)
        })
        .await
    }

    // ── memories ──

    pub async fn insert_memory(&self, memory: &Memory) -> Result<()> {
        let memory = memory.clone();
        let data = serde_json::to_string(&memory.memory_data)?;
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO memories (id, user_id, message_id, content, memory_type, importance, memory_data, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    &memory.id,
                    &memory.user_id,
                    &memory.message_id,
                    &memory.content,
                    &memory.memory_type,
                    memory.importance,
                    data,
                    timestamp(&memory.created_at),
                ],
            )?;
            debug!("Stored {} memory for {}", memory.memory_type, memory.user_id);
            Ok(())
        })
        .await
    }

    /// Memories about a contact, newest first
    pub async fn memories_for(&self, contact_id: &str, limit: usize) -> Result<Vec<Memory>> {
        let contact_id = contact_id.to_owned();
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, message_id, content, memory_type, importance, memory_data, created_at
                 FROM memories WHERE user_id = ?1
                 ORDER BY created_at DESC, rowid DESC LIMIT ?2",
            )?;
            let memories = stmt
                .query_map(params![&contact_id, limit as i64], Self::row_to_memory)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(memories)
        })
        .await
    }

    fn row_to_memory(row: &Row) -> rusqlite::Result<Memory> {
        let data: Option<String> = row.get(6)?;
        let memory_data = data
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(|e| conversion_error(6, e))?
            .unwrap_or(JsonValue::Null);

        Ok(Memory {
            id: row.get(0)?,
            user_id: row.get(1)?,
            message_id: row.get(2)?,
            content: row.get(3)?,
            memory_type: row.get(4)?,
            importance: row.get(5)?,
            memory_data,
            created_at: parse_timestamp(&row.get::<_, String>(7)?),
        })
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn get_active_agents(&self) -> Result<Vec<AgentConfig>> {
        self.run(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, description, agent_type, priority, enabled, config
                 FROM agents WHERE enabled = 1 ORDER BY created_at, id",
            )?;
            let agents = stmt
                .query_map([], Self::row_to_agent)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(agents)
        })
        .await
    }

    async fn get_contact_by_id(&self, id: &str) -> Result<Option<Contact>> {
        let id = id.to_owned();
        self.run(move |conn| Self::fetch_contact(conn, &id)).await
    }

    async fn get_message_by_id(&self, id: &str) -> Result<Option<Message>> {
        let id = id.to_owned();
        self.run(move |conn| Self::fetch_message(conn, &id)).await
    }

    async fn get_message_history(&self, contact_id: &str, limit: usize) -> Result<Vec<Message>> {
        let contact_id = contact_id.to_owned();
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM messages WHERE contact_id = ?1
                 ORDER BY timestamp DESC, rowid DESC LIMIT ?2",
                MESSAGE_COLUMNS
            ))?;
            let mut messages = stmt
                .query_map(params![&contact_id, limit as i64], Self::row_to_message)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            messages.reverse();
            Ok(messages)
        })
        .await
    }

    async fn save_message(&self, message: NewMessage) -> Result<Message> {
        self.run(move |conn| {
            let id = Uuid::new_v4().to_string();
            conn.execute(
                &format!(
                    "INSERT INTO messages ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?10, ?11)",
                    MESSAGE_COLUMNS
                ),
                params![
                    &id,
                    &message.contact_id,
                    &message.content,
                    timestamp(&Utc::now()),
                    message.direction.as_str(),
                    message.is_ai_response,
                    message.is_from_customer,
                    message.is_sent,
                    message.status.as_str(),
                    &message.agent_id,
                    &message.original_message_id,
                ],
            )?;
            debug!("Saved {} message {} for {}", message.direction.as_str(), id, message.contact_id);
            Self::fetch_message(conn, &id)?.ok_or_else(|| anyhow!("message {} vanished after insert", id))
        })
        .await
    }

    async fn update_message_status(&self, id: &str, status: MessageStatus) -> Result<Option<Message>> {
        let id = id.to_owned();
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE messages SET status = ?2 WHERE id = ?1 AND status != ?2",
                params![&id, status.as_str()],
            )?;
            if changed > 0 {
                debug!("Message {} → {}", id, status);
            }
            Self::fetch_message(conn, &id)
        })
        .await
    }

    async fn claim_message(&self, id: &str) -> Result<bool> {
        let id = id.to_owned();
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE messages SET status = 'processing' WHERE id = ?1 AND status = 'pending'",
                params![&id],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn requeue_message(&self, id: &str) -> Result<bool> {
        let id = id.to_owned();
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE messages SET status = 'pending'
                 WHERE id = ?1 AND direction = 'incoming'
                   AND status IN ('sent', 'delivered', 'failed', 'read')",
                params![&id],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn mark_message_sent(&self, id: &str) -> Result<Option<Message>> {
        let id = id.to_owned();
        self.run(move |conn| {
            conn.execute(
                "UPDATE messages SET status = 'sent', is_sent = 1 WHERE id = ?1",
                params![&id],
            )?;
            Self::fetch_message(conn, &id)
        })
        .await
    }

    async fn update_contact_last_contact(&self, id: &str) -> Result<Contact> {
        let id = id.to_owned();
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE contacts SET last_contact = ?2 WHERE id = ?1",
                params![&id, timestamp(&Utc::now())],
            )?;
            if changed == 0 {
                return Err(anyhow!("contact {} not found", id));
            }
            Self::fetch_contact(conn, &id)?.ok_or_else(|| anyhow!("contact {} not found", id))
        })
        .await
    }
}
