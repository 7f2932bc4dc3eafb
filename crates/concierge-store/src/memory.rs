//! Keyword-based contact memory backed by the SQLite store
//!
//! Facts are pulled out of customer messages with a few sentence patterns
//! ("my name is", "I prefer", ...) and recalled by keyword overlap with the
//! message being answered.

use std::collections::HashSet;
use std::sync::LazyLock;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use concierge_core::gateway::{MemoryRetrieval, MemoryService, MemoryWriteOutcome};
use concierge_core::registry::keywords;
use concierge_core::types::Memory;

use crate::sqlite::SqliteStore;

pub const DEFAULT_MAX_RESULTS: usize = 5;

/// Memories at or above this importance are always recalled
const ALWAYS_RECALL: f64 = 0.8;

/// How many stored memories are scanned per lookup
const SCAN_LIMIT: usize = 200;

struct Extractor {
    memory_type: &'static str,
    importance: f64,
    pattern: Regex,
}

static EXTRACTORS: LazyLock<Vec<Extractor>> = LazyLock::new(|| {
    let rule = |memory_type, importance, pattern: &str| Extractor {
        memory_type,
        importance,
        pattern: Regex::new(pattern).expect("valid memory pattern"),
    };
    vec![
        rule("personal", 0.9, r"(?i)\b(?:my name is|call me)\s+\S+"),
        rule("contact", 0.8, r"(?i)\bmy (?:e-?mail|phone|number|address) is\s+\S+"),
        rule(
            "preference",
            0.7,
            r"(?i)\bi (?:prefer|like|love|hate|don't like|do not like|would rather)\s+\S+",
        ),
        rule(
            "fact",
            0.6,
            r"(?i)\b(?:i work (?:at|for|as)|i live in|i'm from|i am from|my (?:order|account) (?:number |id )?is)\s+\S+",
        ),
    ]
});

static SENTENCE_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.!?]+(?:\s+|$)|\n+").expect("valid sentence pattern"));

/// Sentences of `content` worth remembering, with their type and importance
fn extract(content: &str) -> Vec<(String, &'static str, f64)> {
    SENTENCE_BREAK
        .split(content)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|sentence| {
            EXTRACTORS
                .iter()
                .find(|e| e.pattern.is_match(sentence))
                .map(|e| (sentence.to_string(), e.memory_type, e.importance))
        })
        .collect()
}

/// `MemoryService` over the `memories` table
#[derive(Clone)]
pub struct KeywordMemory {
    store: SqliteStore,
    max_results: usize,
}

impl KeywordMemory {
    pub fn new(store: SqliteStore) -> Self {
        Self {
            store,
            max_results: DEFAULT_MAX_RESULTS,
        }
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results.max(1);
        self
    }
}

#[async_trait]
impl MemoryService for KeywordMemory {
    async fn process_message_memory(
        &self,
        content: &str,
        contact_id: &str,
        message_id: &str,
    ) -> Result<MemoryWriteOutcome> {
        let facts = extract(content);
        if facts.is_empty() {
            return Ok(MemoryWriteOutcome::default());
        }

        let mut known: HashSet<String> = self
            .store
            .memories_for(contact_id, SCAN_LIMIT)
            .await?
            .into_iter()
            .map(|m| m.content.to_lowercase())
            .collect();

        let mut stored = 0;
        for (sentence, memory_type, importance) in facts {
            if !known.insert(sentence.to_lowercase()) {
                continue;
            }
            let memory = Memory {
                id: Uuid::new_v4().to_string(),
                user_id: contact_id.to_string(),
                message_id: Some(message_id.to_string()),
                memory_data: json!({ "keywords": keywords(&sentence) }),
                content: sentence,
                memory_type: memory_type.to_string(),
                importance,
                created_at: Utc::now(),
            };
            self.store.insert_memory(&memory).await?;
            stored += 1;
        }

        if stored > 0 {
            debug!("Remembered {} fact(s) about contact {}", stored, contact_id);
        }
        Ok(MemoryWriteOutcome {
            stored: stored > 0,
            memory_count: stored,
        })
    }

    async fn retrieve_memories(&self, contact_id: &str, query: &str) -> Result<MemoryRetrieval> {
        let query_words: HashSet<String> = keywords(query).into_iter().collect();
        let memories = self.store.memories_for(contact_id, SCAN_LIMIT).await?;

        let mut scored: Vec<(f64, Memory)> = memories
            .into_iter()
            .filter_map(|memory| {
                let overlap = keywords(&memory.content)
                    .iter()
                    .filter(|w| query_words.contains(*w))
                    .count();
                if overlap == 0 && memory.importance < ALWAYS_RECALL {
                    return None;
                }
                Some((overlap as f64 + memory.importance, memory))
            })
            .collect();

        // stable: newer memories win ties
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored.truncate(self.max_results);

        Ok(MemoryRetrieval {
            memories: scored.into_iter().map(|(_, m)| m).collect(),
        })
    }

    fn format_memory_context(&self, retrieval: &MemoryRetrieval) -> String {
        retrieval
            .memories
            .iter()
            .map(|m| format!("- {} ({})", m.content, m.memory_type))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory() -> (KeywordMemory, String) {
        let store = SqliteStore::open_in_memory().unwrap();
        let contact = store.add_contact("Dana", "+15550100").await.unwrap();
        (KeywordMemory::new(store), contact.id)
    }

    #[test]
    fn test_extract_sentences() {
        let facts = extract("Hi there. My name is Dana! I prefer text messages over calls. What time is it?");
        assert_eq!(facts.len(), 2);
        assert_eq!(facts[0].0, "My name is Dana");
        assert_eq!(facts[0].1, "personal");
        assert_eq!(facts[1].1, "preference");
    }

    #[tokio::test]
    async fn test_duplicates_are_skipped() {
        let (memory, contact) = memory().await;
        let first = memory
            .process_message_memory("I prefer email.", &contact, "m1")
            .await
            .unwrap();
        assert!(first.stored);
        assert_eq!(first.memory_count, 1);

        let second = memory
            .process_message_memory("i prefer EMAIL", &contact, "m2")
            .await
            .unwrap();
        assert!(!second.stored);

        let nothing = memory
            .process_message_memory("Where is my order?", &contact, "m3")
            .await
            .unwrap();
        assert_eq!(nothing.memory_count, 0);
    }

    #[tokio::test]
    async fn test_retrieval_by_overlap_and_importance() {
        let (memory, contact) = memory().await;
        memory
            .process_message_memory(
                "My name is Dana. I like the blue kettle. I live in Lisbon.",
                &contact,
                "m1",
            )
            .await
            .unwrap();

        let retrieval = memory.retrieve_memories(&contact, "Is the kettle back in stock?").await.unwrap();
        let contents: Vec<&str> = retrieval.memories.iter().map(|m| m.content.as_str()).collect();
        // overlap first, then the always-recalled name; Lisbon is unrelated
        assert_eq!(contents, vec!["I like the blue kettle", "My name is Dana"]);

        let formatted = memory.format_memory_context(&retrieval);
        assert_eq!(formatted, "- I like the blue kettle (preference)\n- My name is Dana (personal)");
    }

    #[tokio::test]
    async fn test_memories_are_per_contact() {
        let (memory, contact) = memory().await;
        memory
            .process_message_memory("My name is Dana", &contact, "m1")
            .await
            .unwrap();
        let other = memory.retrieve_memories("someone-else", "name").await.unwrap();
        assert!(other.is_empty());
        assert_eq!(memory.format_memory_context(&other), "");
    }

    #[tokio::test]
    async fn test_max_results() {
        let (memory, contact) = memory().await;
        let memory = memory.with_max_results(1);
        memory
            .process_message_memory("My name is Dana. My email is dana@example.com", &contact, "m1")
            .await
            .unwrap();
        let retrieval = memory.retrieve_memories(&contact, "hello").await.unwrap();
        assert_eq!(retrieval.memories.len(), 1);
    }
}
