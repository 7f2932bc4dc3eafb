//! Agent registry: lookup, entry-agent selection, keyword ranking

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info};

use crate::agents::Agent;
use crate::types::{AgentConfig, AgentType};

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "not", "but", "are", "was", "you", "your", "our", "this", "that",
    "have", "has", "had", "can", "could", "would", "should", "will", "what", "when", "where", "how",
    "why", "who", "any", "all", "from", "into", "about", "just", "please", "there", "their", "them",
    "then", "than", "been", "being", "its", "it's", "i'm", "does", "did", "get", "got",
];

/// Minimum length for prefix matches ("help" ~ "helps", "turn" ~ "turning")
const MIN_STEM_LEN: usize = 4;

/// Lowercased content words of `text`
pub fn keywords(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    text.split(|c: char| !c.is_alphanumeric() && c != '\'')
        .map(|w| w.trim_matches('\'').to_lowercase())
        .filter(|w| w.chars().count() >= 3 && !STOPWORDS.contains(&w.as_str()))
        .filter(|w| seen.insert(w.clone()))
        .collect()
}

fn related(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    short.len() >= MIN_STEM_LEN && long.starts_with(short)
}

/// Share of the message's keywords that appear in the agent's name or description, in `[0, 1]`
pub fn keyword_score(config: &AgentConfig, content: &str) -> f64 {
    let message_words = keywords(content);
    if message_words.is_empty() {
        return 0.0;
    }

    let mut agent_words = keywords(&config.name);
    agent_words.extend(keywords(&config.description));

    let hits = message_words
        .iter()
        .filter(|w| agent_words.iter().any(|a| related(w, a)))
        .count();

    hits as f64 / message_words.len() as f64
}

/// Registered agents plus their registration order
#[derive(Default)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn Agent>>,
    order: Vec<String>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace. A replaced agent keeps its original position.
    pub fn upsert(&mut self, agent: Arc<dyn Agent>) {
        let id = agent.id().to_string();
        if self.agents.insert(id.clone(), agent).is_none() {
            self.order.push(id.clone());
            info!("Registered agent '{}'", id);
        } else {
            info!("Replaced agent '{}'", id);
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<Arc<dyn Agent>> {
        let removed = self.agents.remove(id);
        if removed.is_some() {
            self.order.retain(|o| o != id);
            info!("Unregistered agent '{}'", id);
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn clear(&mut self) {
        self.agents.clear();
        self.order.clear();
    }

    /// All agents in registration order
    pub fn ordered(&self) -> Vec<Arc<dyn Agent>> {
        self.order
            .iter()
            .filter_map(|id| self.agents.get(id).cloned())
            .collect()
    }

    fn enabled(&self) -> impl Iterator<Item = &Arc<dyn Agent>> {
        self.order
            .iter()
            .filter_map(|id| self.agents.get(id))
            .filter(|a| a.is_enabled())
    }

    /// Pick the agent that starts the chain.
    ///
    /// An enabled classifier wins (highest priority, then registration order).
    /// Otherwise the highest-priority enabled agent, ties broken by keyword
    /// relevance to `content` and then registration order.
    pub fn select_entry(&self, content: &str) -> Option<Arc<dyn Agent>> {
        let mut classifier: Option<&Arc<dyn Agent>> = None;
        for agent in self.enabled().filter(|a| a.agent_type() == AgentType::Classifier) {
            if classifier.is_none_or(|best| agent.priority() > best.priority()) {
                classifier = Some(agent);
            }
        }
        if let Some(agent) = classifier {
            debug!("Entry agent '{}' (classifier)", agent.id());
            return Some(agent.clone());
        }

        let mut best: Option<(&Arc<dyn Agent>, f64)> = None;
        for agent in self.enabled() {
            let score = keyword_score(agent.config(), content);
            let better = match best {
                None => true,
                Some((current, current_score)) => match agent.priority().cmp(&current.priority()) {
                    Ordering::Greater => true,
                    Ordering::Less => false,
                    Ordering::Equal => score > current_score,
                },
            };
            if better {
                best = Some((agent, score));
            }
        }

        best.map(|(agent, score)| {
            debug!("Entry agent '{}' (keyword score {:.2})", agent.id(), score);
            agent.clone()
        })
    }

    /// Enabled agents ranked by keyword relevance to `content`, best first.
    /// Equal scores keep registration order.
    pub fn rank(&self, content: &str) -> Vec<(Arc<dyn Agent>, f64)> {
        let mut ranked: Vec<(Arc<dyn Agent>, f64)> = self
            .enabled()
            .map(|a| (a.clone(), keyword_score(a.config(), content)))
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        ranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::RulesAgent;
    use crate::types::AgentPriority;

    fn rules_agent(id: &str, name: &str, description: &str, priority: AgentPriority) -> Arc<dyn Agent> {
        let config = AgentConfig::new(id, name, AgentType::Rules)
            .with_description(description)
            .with_priority(priority);
        Arc::new(RulesAgent::new(config, vec![]))
    }

    fn classifier_agent(id: &str, priority: AgentPriority) -> Arc<dyn Agent> {
        // a rules agent typed as classifier is enough for selection
        let config = AgentConfig::new(id, id, AgentType::Classifier).with_priority(priority);
        Arc::new(RulesAgent::new(config, vec![]))
    }

    #[test]
    fn test_keywords_drop_stopwords_and_short_words() {
        assert_eq!(
            keywords("I need help with my computer not turning on"),
            vec!["need", "help", "computer", "turning"]
        );
    }

    #[test]
    fn test_rank_prefers_support_agent() {
        let mut registry = AgentRegistry::new();
        registry.upsert(rules_agent(
            "sales",
            "SalesAgent",
            "Answers questions about pricing, plans and discounts",
            AgentPriority::Medium,
        ));
        registry.upsert(rules_agent(
            "support",
            "SupportAgent",
            "Helps customers troubleshoot technical problems such as a computer or device not turning on",
            AgentPriority::Medium,
        ));
        registry.upsert(rules_agent(
            "general",
            "GeneralAgent",
            "General help for anything else",
            AgentPriority::Medium,
        ));

        let ranked = registry.rank("I need help with my computer not turning on");
        assert_eq!(ranked[0].0.id(), "support");
        assert!(ranked[0].1 > ranked[1].1);
        let general = ranked.iter().find(|(a, _)| a.id() == "general").unwrap();
        assert!(general.1 > 0.0);

        let entry = registry.select_entry("I need help with my computer not turning on").unwrap();
        assert_eq!(entry.id(), "support");
    }

    #[test]
    fn test_classifier_preferred_over_priority() {
        let mut registry = AgentRegistry::new();
        registry.upsert(rules_agent("rules", "Rules", "", AgentPriority::High));
        registry.upsert(classifier_agent("triage-a", AgentPriority::Low));
        registry.upsert(classifier_agent("triage-b", AgentPriority::Low));

        assert_eq!(registry.select_entry("hi").unwrap().id(), "triage-a");
    }

    #[test]
    fn test_priority_beats_keywords() {
        let mut registry = AgentRegistry::new();
        registry.upsert(rules_agent("match", "Billing", "billing invoices", AgentPriority::Low));
        registry.upsert(rules_agent("high", "Other", "", AgentPriority::High));
        assert_eq!(registry.select_entry("billing invoices").unwrap().id(), "high");
    }

    #[test]
    fn test_disabled_agents_are_not_selected() {
        let mut registry = AgentRegistry::new();
        let config = AgentConfig::new("off", "Off", AgentType::Classifier).disabled();
        registry.upsert(Arc::new(RulesAgent::new(config, vec![])));
        registry.upsert(rules_agent("on", "On", "", AgentPriority::Low));
        assert_eq!(registry.select_entry("hi").unwrap().id(), "on");
        assert_eq!(registry.rank("hi").len(), 1);
    }

    #[test]
    fn test_upsert_keeps_position() {
        let mut registry = AgentRegistry::new();
        registry.upsert(rules_agent("a", "A", "", AgentPriority::Medium));
        registry.upsert(rules_agent("b", "B", "", AgentPriority::Medium));
        registry.upsert(rules_agent("a", "A2", "", AgentPriority::Medium));

        let ids: Vec<String> = registry.ordered().iter().map(|a| a.id().to_string()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(registry.get("a").unwrap().name(), "A2");
        assert_eq!(registry.select_entry("zzz").unwrap().id(), "a");
    }

    #[test]
    fn test_remove_and_clear() {
        let mut registry = AgentRegistry::new();
        registry.upsert(rules_agent("a", "A", "", AgentPriority::Medium));
        assert!(registry.remove("a").is_some());
        assert!(registry.remove("a").is_none());
        assert!(registry.select_entry("x").is_none());

        registry.upsert(rules_agent("b", "B", "", AgentPriority::Medium));
        registry.clear();
        assert!(registry.is_empty());
    }
}
