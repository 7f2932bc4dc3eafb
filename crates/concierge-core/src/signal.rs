//! Numeric signal extraction from model replies
//!
//! Language models answer relevance and classification prompts in free
//! text. Every place that turns such a reply into a number goes through
//! this module so the fallback policy is explicit and tested in one spot.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::types::clamp_unit;

/// Relevance used when a model reply cannot be turned into a score
pub const DEFAULT_RELEVANCE: f64 = 0.5;

static NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(-?\d*\.?\d+)\s*(%?)").expect("number pattern is valid")
});

static LABELLED_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*(category|confidence)\s*[:=]\s*(.+?)\s*$").expect("label pattern is valid")
});

/// Pull the first number out of `text` and clamp it into `[0, 1]`.
///
/// A trailing `%` scales the value by 1/100. Returns `default` when no
/// number is present.
pub fn extract_score(text: &str, default: f64) -> f64 {
    let Some(caps) = NUMBER.captures(text) else {
        debug!("No numeric signal in reply {:?}, using default {}", truncate(text), default);
        return default;
    };

    match caps[1].parse::<f64>() {
        Ok(value) if value.is_finite() => {
            let scaled = if &caps[2] == "%" { value / 100.0 } else { value };
            clamp_unit(scaled)
        }
        _ => {
            debug!("Unparseable numeric signal {:?}, using default {}", &caps[1], default);
            default
        }
    }
}

/// Category and confidence as reported by a classification reply
#[derive(Debug, Clone, PartialEq)]
pub struct RawClassification {
    pub category: String,
    /// `None` when the reply had no usable number
    pub confidence: Option<f64>,
}

/// Parse a classification reply.
///
/// Accepts a JSON object (possibly wrapped in prose or a code fence) with
/// `category` and `confidence` keys, or `category: ...` / `confidence: ...`
/// lines. Returns `None` when no category can be found.
pub fn parse_classification(text: &str) -> Option<RawClassification> {
    if let Some(parsed) = parse_classification_json(text) {
        return Some(parsed);
    }

    let mut category = None;
    let mut confidence = None;
    for caps in LABELLED_LINE.captures_iter(text) {
        let value = caps[2].trim_matches(|c: char| c == '"' || c == '\'' || c == ',').trim();
        if caps[1].eq_ignore_ascii_case("category") {
            category = Some(value.to_string());
        } else {
            confidence = parse_confidence_str(value);
        }
    }

    category
        .filter(|c| !c.is_empty())
        .map(|category| RawClassification { category, confidence })
}

fn parse_classification_json(text: &str) -> Option<RawClassification> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    let value: Value = serde_json::from_str(&text[start..=end]).ok()?;

    let category = value
        .get("category")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())?;

    let confidence = match value.get("confidence") {
        Some(Value::Number(n)) => n.as_f64().filter(|v| v.is_finite()).map(clamp_unit),
        Some(Value::String(s)) => parse_confidence_str(s),
        _ => None,
    };

    Some(RawClassification { category, confidence })
}

fn parse_confidence_str(s: &str) -> Option<f64> {
    let caps = NUMBER.captures(s)?;
    let value: f64 = caps[1].parse().ok()?;
    if !value.is_finite() {
        return None;
    }
    let scaled = if &caps[2] == "%" { value / 100.0 } else { value };
    Some(clamp_unit(scaled))
}

fn truncate(text: &str) -> &str {
    match text.char_indices().nth(80) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
