//! Turns free model text into structured decisions. All lenient parsing and
//! repair of model output lives here.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

static ACTION_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)^[\s>*`-]*action\s*[:=]\s*`?([A-Za-z_][A-Za-z0-9_\-]*)`?").expect("valid regex")
});

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_]*").expect("valid regex"));

/// Cerebellum verdict on one capability invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Negotiation {
    Ready {
        #[serde(default)]
        params: Map<String, Value>,
    },
    Ask {
        question: String,
    },
    NotToRun {
        #[serde(default)]
        reason: String,
    },
}

/// Capability names declared with `ACTION: <name>` lines, in order.
pub fn extract_actions(text: &str) -> Vec<String> {
    ACTION_LINE
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Whole-identifier mentions of `available` names, in order of appearance,
/// duplicates kept.
pub fn mentions(text: &str, available: &[String]) -> Vec<String> {
    let known: HashSet<&str> = available.iter().map(|s| s.as_str()).collect();
    IDENTIFIER
        .find_iter(text)
        .map(|m| m.as_str())
        .filter(|token| known.contains(token))
        .map(|token| token.to_string())
        .collect()
}

/// Pull the first JSON object out of model text: code fences and prose
/// around it are ignored, and JSON5 syntax (single quotes, trailing commas,
/// bare keys) is accepted.
pub fn extract_json_object(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    let candidate = &text[start..=end];
    let value = serde_json::from_str::<Value>(candidate)
        .ok()
        .or_else(|| json5::from_str::<Value>(candidate).ok())?;
    value.is_object().then_some(value)
}

pub fn parse_negotiation(text: &str) -> Option<Negotiation> {
    let mut value = extract_json_object(text)?;
    if let Some(decision) = value.get("decision").and_then(|d| d.as_str()) {
        let normalized = decision.trim().to_lowercase().replace(['-', ' '], "_");
        let normalized = match normalized.as_str() {
            "notrun" | "not_run" | "skip" | "nottorun" => "not_to_run".to_string(),
            _ => normalized,
        };
        value["decision"] = Value::String(normalized);
    }
    serde_json::from_value(value).ok()
}

/// `{"execute": [names...]}` from the confirmation pass.
pub fn parse_execute_list(text: &str) -> Option<Vec<String>> {
    let value = extract_json_object(text)?;
    let list = value.get("execute")?.as_array()?;
    list.iter()
        .map(|v| v.as_str().map(|s| s.trim().to_string()))
        .collect()
}

/// Does `candidate` use each name no more often than `pool` does?
pub fn is_sub_multiset(candidate: &[String], pool: &[String]) -> bool {
    let mut remaining: Vec<&String> = pool.iter().collect();
    candidate.iter().all(|name| match remaining.iter().position(|p| *p == name) {
        Some(i) => {
            remaining.swap_remove(i);
            true
        }
        None => false,
    })
}
