use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How a capability's result affects the think-act loop that invoked it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BehaviorClass {
    /// Result is fed back into the same turn; the loop continues.
    Sync,
    /// The session suspends until a correlated reply arrives.
    Async,
    /// Ends the session and archives it.
    Terminal,
}

impl std::fmt::Display for BehaviorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BehaviorClass::Sync => write!(f, "sync"),
            BehaviorClass::Async => write!(f, "async"),
            BehaviorClass::Terminal => write!(f, "terminal"),
        }
    }
}

/// Static description of a capability, registered once per agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityDefinition {
    pub name: String,
    pub description: String,
    /// Parameter name to human-readable description.
    #[serde(default)]
    pub parameter_schema: BTreeMap<String, String>,
    pub behavior: BehaviorClass,
}

impl CapabilityDefinition {
    pub fn new(name: &str, description: &str, behavior: BehaviorClass) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameter_schema: BTreeMap::new(),
            behavior,
        }
    }

    pub fn param(mut self, name: &str, description: &str) -> Self {
        self.parameter_schema
            .insert(name.to_string(), description.to_string());
        self
    }

    /// One catalogue entry as shown to the brain.
    pub fn prompt_line(&self) -> String {
        if self.parameter_schema.is_empty() {
            format!("- {} ({}): {}", self.name, self.behavior, self.description)
        } else {
            let params = self
                .parameter_schema
                .iter()
                .map(|(k, v)| format!("{}: {}", k, v))
                .collect::<Vec<_>>()
                .join("; ");
            format!(
                "- {} ({}): {} [params: {}]",
                self.name, self.behavior, self.description, params
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_line() {
        let def = CapabilityDefinition::new("send_message", "Send mail", BehaviorClass::Async)
            .param("to", "recipient");
        assert_eq!(
            def.prompt_line(),
            "- send_message (async): Send mail [params: to: recipient]"
        );
        let bare = CapabilityDefinition::new("finish_task", "Done", BehaviorClass::Terminal);
        assert_eq!(bare.prompt_line(), "- finish_task (terminal): Done");
    }
}
