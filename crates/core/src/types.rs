use serde::{Deserialize, Serialize};

/// One turn of a conversation sent to a model backend, and the unit stored in
/// session history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    /// Capability name for feedback turns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    fn with_role(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: content.to_string(),
            reasoning_content: None,
            name: None,
        }
    }

    pub fn system(content: &str) -> Self {
        Self::with_role("system", content)
    }

    pub fn user(content: &str) -> Self {
        Self::with_role("user", content)
    }

    pub fn assistant(content: &str) -> Self {
        Self::with_role("assistant", content)
    }

    /// Structured `{intention, result}` turn fed back after a capability ran.
    pub fn feedback(capability: &str, intention: &str, result: &str) -> Self {
        let body = serde_json::json!({
            "capability": capability,
            "intention": intention,
            "result": result,
        });
        let mut msg = Self::with_role("user", &body.to_string());
        msg.name = Some(capability.to_string());
        msg
    }

    pub fn is_system(&self) -> bool {
        self.role == "system"
    }
}

/// What a brain or cerebellum backend returns for one conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrainReply {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl BrainReply {
    pub fn text(content: &str) -> Self {
        Self {
            content: content.to_string(),
            reasoning: None,
        }
    }
}
