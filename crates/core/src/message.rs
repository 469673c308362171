use serde::{Deserialize, Serialize};

/// The addressed unit of mail exchanged between agents.
///
/// Built with [`Message::new`] and the `with_*` builders, then handed to the
/// broker. There are no setters: a dispatched message is never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender: String,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logical_task_id: Option<String>,
    pub timestamp_ms: i64,
}

/// Correlation tables are partitioned by logical task; mail without one lands here.
pub const DEFAULT_TASK: &str = "default";

impl Message {
    pub fn new(sender: &str, recipient: &str, subject: &str, body: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
            correlation_id: None,
            logical_task_id: None,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }

    pub fn with_correlation(mut self, correlation_id: &str) -> Self {
        self.correlation_id = Some(correlation_id.to_string());
        self
    }

    pub fn in_task(mut self, logical_task_id: Option<&str>) -> Self {
        self.logical_task_id = logical_task_id.map(|s| s.to_string());
        self
    }

    /// Logical task used to partition correlation tables and session directories.
    pub fn task_key(&self) -> &str {
        self.logical_task_id.as_deref().unwrap_or(DEFAULT_TASK)
    }

    /// Rendering used when the message enters an agent's conversation history.
    pub fn as_prompt_text(&self) -> String {
        if self.subject.is_empty() {
            format!("[mail from {}]\n{}", self.sender, self.body)
        } else {
            format!("[mail from {}] {}\n{}", self.sender, self.subject, self.body)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_builders() {
        let msg = Message::new("User", "Coder", "fix", "please fix the bug")
            .with_id("M1")
            .with_correlation("M0")
            .in_task(Some("t1"));
        assert_eq!(msg.id, "M1");
        assert_eq!(msg.correlation_id.as_deref(), Some("M0"));
        assert_eq!(msg.task_key(), "t1");

        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_default_task_key() {
        let msg = Message::new("a", "b", "", "hi");
        assert_eq!(msg.task_key(), DEFAULT_TASK);
        assert_eq!(msg.as_prompt_text(), "[mail from a]\nhi");
    }
}
