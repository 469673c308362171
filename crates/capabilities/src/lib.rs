pub mod delegate;
pub mod finish;
pub mod mail;
pub mod registry;
pub mod remember;

use async_trait::async_trait;
use courier_core::types::ChatMessage;
use courier_core::{CapabilityDefinition, Error, Result};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub use registry::CapabilityRegistry;

/// Mail a capability asked to send. The runtime stamps, correlates and
/// dispatches drafts after the invocation returns.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingDraft {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// What a delegated sub-task is asked to do.
#[derive(Debug, Clone, Default)]
pub struct MicroRequest {
    pub persona: Option<String>,
    pub task: String,
    /// Capability names the sub-task may use; empty means the caller's full set.
    pub capabilities: Vec<String>,
    /// Transcript of an earlier unfinished run to continue from.
    pub resume_history: Vec<ChatMessage>,
    /// Step budget for this run; `None` keeps the executor's default.
    pub max_steps: Option<u32>,
    /// Wall-clock budget for this run; `None` keeps the executor's default.
    pub max_time: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct MicroReport {
    pub result: String,
    pub finished: bool,
    pub history: Vec<ChatMessage>,
}

/// Runs bounded sub-tasks for capabilities, without the capabilities crate
/// depending on the agent crate.
#[async_trait]
pub trait MicroAgentOps: Send + Sync {
    async fn run(&self, ctx: &CapabilityContext, request: MicroRequest) -> Result<MicroReport>;
}

/// Per-invocation view of the session a capability runs in.
#[derive(Clone)]
pub struct CapabilityContext {
    pub agent: String,
    pub session_id: String,
    pub logical_task_id: Option<String>,
    pub outbox: Arc<Mutex<Vec<OutgoingDraft>>>,
    /// The session's context object; changes are persisted by the runtime.
    pub context: Arc<Mutex<Map<String, Value>>>,
    pub micro: Option<Arc<dyn MicroAgentOps>>,
}

impl CapabilityContext {
    pub fn new(agent: &str, session_id: &str, logical_task_id: Option<&str>) -> Self {
        Self {
            agent: agent.to_string(),
            session_id: session_id.to_string(),
            logical_task_id: logical_task_id.map(|s| s.to_string()),
            outbox: Arc::new(Mutex::new(Vec::new())),
            context: Arc::new(Mutex::new(Map::new())),
            micro: None,
        }
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = Arc::new(Mutex::new(context));
        self
    }

    pub fn with_micro(mut self, micro: Arc<dyn MicroAgentOps>) -> Self {
        self.micro = Some(micro);
        self
    }

    pub async fn take_outbox(&self) -> Vec<OutgoingDraft> {
        std::mem::take(&mut *self.outbox.lock().await)
    }

    pub async fn context_snapshot(&self) -> Map<String, Value> {
        self.context.lock().await.clone()
    }
}

#[async_trait]
pub trait Capability: Send + Sync {
    fn definition(&self) -> CapabilityDefinition;

    /// Reject malformed parameters before [`Capability::invoke`] runs.
    fn validate(&self, params: &Value) -> Result<()> {
        if params.is_object() || params.is_null() {
            Ok(())
        } else {
            Err(Error::Validation(format!(
                "{}: parameters must be an object",
                self.definition().name
            )))
        }
    }

    async fn invoke(&self, ctx: CapabilityContext, params: Value) -> Result<Value>;
}

/// Fetch a required non-empty string parameter.
pub fn require_str<'a>(params: &'a Value, key: &str) -> Result<&'a str> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| Error::Validation(format!("Missing required parameter: {}", key)))
}

pub fn optional_str<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str()).filter(|s| !s.is_empty())
}

/// A positive integer parameter, given as a number or a numeric string.
pub fn optional_count(params: &Value, key: &str) -> Result<Option<u64>> {
    let parsed = match params.get(key) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) if s.trim().is_empty() => return Ok(None),
        Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
        Some(_) => None,
    };
    match parsed {
        Some(n) if n > 0 => Ok(Some(n)),
        _ => Err(Error::Validation(format!(
            "{} must be a positive whole number",
            key
        ))),
    }
}
