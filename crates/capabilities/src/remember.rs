use async_trait::async_trait;
use courier_core::{BehaviorClass, CapabilityDefinition, Result};
use serde_json::{json, Value};
use tracing::debug;

use crate::{require_str, Capability, CapabilityContext};

pub const REMEMBER: &str = "remember";

/// Store a note in the session context, or read one back.
pub struct RememberCapability;

#[async_trait]
impl Capability for RememberCapability {
    fn definition(&self) -> CapabilityDefinition {
        CapabilityDefinition::new(
            REMEMBER,
            "Save a note under a key for the rest of this conversation; omit value to read it back",
            BehaviorClass::Sync,
        )
        .param("key", "note name")
        .param("value", "note content (optional)")
    }

    fn validate(&self, params: &Value) -> Result<()> {
        require_str(params, "key").map(|_| ())
    }

    async fn invoke(&self, ctx: CapabilityContext, params: Value) -> Result<Value> {
        let key = require_str(&params, "key")?;
        let mut context = ctx.context.lock().await;
        match params.get("value").filter(|v| !v.is_null()) {
            Some(value) => {
                context.insert(key.to_string(), value.clone());
                debug!(agent = %ctx.agent, session = %ctx.session_id, key = %key, "Note stored");
                Ok(json!({ "stored": key }))
            }
            None => Ok(json!({
                "key": key,
                "value": context.get(key).cloned().unwrap_or(Value::Null),
            })),
        }
    }
}
