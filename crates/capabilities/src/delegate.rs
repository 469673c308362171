use async_trait::async_trait;
use courier_core::types::ChatMessage;
use courier_core::{BehaviorClass, CapabilityDefinition, Error, Result};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{info, warn};

use crate::{
    optional_count, optional_str, require_str, Capability, CapabilityContext, MicroRequest,
};

pub const DELEGATE: &str = "delegate";

/// Context key holding the transcript of an unfinished delegated run.
pub const PENDING_DELEGATION_KEY: &str = "pending_delegation";

/// Hand a bounded sub-task to a micro-agent and feed its outcome back.
pub struct DelegateCapability;

impl DelegateCapability {
    fn requested_capabilities(params: &Value) -> Vec<String> {
        params
            .get("capabilities")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str())
                    .map(|s| s.to_string())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl Capability for DelegateCapability {
    fn definition(&self) -> CapabilityDefinition {
        CapabilityDefinition::new(
            DELEGATE,
            "Run a focused sub-task step by step with your capabilities and return its result",
            BehaviorClass::Sync,
        )
        .param("task", "what the sub-task must achieve")
        .param("capabilities", "list of capability names it may use (optional)")
        .param("persona", "role description for the sub-task (optional)")
        .param("resume", "true to continue the last unfinished sub-task (optional)")
        .param("max_steps", "step limit for the sub-task (optional)")
        .param("max_seconds", "time limit for the sub-task in seconds (optional)")
    }

    fn validate(&self, params: &Value) -> Result<()> {
        require_str(params, "task")?;
        if let Some(caps) = params.get("capabilities") {
            if !caps.is_array() && !caps.is_null() {
                return Err(Error::Validation(
                    "capabilities must be a list of names".to_string(),
                ));
            }
        }
        optional_count(params, "max_steps")?;
        optional_count(params, "max_seconds")?;
        Ok(())
    }

    async fn invoke(&self, ctx: CapabilityContext, params: Value) -> Result<Value> {
        let micro = ctx
            .micro
            .clone()
            .ok_or_else(|| Error::capability(DELEGATE, "sub-task execution is not configured"))?;

        let resume = params.get("resume").and_then(|v| v.as_bool()).unwrap_or(false);
        let resume_history: Vec<ChatMessage> = if resume {
            let pending = ctx.context.lock().await.get(PENDING_DELEGATION_KEY).cloned();
            match pending.map(serde_json::from_value) {
                Some(Ok(history)) => history,
                Some(Err(e)) => {
                    warn!(session = %ctx.session_id, error = %e, "Discarding unreadable pending delegation");
                    Vec::new()
                }
                None => Vec::new(),
            }
        } else {
            Vec::new()
        };

        let request = MicroRequest {
            persona: optional_str(&params, "persona").map(|s| s.to_string()),
            task: require_str(&params, "task")?.to_string(),
            capabilities: Self::requested_capabilities(&params),
            resume_history,
            max_steps: optional_count(&params, "max_steps")?
                .map(|n| u32::try_from(n).unwrap_or(u32::MAX)),
            max_time: optional_count(&params, "max_seconds")?.map(Duration::from_secs),
        };

        info!(agent = %ctx.agent, session = %ctx.session_id, resume, "Delegating sub-task");
        let report = micro.run(&ctx, request).await?;

        let mut context = ctx.context.lock().await;
        if report.finished {
            context.remove(PENDING_DELEGATION_KEY);
        } else {
            context.insert(
                PENDING_DELEGATION_KEY.to_string(),
                serde_json::to_value(&report.history)?,
            );
        }

        Ok(json!({ "result": report.result, "finished": report.finished }))
    }
}
