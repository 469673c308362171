use async_trait::async_trait;
use courier_core::{BehaviorClass, CapabilityDefinition, Result};
use serde_json::{json, Value};

use crate::{optional_str, Capability, CapabilityContext};

pub const FINISH_TASK: &str = "finish_task";
pub const ALL_FINISHED: &str = "all_finished";

/// Close the session; its files move to the archive.
pub struct FinishTaskCapability;

#[async_trait]
impl Capability for FinishTaskCapability {
    fn definition(&self) -> CapabilityDefinition {
        CapabilityDefinition::new(
            FINISH_TASK,
            "Declare the task complete and close this conversation",
            BehaviorClass::Terminal,
        )
        .param("result", "final summary of the outcome")
    }

    async fn invoke(&self, _ctx: CapabilityContext, params: Value) -> Result<Value> {
        let result = optional_str(&params, "result").unwrap_or("done");
        Ok(json!({ "status": "finished", "result": result }))
    }
}

/// Ends a delegated sub-task; `result` becomes the sub-task's outcome.
pub struct AllFinishedCapability;

#[async_trait]
impl Capability for AllFinishedCapability {
    fn definition(&self) -> CapabilityDefinition {
        CapabilityDefinition::new(
            ALL_FINISHED,
            "Report that the delegated sub-task is complete",
            BehaviorClass::Terminal,
        )
        .param("result", "what was accomplished")
    }

    async fn invoke(&self, _ctx: CapabilityContext, params: Value) -> Result<Value> {
        let result = optional_str(&params, "result").unwrap_or("");
        Ok(json!({ "result": result }))
    }
}
