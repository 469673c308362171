use async_trait::async_trait;
use courier_core::{BehaviorClass, CapabilityDefinition, Result};
use serde_json::{json, Value};
use tracing::debug;

use crate::{optional_str, require_str, Capability, CapabilityContext, OutgoingDraft};

pub const SEND_MESSAGE: &str = "send_message";

/// Mail another agent and suspend the session until it replies.
pub struct SendMessageCapability;

#[async_trait]
impl Capability for SendMessageCapability {
    fn definition(&self) -> CapabilityDefinition {
        CapabilityDefinition::new(
            SEND_MESSAGE,
            "Send mail to a contact and wait for the reply",
            BehaviorClass::Async,
        )
        .param("to", "name of the recipient")
        .param("subject", "short subject line (optional)")
        .param("body", "message text")
    }

    fn validate(&self, params: &Value) -> Result<()> {
        require_str(params, "to")?;
        require_str(params, "body")?;
        Ok(())
    }

    async fn invoke(&self, ctx: CapabilityContext, params: Value) -> Result<Value> {
        let to = require_str(&params, "to")?.trim();
        let body = require_str(&params, "body")?;
        let subject = optional_str(&params, "subject").unwrap_or("");

        ctx.outbox.lock().await.push(OutgoingDraft {
            to: to.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        });
        debug!(agent = %ctx.agent, to = %to, body_len = body.len(), "Mail queued");

        Ok(json!({ "status": "queued", "to": to }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        let cap = SendMessageCapability;
        assert!(cap.validate(&json!({"to": "Coder", "body": "hi"})).is_ok());
        assert!(cap.validate(&json!({"to": "Coder"})).is_err());
        assert!(cap.validate(&json!({"to": " ", "body": "hi"})).is_err());
    }

    #[tokio::test]
    async fn test_invoke_queues_draft() {
        let ctx = CapabilityContext::new("Planner", "M1", None);
        SendMessageCapability
            .invoke(ctx.clone(), json!({"to": "Coder", "subject": "task", "body": "write it"}))
            .await
            .unwrap();
        let drafts = ctx.take_outbox().await;
        assert_eq!(
            drafts,
            vec![OutgoingDraft {
                to: "Coder".to_string(),
                subject: "task".to_string(),
                body: "write it".to_string(),
            }]
        );
        assert!(ctx.take_outbox().await.is_empty());
    }
}
