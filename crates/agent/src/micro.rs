use async_trait::async_trait;
use courier_capabilities::{CapabilityContext, CapabilityRegistry, MicroAgentOps, MicroReport, MicroRequest};
use courier_core::types::ChatMessage;
use courier_core::{BehaviorClass, CapabilityDefinition, Result};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::brain::Brain;
use crate::cerebellum::{Cerebellum, Verdict};
use crate::detect::ActionDetector;

const DEFAULT_PERSONA: &str = "You are a focused assistant completing one sub-task.";

/// The `result` field of a finish output, or the output itself; empty is none.
fn result_text(v: &Value) -> Option<String> {
    let text = match v {
        Value::Object(map) => match map.get("result") {
            None | Some(Value::Null) => return None,
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        },
        Value::String(s) => s.clone(),
        Value::Null => return None,
        other => other.to_string(),
    };
    Some(text).filter(|s| !s.trim().is_empty())
}

#[derive(Debug, Clone)]
pub struct MicroOutcome {
    pub result: String,
    pub finished: bool,
    pub history: Vec<ChatMessage>,
}

/// Limits for one sub-task run.
#[derive(Debug, Clone, Copy)]
pub struct MicroBudget {
    pub max_steps: u32,
    pub max_time: Option<Duration>,
}

/// Bounded think-act executor for delegated sub-tasks.
///
/// Unlike the agent runtime it has no mailbox and no session: it runs until
/// the finish capability fires or the budget runs out, executing every
/// detected capability of a round in order and feeding all results back as a
/// single turn.
pub struct MicroAgent {
    brain: Brain,
    cerebellum: Arc<Cerebellum>,
    detector: ActionDetector,
    capabilities: CapabilityRegistry,
    finish_capability: String,
    budget: MicroBudget,
}

impl MicroAgent {
    pub fn new(
        brain: Brain,
        cerebellum: Arc<Cerebellum>,
        capabilities: CapabilityRegistry,
        finish_capability: &str,
        budget: MicroBudget,
    ) -> Self {
        let detector = ActionDetector::new(cerebellum.backend().clone());
        Self {
            brain,
            cerebellum,
            detector,
            capabilities,
            finish_capability: finish_capability.to_string(),
            budget,
        }
    }

    fn finish_definition(&self) -> CapabilityDefinition {
        self.capabilities
            .get(&self.finish_capability)
            .map(|c| c.definition())
            .unwrap_or_else(|| {
                CapabilityDefinition::new(
                    &self.finish_capability,
                    "Report that the sub-task is complete",
                    BehaviorClass::Terminal,
                )
                .param("result", "what was accomplished")
            })
    }

    fn system_prompt(&self, persona: &str, available: &[String]) -> String {
        let mut catalogue: Vec<String> = available
            .iter()
            .filter(|n| **n != self.finish_capability)
            .filter_map(|n| self.capabilities.get(n))
            .map(|c| c.definition().prompt_line())
            .collect();
        catalogue.push(self.finish_definition().prompt_line());
        format!(
            "{}\n\nWork step by step. In each reply, name the capabilities to use now; they run \
             in the order you mention them and their results come back to you. When the sub-task \
             is complete, use {} with the final result.\n\nCapabilities:\n{}",
            persona,
            self.finish_capability,
            catalogue.join("\n")
        )
    }

    async fn run_one(
        &self,
        ctx: &CapabilityContext,
        name: &str,
        intention: &str,
        history: &[ChatMessage],
    ) -> String {
        let Some(capability) = self.capabilities.get(name) else {
            return format!("failed: unknown capability {}", name);
        };
        let def = capability.definition();
        let params = match self
            .cerebellum
            .negotiate(&def, intention, history, &self.brain)
            .await
        {
            Verdict::Ready(params) => Value::Object(params),
            Verdict::NotToRun(reason) => return format!("skipped: {}", reason),
        };
        if let Err(e) = capability.validate(&params) {
            return format!("failed: {}", e);
        }
        match capability.invoke(ctx.clone(), params).await {
            Ok(Value::String(s)) => s,
            Ok(v) => v.to_string(),
            Err(e) => {
                warn!(capability = %name, error = %e, "Sub-task capability failed");
                format!("failed: {}", e)
            }
        }
    }

    /// The sub-task's final result: the finish capability's output, or the
    /// intention itself when negotiation or the capability yields nothing.
    async fn finish_result(
        &self,
        ctx: &CapabilityContext,
        intention: &str,
        history: &[ChatMessage],
    ) -> String {
        let def = self.finish_definition();
        let params = match self
            .cerebellum
            .negotiate(&def, intention, history, &self.brain)
            .await
        {
            Verdict::Ready(params) => Value::Object(params),
            Verdict::NotToRun(_) => return intention.to_string(),
        };
        let Some(capability) = self.capabilities.get(&self.finish_capability) else {
            return result_text(&params).unwrap_or_else(|| intention.to_string());
        };
        let output = match capability.validate(&params) {
            Ok(()) => capability.invoke(ctx.clone(), params).await,
            Err(e) => Err(e),
        };
        match output {
            Ok(v) => result_text(&v).unwrap_or_else(|| intention.to_string()),
            Err(e) => {
                warn!(capability = %self.finish_capability, error = %e, "Finish capability failed");
                intention.to_string()
            }
        }
    }

    /// Run one sub-task. `available` limits which registered capabilities it
    /// may use; the finish capability is always available.
    pub async fn execute(
        &self,
        ctx: &CapabilityContext,
        persona: &str,
        task: &str,
        available: &[String],
        budget: MicroBudget,
        resume_history: Vec<ChatMessage>,
    ) -> Result<MicroOutcome> {
        let mut available: Vec<String> = available
            .iter()
            .filter(|n| self.capabilities.contains(n) && **n != self.finish_capability)
            .cloned()
            .collect();
        available.push(self.finish_capability.clone());

        let mut history = if resume_history.is_empty() {
            vec![
                ChatMessage::system(&self.system_prompt(persona, &available)),
                ChatMessage::user(task),
            ]
        } else {
            let mut h = resume_history;
            h.push(ChatMessage::user(&format!("Continue the sub-task: {}", task)));
            h
        };

        info!(agent = %ctx.agent, session = %ctx.session_id, max_steps = budget.max_steps, "Sub-task started");
        let started = Instant::now();

        for step in 0..budget.max_steps {
            if budget.max_time.is_some_and(|limit| started.elapsed() >= limit) {
                debug!(step, "Sub-task out of time");
                break;
            }

            let intention = self.brain.think(&history).await?.content;
            history.push(ChatMessage::assistant(&intention));

            let actions = self.detector.detect(&intention, &available).await;
            if actions.is_empty() {
                history.push(ChatMessage::user(&format!(
                    "No capability was named. Available: {}. Name the ones to use now, or {} when done.",
                    available.join(", "),
                    self.finish_capability
                )));
                continue;
            }

            let mut results = Vec::with_capacity(actions.len());
            for name in &actions {
                if *name == self.finish_capability {
                    let result = self.finish_result(ctx, &intention, &history).await;
                    info!(agent = %ctx.agent, step, "Sub-task finished");
                    return Ok(MicroOutcome {
                        result,
                        finished: true,
                        history,
                    });
                }
                let outcome = self.run_one(ctx, name, &intention, &history).await;
                results.push(json!({ "capability": name, "result": outcome }));
            }
            history.push(ChatMessage::user(
                &json!({ "intention": intention, "results": results }).to_string(),
            ));
        }

        let last = history
            .iter()
            .rev()
            .find(|m| m.role == "assistant")
            .map(|m| m.content.clone())
            .unwrap_or_default();
        warn!(agent = %ctx.agent, session = %ctx.session_id, "Sub-task budget exhausted");
        Ok(MicroOutcome {
            result: format!("[INCOMPLETE] {}", last),
            finished: false,
            history,
        })
    }
}

#[async_trait]
impl MicroAgentOps for MicroAgent {
    async fn run(&self, ctx: &CapabilityContext, request: MicroRequest) -> Result<MicroReport> {
        let available = if request.capabilities.is_empty() {
            self.capabilities.names()
        } else {
            request
                .capabilities
                .iter()
                .filter(|n| {
                    let known = self.capabilities.contains(n);
                    if !known {
                        warn!(capability = %n, "Ignoring unknown capability for sub-task");
                    }
                    known
                })
                .cloned()
                .collect()
        };
        let persona = request.persona.as_deref().unwrap_or(DEFAULT_PERSONA);
        let budget = MicroBudget {
            max_steps: request.max_steps.unwrap_or(self.budget.max_steps).max(1),
            max_time: request.max_time.or(self.budget.max_time),
        };
        let outcome = self
            .execute(
                ctx,
                persona,
                &request.task,
                &available,
                budget,
                request.resume_history,
            )
            .await?;
        Ok(MicroReport {
            result: outcome.result,
            finished: outcome.finished,
            history: outcome.history,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::testing::scripted;
    use courier_capabilities::finish::AllFinishedCapability;
    use courier_capabilities::Capability;
    use courier_core::Error;
    use tokio::sync::Mutex;

    struct Recorder {
        name: &'static str,
        fail: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Capability for Recorder {
        fn definition(&self) -> CapabilityDefinition {
            CapabilityDefinition::new(self.name, "test", BehaviorClass::Sync)
        }

        async fn invoke(&self, _ctx: CapabilityContext, _params: Value) -> Result<Value> {
            self.log.lock().await.push(self.name.to_string());
            if self.fail {
                Err(Error::capability(self.name, "boom"))
            } else {
                Ok(json!(format!("{} ok", self.name)))
            }
        }
    }

    fn registry(log: &Arc<Mutex<Vec<String>>>, failing: &str) -> CapabilityRegistry {
        let mut registry = CapabilityRegistry::new();
        for name in ["write", "send_email"] {
            registry.register(Arc::new(Recorder {
                name,
                fail: name == failing,
                log: log.clone(),
            }));
        }
        registry.register(Arc::new(AllFinishedCapability));
        registry
    }

    fn budget(max_steps: u32) -> MicroBudget {
        MicroBudget {
            max_steps,
            max_time: None,
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_repeated_mentions_run_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (brain, _) = scripted(
            "brain",
            &[
                "I will write the draft, send_email it, then write a summary.",
                "Everything is done, all_finished.",
            ],
        );
        let (backend, _) = scripted(
            "cerebellum",
            &[
                r#"{"execute": ["write", "send_email", "write"]}"#,
                r#"{"decision": "ready", "params": {"result": "draft sent"}}"#,
            ],
        );
        let micro = MicroAgent::new(
            brain,
            Arc::new(Cerebellum::new(backend, 3)),
            registry(&log, ""),
            "all_finished",
            budget(5),
        );
        let ctx = CapabilityContext::new("Coder", "M1", None);

        let outcome = micro
            .execute(&ctx, "persona", "send the draft", &names(&["write", "send_email"]), budget(5), Vec::new())
            .await
            .unwrap();

        assert_eq!(*log.lock().await, names(&["write", "send_email", "write"]));
        assert!(outcome.finished);
        assert_eq!(outcome.result, "draft sent");
        let feedback: Value = serde_json::from_str(&outcome.history[3].content).unwrap();
        assert_eq!(feedback["results"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_failure_does_not_abort_batch() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (brain, _) = scripted("brain", &["write, then send_email", "all_finished"]);
        let (backend, _) = scripted(
            "cerebellum",
            &[
                r#"{"execute": ["write", "send_email"]}"#,
                r#"{"decision": "ready", "params": {"result": "partly"}}"#,
            ],
        );
        let micro = MicroAgent::new(
            brain,
            Arc::new(Cerebellum::new(backend, 3)),
            registry(&log, "write"),
            "all_finished",
            budget(5),
        );
        let ctx = CapabilityContext::new("Coder", "M1", None);
        let outcome = micro
            .execute(&ctx, "p", "t", &names(&["write", "send_email"]), budget(5), Vec::new())
            .await
            .unwrap();

        assert_eq!(*log.lock().await, names(&["write", "send_email"]));
        assert!(outcome.history[3].content.contains("failed:"));
        assert!(outcome.finished);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_is_incomplete() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (brain, _) = scripted("brain", &["hmm", "still thinking"]);
        let (backend, _) = scripted("cerebellum", &[]);
        let micro = MicroAgent::new(
            brain,
            Arc::new(Cerebellum::new(backend, 3)),
            registry(&log, ""),
            "all_finished",
            budget(2),
        );
        let ctx = CapabilityContext::new("Coder", "M1", None);
        let outcome = micro
            .execute(&ctx, "p", "t", &names(&["write"]), budget(2), Vec::new())
            .await
            .unwrap();

        assert!(!outcome.finished);
        assert_eq!(outcome.result, "[INCOMPLETE] still thinking");
        assert!(log.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_resume_continues_history() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (brain, brain_log) = scripted("brain", &["all_finished"]);
        let (backend, _) = scripted("cerebellum", &[r#"{"decision":"ready","params":{"result":"ok"}}"#]);
        let micro = MicroAgent::new(
            brain,
            Arc::new(Cerebellum::new(backend, 3)),
            registry(&log, ""),
            "all_finished",
            budget(3),
        );
        let ctx = CapabilityContext::new("Coder", "M1", None);
        let earlier = vec![ChatMessage::system("s"), ChatMessage::user("t"), ChatMessage::assistant("hmm")];
        let report = micro
            .run(
                &ctx,
                MicroRequest {
                    task: "t".to_string(),
                    resume_history: earlier,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(report.finished);
        assert_eq!(brain_log.seen.lock().await[0].len(), 4);
    }

    #[tokio::test]
    async fn test_request_budget_overrides_default() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (brain, brain_log) = scripted("brain", &["hmm", "all_finished"]);
        let (backend, _) = scripted("cerebellum", &[]);
        let micro = MicroAgent::new(
            brain,
            Arc::new(Cerebellum::new(backend, 3)),
            registry(&log, ""),
            "all_finished",
            budget(10),
        );
        let ctx = CapabilityContext::new("Coder", "M1", None);
        let report = micro
            .run(
                &ctx,
                MicroRequest {
                    task: "t".to_string(),
                    max_steps: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!report.finished);
        assert_eq!(report.result, "[INCOMPLETE] hmm");
        assert_eq!(brain_log.seen.lock().await.len(), 1);
    }

    struct WrapUp {
        calls: Arc<Mutex<Vec<Value>>>,
    }

    #[async_trait]
    impl Capability for WrapUp {
        fn definition(&self) -> CapabilityDefinition {
            CapabilityDefinition::new("wrap_up", "finish", BehaviorClass::Terminal)
                .param("result", "outcome")
        }

        async fn invoke(&self, _ctx: CapabilityContext, params: Value) -> Result<Value> {
            self.calls.lock().await.push(params.clone());
            let result = params["result"].as_str().unwrap_or_default();
            Ok(json!({ "result": format!("wrapped: {}", result) }))
        }
    }

    #[tokio::test]
    async fn test_finish_capability_output_is_the_result() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut registry = CapabilityRegistry::new();
        registry.register(Arc::new(WrapUp { calls: calls.clone() }));
        let (brain, _) = scripted("brain", &["Done, wrap_up."]);
        let (backend, _) = scripted(
            "cerebellum",
            &[r#"{"decision": "ready", "params": {"result": "report filed"}}"#],
        );
        let micro = MicroAgent::new(
            brain,
            Arc::new(Cerebellum::new(backend, 3)),
            registry,
            "wrap_up",
            budget(3),
        );
        let ctx = CapabilityContext::new("Coder", "M1", None);
        let outcome = micro
            .execute(&ctx, "p", "t", &[], budget(3), Vec::new())
            .await
            .unwrap();

        assert!(outcome.finished);
        assert_eq!(outcome.result, "wrapped: report filed");
        assert_eq!(calls.lock().await.len(), 1);
    }
}
