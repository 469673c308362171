use courier_core::types::ChatMessage;
use courier_core::{CapabilityDefinition, Error};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::adapter::{parse_negotiation, Negotiation};
use crate::brain::Brain;

/// Turns of brain history shown to the cerebellum as background.
const CONTEXT_TURNS: usize = 6;

/// Outcome of parameter negotiation for one capability.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Ready(Map<String, Value>),
    NotToRun(String),
}

/// Resolves capability parameters from the brain's free-text intention.
///
/// The cerebellum may answer `ready`, refuse with `not_to_run`, or `ask` the
/// brain a question. Questions and answers stay in a private transcript that
/// never reaches the session history.
pub struct Cerebellum {
    backend: Brain,
    max_turns: u32,
}

impl Cerebellum {
    pub fn new(backend: Brain, max_turns: u32) -> Self {
        Self {
            backend,
            max_turns: max_turns.max(1),
        }
    }

    pub fn backend(&self) -> &Brain {
        &self.backend
    }

    fn system_prompt(def: &CapabilityDefinition) -> String {
        let params = if def.parameter_schema.is_empty() {
            "(none)".to_string()
        } else {
            def.parameter_schema
                .iter()
                .map(|(k, v)| format!("- {}: {}", k, v))
                .collect::<Vec<_>>()
                .join("\n")
        };
        format!(
            "You fill in parameters for the capability `{}`: {}\n\
             Parameters:\n{}\n\n\
             Reply with exactly one JSON object and nothing else:\n\
             {{\"decision\": \"ready\", \"params\": {{...}}}} when every needed value is known,\n\
             {{\"decision\": \"ask\", \"question\": \"...\"}} to ask the agent for a missing value,\n\
             {{\"decision\": \"not_to_run\", \"reason\": \"...\"}} when the capability should not run.",
            def.name, def.description, params
        )
    }

    fn request(intention: &str, history: &[ChatMessage]) -> String {
        let recent = history
            .iter()
            .filter(|m| !m.is_system())
            .rev()
            .take(CONTEXT_TURNS)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .map(|m| format!("[{}] {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n");
        format!("Agent intention:\n{}\n\nRecent conversation:\n{}", intention, recent)
    }

    /// Negotiate parameters for `def`. `answerer` is the agent's own brain,
    /// consulted over `history` when the cerebellum asks a question.
    pub async fn negotiate(
        &self,
        def: &CapabilityDefinition,
        intention: &str,
        history: &[ChatMessage],
        answerer: &Brain,
    ) -> Verdict {
        if def.parameter_schema.is_empty() {
            return Verdict::Ready(Map::new());
        }

        let mut transcript = vec![
            ChatMessage::system(&Self::system_prompt(def)),
            ChatMessage::user(&Self::request(intention, history)),
        ];

        for turn in 1..=self.max_turns {
            let reply = match self.backend.think(&transcript).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(capability = %def.name, error = %e, "Cerebellum unavailable, not running");
                    return Verdict::NotToRun(format!("cerebellum unavailable: {}", e));
                }
            };
            transcript.push(ChatMessage::assistant(&reply.content));

            match parse_negotiation(&reply.content) {
                Some(Negotiation::Ready { params }) => {
                    debug!(capability = %def.name, turn, "Parameters ready");
                    return Verdict::Ready(params);
                }
                Some(Negotiation::NotToRun { reason }) => {
                    info!(capability = %def.name, reason = %reason, "Cerebellum declined");
                    return Verdict::NotToRun(reason);
                }
                Some(Negotiation::Ask { question }) => {
                    if turn == self.max_turns {
                        break;
                    }
                    debug!(capability = %def.name, question = %question, "Cerebellum asks the brain");
                    let mut consult = history.to_vec();
                    consult.push(ChatMessage::user(&format!(
                        "To run `{}` you are asked: {}\nAnswer briefly with the missing value only.",
                        def.name, question
                    )));
                    let answer = match answerer.think(&consult).await {
                        Ok(a) => a.content,
                        Err(e) => {
                            warn!(capability = %def.name, error = %e, "Brain could not answer");
                            return Verdict::NotToRun(format!("brain unavailable: {}", e));
                        }
                    };
                    transcript.push(ChatMessage::user(&format!("Answer: {}", answer)));
                }
                None => {
                    debug!(capability = %def.name, turn, "Unparseable cerebellum reply");
                    transcript.push(ChatMessage::user(
                        "That was not a single JSON object with a valid decision. Reply again with JSON only.",
                    ));
                }
            }
        }

        let exhausted = Error::NegotiationExhausted(def.name.clone());
        warn!(capability = %def.name, turns = self.max_turns, "{}", exhausted);
        Verdict::NotToRun(exhausted.to_string())
    }
}
