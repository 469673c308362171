use courier_capabilities::{
    Capability, CapabilityContext, CapabilityRegistry, MicroAgentOps, OutgoingDraft,
};
use courier_core::config::{AgentProfile, RuntimeConfig};
use courier_core::types::ChatMessage;
use courier_core::{BehaviorClass, Error, Message, Result};
use courier_storage::{CorrelationStore, Session, SessionKey, SessionStatus, SessionStore};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::adapter::extract_actions;
use crate::brain::Brain;
use crate::broker::PostOffice;
use crate::cerebellum::{Cerebellum, Verdict};
use crate::mailbox::Mailbox;
use crate::threading::correlation_for;

/// Services shared by every agent in the process.
#[derive(Clone)]
pub struct SharedServices {
    pub sessions: Arc<SessionStore>,
    pub correlations: Arc<CorrelationStore>,
    pub post_office: Arc<PostOffice>,
}

#[derive(Debug, Clone, Copy)]
pub struct RuntimeSettings {
    pub max_steps: u32,
    pub max_time: Option<Duration>,
    pub idle_timeout: Duration,
    pub cache_ttl: Duration,
}

impl RuntimeSettings {
    /// Process-wide tunables with the agent profile's overrides applied.
    pub fn for_agent(runtime: &RuntimeConfig, profile: &AgentProfile) -> Self {
        Self {
            max_steps: profile.max_steps.unwrap_or(runtime.max_steps).max(1),
            max_time: runtime.max_time_secs.map(Duration::from_secs),
            idle_timeout: Duration::from_secs(runtime.idle_timeout_secs.max(1)),
            cache_ttl: Duration::from_secs(runtime.cache_ttl_secs),
        }
    }
}

/// How processing one inbound message ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Suspended until a correlated reply arrives.
    Waiting { session_id: String },
    /// A terminal capability closed and archived the session.
    Finished { session_id: String, result: String },
    /// The step or time budget ran out; the session is left waiting.
    Incomplete { session_id: String, summary: String },
}

impl Outcome {
    pub fn session_id(&self) -> &str {
        match self {
            Outcome::Waiting { session_id }
            | Outcome::Finished { session_id, .. }
            | Outcome::Incomplete { session_id, .. } => session_id,
        }
    }
}

/// What one capability run did to the think-act loop.
enum Step {
    Continue,
    Suspend,
    Finish(String),
}

fn value_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Mailbox-driven think-act loop of one agent.
pub struct AgentRuntime {
    profile: AgentProfile,
    brain: Brain,
    cerebellum: Arc<Cerebellum>,
    capabilities: CapabilityRegistry,
    services: SharedServices,
    micro: Option<Arc<dyn MicroAgentOps>>,
    settings: RuntimeSettings,
}

impl AgentRuntime {
    pub fn new(
        profile: AgentProfile,
        brain: Brain,
        cerebellum: Arc<Cerebellum>,
        capabilities: CapabilityRegistry,
        services: SharedServices,
        settings: RuntimeSettings,
    ) -> Self {
        Self {
            profile,
            brain,
            cerebellum,
            capabilities,
            services,
            micro: None,
            settings,
        }
    }

    pub fn with_micro(mut self, micro: Arc<dyn MicroAgentOps>) -> Self {
        self.micro = Some(micro);
        self
    }

    pub fn name(&self) -> &str {
        &self.profile.name
    }

    pub fn capabilities(&self) -> &CapabilityRegistry {
        &self.capabilities
    }

    async fn system_prompt(&self) -> String {
        let contacts = self
            .services
            .post_office
            .contacts()
            .await
            .into_iter()
            .filter(|(name, _)| *name != self.profile.name)
            .map(|(name, description)| {
                if description.is_empty() {
                    format!("- {}", name)
                } else {
                    format!("- {}: {}", name, description)
                }
            })
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "You are {}. {}\n\n\
             You act by declaring capabilities, one per line, as `ACTION: <name>`. \
             Parameters are filled in from what you write, so state recipients, content and \
             values in plain words before the ACTION line.\n\n\
             Capabilities:\n{}\n\nContacts:\n{}",
            self.profile.name,
            self.profile.persona,
            self.capabilities.catalogue(),
            if contacts.is_empty() { "(none)".to_string() } else { contacts }
        )
    }

    /// Find the session an inbound message belongs to.
    ///
    /// A correlation id that is still pending in the task's table resumes the
    /// session that sent the original mail and claims the entry for this
    /// message. Anything else opens (or re-opens) the session keyed by the
    /// message id.
    pub async fn resolve_session(&self, msg: &Message) -> Session {
        let task = msg.task_key();
        if let Some(correlation) = msg.correlation_id.as_deref() {
            if let Some(session_id) = self
                .services
                .correlations
                .claim(&self.profile.name, task, correlation, &msg.id)
                .await
            {
                let key = SessionKey::new(&self.profile.name, task, &session_id);
                let mut session = match self.services.sessions.get(&key).await {
                    Some(s) => s,
                    None => {
                        warn!(session = %key, "Correlated session missing, starting fresh");
                        self.services.sessions.get_or_create(&key, msg).await
                    }
                };
                session.status = SessionStatus::Running;
                info!(agent = %self.profile.name, session = %session_id, reply = %msg.id, "Resuming session");
                return session;
            }
        }
        let key = SessionKey::new(&self.profile.name, task, &msg.id);
        self.services.sessions.get_or_create(&key, msg).await
    }

    async fn persist(&self, session: &Session) {
        if let Err(e) = self.services.sessions.save(session).await {
            warn!(session = %session.key(), error = %e, "Failed to persist session");
        }
    }

    /// Stamp, correlate and dispatch one piece of outgoing mail.
    async fn send(&self, session: &Session, draft: OutgoingDraft) {
        let correlation = correlation_for(session, &draft.to);
        let msg = Message::new(&self.profile.name, &draft.to, &draft.subject, &draft.body)
            .with_correlation(&correlation)
            .in_task(Some(session.logical_task_id.as_str()));
        // The table entry must exist before the reply can possibly arrive.
        if let Err(e) = self
            .services
            .correlations
            .record(
                &self.profile.name,
                &session.logical_task_id,
                &msg.id,
                &session.session_id,
            )
            .await
        {
            warn!(message = %msg.id, error = %e, "Failed to record correlation");
        }
        info!(
            agent = %self.profile.name,
            session = %session.session_id,
            id = %msg.id,
            to = %msg.recipient,
            correlation = %correlation,
            "Sending mail"
        );
        self.services.post_office.dispatch(msg).await;
    }

    async fn invoke(
        &self,
        session: &mut Session,
        capability: &Arc<dyn Capability>,
        params: Value,
    ) -> Result<Value> {
        capability.validate(&params)?;

        let mut ctx = CapabilityContext::new(
            &self.profile.name,
            &session.session_id,
            Some(session.logical_task_id.as_str()),
        )
        .with_context(session.context.clone());
        if let Some(micro) = &self.micro {
            ctx = ctx.with_micro(micro.clone());
        }

        let result = capability.invoke(ctx.clone(), params).await;

        let context = ctx.context_snapshot().await;
        if context != session.context {
            session.context = context;
            if let Err(e) = self.services.sessions.save_context(session).await {
                warn!(session = %session.key(), error = %e, "Failed to persist session context");
            }
        }
        for draft in ctx.take_outbox().await {
            self.send(session, draft).await;
        }
        result
    }

    async fn run_capability(
        &self,
        session: &mut Session,
        name: &str,
        capability: &Arc<dyn Capability>,
        intention: &str,
    ) -> Step {
        let def = capability.definition();
        let params = match self
            .cerebellum
            .negotiate(&def, intention, &session.history, &self.brain)
            .await
        {
            Verdict::Ready(params) => Value::Object(params),
            Verdict::NotToRun(reason) => {
                session.push(ChatMessage::feedback(
                    name,
                    intention,
                    &format!("skipped: {}", reason),
                ));
                return Step::Continue;
            }
        };

        let result = match self.invoke(session, capability, params).await {
            Ok(v) => value_text(&v),
            Err(e) => {
                warn!(agent = %self.profile.name, capability = %name, error = %e, "Capability failed");
                session.push(ChatMessage::feedback(name, intention, &format!("failed: {}", e)));
                return Step::Continue;
            }
        };
        session.push(ChatMessage::feedback(name, intention, &result));

        match def.behavior {
            BehaviorClass::Sync => Step::Continue,
            BehaviorClass::Async => Step::Suspend,
            BehaviorClass::Terminal => Step::Finish(result),
        }
    }

    /// Run the think-act loop for one inbound message until the session
    /// suspends, finishes, or exhausts its budget.
    ///
    /// A claimed correlation entry is settled only once processing returns,
    /// so a reply redelivered after a crash still resumes its session.
    pub async fn process_message(&self, msg: Message) -> Result<Outcome> {
        let outcome = self.think_and_act(&msg).await;
        if let Some(correlation) = msg.correlation_id.as_deref() {
            self.services
                .correlations
                .settle(&self.profile.name, msg.task_key(), correlation, &msg.id)
                .await;
        }
        outcome
    }

    async fn think_and_act(&self, msg: &Message) -> Result<Outcome> {
        let mut session = self.resolve_session(msg).await;
        session.status = SessionStatus::Running;
        session.record_inbound(msg);
        self.persist(&session).await;

        info!(
            agent = %self.profile.name,
            session = %session.session_id,
            from = %msg.sender,
            "Processing mail"
        );

        let system = self.system_prompt().await;
        let available = self.capabilities.names();
        let started = Instant::now();
        let mut stop_reason = "step budget exhausted".to_string();

        'think: for step in 0..self.settings.max_steps {
            if self
                .settings
                .max_time
                .is_some_and(|limit| started.elapsed() >= limit)
            {
                stop_reason = "time budget exhausted".to_string();
                break;
            }

            let mut conversation = Vec::with_capacity(session.history.len() + 1);
            conversation.push(ChatMessage::system(&system));
            conversation.extend(session.history.iter().cloned());

            let intention = match self.brain.think(&conversation).await {
                Ok(reply) => reply.content,
                Err(e) => {
                    error!(agent = %self.profile.name, error = %e, "Brain unavailable");
                    stop_reason = e.to_string();
                    break;
                }
            };
            session.push(ChatMessage::assistant(&intention));

            let declared = extract_actions(&intention);
            debug!(agent = %self.profile.name, step, ?declared, "Intention parsed");
            if declared.is_empty() {
                session.push(ChatMessage::user(&format!(
                    "You did not declare a capability. Use one line `ACTION: <name>` per capability. Available: {}",
                    available.join(", ")
                )));
                self.persist(&session).await;
                continue;
            }

            for name in &declared {
                let Some(capability) = self.capabilities.get(name) else {
                    let err = Error::HallucinatedCapability(name.clone());
                    warn!(agent = %self.profile.name, error = %err, "Brain named an unknown capability");
                    session.push(ChatMessage::user(&format!(
                        "{}. You can only use: {}. Think again.",
                        err,
                        available.join(", ")
                    )));
                    self.persist(&session).await;
                    continue 'think;
                };

                match self.run_capability(&mut session, name, capability, &intention).await {
                    Step::Continue => {}
                    Step::Suspend => {
                        session.status = SessionStatus::Waiting;
                        self.persist(&session).await;
                        info!(agent = %self.profile.name, session = %session.session_id, "Session waiting for reply");
                        return Ok(Outcome::Waiting {
                            session_id: session.session_id,
                        });
                    }
                    Step::Finish(result) => {
                        self.persist(&session).await;
                        if let Err(e) = self.services.sessions.archive(&session.key()).await {
                            warn!(session = %session.key(), error = %e, "Failed to archive session");
                        }
                        self.services
                            .correlations
                            .forget_session(
                                &self.profile.name,
                                &session.logical_task_id,
                                &session.session_id,
                            )
                            .await;
                        info!(agent = %self.profile.name, session = %session.session_id, "Session finished");
                        return Ok(Outcome::Finished {
                            session_id: session.session_id,
                            result,
                        });
                    }
                }
            }
            self.persist(&session).await;
        }

        let last = session
            .history
            .iter()
            .rev()
            .find(|m| m.role == "assistant")
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let summary = format!("[INCOMPLETE] {}: {}", stop_reason, last);
        warn!(agent = %self.profile.name, session = %session.session_id, reason = %stop_reason, "Stopped before finishing");
        session.status = SessionStatus::Waiting;
        self.persist(&session).await;
        Ok(Outcome::Incomplete {
            session_id: session.session_id,
            summary,
        })
    }

    /// Cache housekeeping done while the mailbox is idle.
    async fn housekeeping(&self) {
        let evicted = self
            .services
            .sessions
            .evict_idle(self.settings.cache_ttl)
            .await;
        if evicted > 0 {
            debug!(agent = %self.profile.name, evicted, "Idle sessions evicted");
        }
    }

    /// Serve `mailbox` until shutdown. The message being processed stays
    /// recorded as in flight until processing returns.
    pub async fn run_loop(&self, mailbox: Arc<Mailbox>, mut shutdown: broadcast::Receiver<()>) {
        info!(agent = %self.profile.name, "Agent started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                msg = mailbox.recv_timeout(self.settings.idle_timeout) => {
                    match msg {
                        Some(msg) => {
                            let id = msg.id.clone();
                            match self.process_message(msg).await {
                                Ok(outcome) => debug!(agent = %self.profile.name, message = %id, ?outcome, "Mail processed"),
                                Err(e) => error!(agent = %self.profile.name, message = %id, error = %e, "Mail processing failed"),
                            }
                            mailbox.complete().await;
                        }
                        None => self.housekeeping().await,
                    }
                }
            }
        }
        info!(agent = %self.profile.name, "Agent stopped");
    }
}
