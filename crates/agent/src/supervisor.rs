use courier_capabilities::delegate::DELEGATE;
use courier_capabilities::CapabilityRegistry;
use courier_core::config::AgentProfile;
use courier_core::{Config, Error, Message, Paths, Result};
use courier_providers::{create_brain_provider, create_cerebellum_provider, Provider};
use courier_storage::{AuditLogger, CorrelationStore, SessionStore};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::brain::Brain;
use crate::broker::PostOffice;
use crate::cerebellum::Cerebellum;
use crate::health::{BackendMonitor, HealthGate};
use crate::mailbox::Mailbox;
use crate::micro::{MicroAgent, MicroBudget};
use crate::runtime::{AgentRuntime, RuntimeSettings, SharedServices};
use crate::snapshot::{AgentSnapshot, Snapshot};

struct AgentSlot {
    runtime: Arc<AgentRuntime>,
    mailbox: Arc<Mailbox>,
}

/// Owns every long-running task of the process: one loop per agent, the
/// post office and the backend monitor.
pub struct Supervisor {
    config: Config,
    paths: Paths,
    gate: Arc<HealthGate>,
    services: SharedServices,
    agents: Vec<AgentSlot>,
    monitor: Option<BackendMonitor>,
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<(String, JoinHandle<()>)>,
}

impl Supervisor {
    /// Build the runtime described by `config` with real model backends.
    pub async fn boot(config: Config) -> Result<Self> {
        config.validate()?;
        let brain = create_brain_provider(&config)?;
        let cerebellum = create_cerebellum_provider(&config)?;
        Self::assemble(config, brain, cerebellum, CapabilityRegistry::with_builtins()).await
    }

    /// Build the runtime around already constructed providers and capability
    /// catalogue. Agents are registered but nothing runs until [`start`].
    ///
    /// [`start`]: Supervisor::start
    pub async fn assemble(
        config: Config,
        brain_provider: Arc<dyn Provider>,
        cerebellum_provider: Arc<dyn Provider>,
        registry: CapabilityRegistry,
    ) -> Result<Self> {
        let paths = config.paths();
        paths.ensure_dirs()?;

        let gate = Arc::new(HealthGate::new(&config.health));
        let brain = Brain::new("brain", brain_provider.clone(), gate.clone());
        let cerebellum = Arc::new(Cerebellum::new(
            Brain::new("cerebellum", cerebellum_provider.clone(), gate.clone()),
            config.runtime.negotiation_turns,
        ));

        let services = SharedServices {
            sessions: Arc::new(SessionStore::new(paths.clone())),
            correlations: Arc::new(CorrelationStore::new(paths.clone())),
            post_office: Arc::new(PostOffice::new(
                Some(AuditLogger::new(paths.clone())),
                config.runtime.queue_warn_depth,
            )),
        };

        // Sub-tasks never delegate again.
        let micro = Arc::new(MicroAgent::new(
            brain.clone(),
            cerebellum.clone(),
            registry.without(&[DELEGATE]),
            &config.runtime.micro_finish_capability,
            MicroBudget {
                max_steps: config.runtime.micro_max_steps.max(1),
                max_time: config.runtime.micro_max_time_secs.map(Duration::from_secs),
            },
        ));

        let mut agents = Vec::with_capacity(config.agents.len());
        for profile in &config.agents {
            let capabilities = agent_capabilities(&registry, profile, &config.runtime.micro_finish_capability)?;
            let capacity = profile
                .mailbox_capacity
                .unwrap_or(config.runtime.mailbox_capacity)
                .max(1);
            let mailbox = services
                .post_office
                .register(&profile.name, &profile.description, capacity)
                .await;
            let settings = RuntimeSettings::for_agent(&config.runtime, profile);
            info!(
                agent = %profile.name,
                capabilities = ?capabilities.names(),
                capacity,
                "Agent registered"
            );
            let runtime = AgentRuntime::new(
                profile.clone(),
                brain.clone(),
                cerebellum.clone(),
                capabilities,
                services.clone(),
                settings,
            )
            .with_micro(micro.clone());
            agents.push(AgentSlot {
                runtime: Arc::new(runtime),
                mailbox,
            });
        }

        let monitor = BackendMonitor::new(
            gate.clone(),
            [brain_provider, cerebellum_provider],
            Duration::from_secs(config.health.probe_interval_secs.max(1)),
        );
        let (shutdown_tx, _) = broadcast::channel(4);

        Ok(Self {
            config,
            paths,
            gate,
            services,
            agents,
            monitor: Some(monitor),
            shutdown_tx,
            handles: Vec::new(),
        })
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    pub fn gate(&self) -> Arc<HealthGate> {
        self.gate.clone()
    }

    pub fn post_office(&self) -> Arc<PostOffice> {
        self.services.post_office.clone()
    }

    pub fn agent_names(&self) -> Vec<String> {
        self.agents.iter().map(|a| a.runtime.name().to_string()).collect()
    }

    pub fn is_running(&self) -> bool {
        !self.handles.is_empty()
    }

    /// Register a participant that is not an agent, such as `User`. Its mail
    /// is collected from the returned mailbox by the caller.
    pub async fn register_external(&self, name: &str, description: &str) -> Arc<Mailbox> {
        self.services
            .post_office
            .register(name, description, self.config.runtime.mailbox_capacity)
            .await
    }

    pub async fn send(&self, msg: Message) {
        self.services.post_office.dispatch(msg).await;
    }

    /// Spawn the post office, the backend monitor and every agent loop.
    pub fn start(&mut self) {
        if self.is_running() {
            warn!("Supervisor already started");
            return;
        }

        let office = self.services.post_office.clone();
        let rx = self.shutdown_tx.subscribe();
        self.handles.push((
            "post-office".to_string(),
            tokio::spawn(async move { office.run(rx).await }),
        ));

        if let Some(monitor) = self.monitor.take() {
            let rx = self.shutdown_tx.subscribe();
            self.handles.push((
                "backend-monitor".to_string(),
                tokio::spawn(async move { monitor.run(rx).await }),
            ));
        }

        for slot in &self.agents {
            let runtime = slot.runtime.clone();
            let mailbox = slot.mailbox.clone();
            let rx = self.shutdown_tx.subscribe();
            self.handles.push((
                runtime.name().to_string(),
                tokio::spawn(async move { runtime.run_loop(mailbox, rx).await }),
            ));
        }
        info!(agents = self.agents.len(), "Supervisor started");
    }

    /// Capture all pending mail. The post office is paused while collecting
    /// and resumed afterwards unless it was already paused.
    pub async fn snapshot(&self) -> Snapshot {
        let office = &self.services.post_office;
        let was_paused = office.is_paused();
        office.pause();

        // The post office is read first: a delivery still running moves mail
        // from transit into a mailbox, never the other way, so reading the
        // mailboxes afterwards cannot miss it.
        let undelivered = office.undelivered().await;

        let mut snapshot = Snapshot::new();
        for slot in &self.agents {
            let in_flight = slot.mailbox.in_flight().await.map(|m| m.id);
            snapshot.agents.insert(
                slot.runtime.name().to_string(),
                AgentSnapshot {
                    mailbox: slot.mailbox.contents().await,
                    extra_state: json!({ "in_flight": in_flight }),
                },
            );
        }

        // Mail delivered between the two reads is already recorded in its
        // mailbox.
        snapshot.broker_undelivered = undelivered
            .into_iter()
            .filter(|msg| {
                !snapshot
                    .agents
                    .get(&msg.recipient)
                    .map(|a| a.mailbox.iter().any(|m| m.id == msg.id))
                    .unwrap_or(false)
            })
            .collect();

        if !was_paused {
            office.resume();
        }
        info!(messages = snapshot.message_count(), "Snapshot taken");
        snapshot
    }

    pub async fn save_snapshot(&self, path: &Path) -> Result<Snapshot> {
        let snapshot = self.snapshot().await;
        snapshot.save(path).await?;
        Ok(snapshot)
    }

    /// Refill mailboxes and the post office queue from `snapshot`. Must run
    /// before [`start`]. Mail of agents that no longer exist goes back to the
    /// post office, which drops and audits it on delivery.
    ///
    /// [`start`]: Supervisor::start
    pub async fn restore(&self, snapshot: Snapshot) -> Result<usize> {
        if self.is_running() {
            return Err(Error::Other(
                "snapshot restore must happen before start".to_string(),
            ));
        }
        let restored = snapshot.message_count();
        let mut orphaned = Vec::new();
        for (name, agent) in snapshot.agents {
            match self.agents.iter().find(|a| a.runtime.name() == name) {
                Some(slot) => slot.mailbox.restore(agent.mailbox).await,
                None => {
                    warn!(agent = %name, messages = agent.mailbox.len(), "Snapshot names an unknown agent");
                    orphaned.extend(agent.mailbox);
                }
            }
        }
        let mut undelivered = snapshot.broker_undelivered;
        undelivered.extend(orphaned);
        self.services.post_office.restore_undelivered(undelivered).await;
        info!(messages = restored, "Snapshot restored");
        Ok(restored)
    }

    pub async fn restore_from_file(&self, path: &Path) -> Result<usize> {
        let snapshot = Snapshot::load(path).await?;
        self.restore(snapshot).await
    }

    /// Signal every task to stop, wait up to the grace period for each, abort
    /// the stragglers, then snapshot whatever mail is left to the default
    /// snapshot file.
    pub async fn shutdown(mut self) -> Result<Snapshot> {
        info!("Supervisor shutting down");
        let _ = self.shutdown_tx.send(());
        let grace = Duration::from_secs(self.config.runtime.shutdown_grace_secs);

        for (name, mut handle) in self.handles.drain(..) {
            match tokio::time::timeout(grace, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(task = %name, error = %e, "Task ended abnormally"),
                Err(_) => {
                    warn!(task = %name, grace_secs = grace.as_secs(), "Task did not stop in time, aborting");
                    handle.abort();
                    let _ = handle.await;
                }
            }
        }

        let snapshot = self.snapshot().await;
        snapshot.save(&self.paths.snapshot_file()).await?;
        info!("Supervisor stopped");
        Ok(snapshot)
    }
}

/// The capabilities an agent is composed from. An empty list in the profile
/// means every registered capability except the sub-task finish signal.
fn agent_capabilities(
    registry: &CapabilityRegistry,
    profile: &AgentProfile,
    micro_finish: &str,
) -> Result<CapabilityRegistry> {
    if profile.capabilities.is_empty() {
        Ok(registry.without(&[micro_finish]))
    } else {
        registry.subset(&profile.capabilities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::testing::ScriptedProvider;
    use async_trait::async_trait;
    use courier_core::types::{BrainReply, ChatMessage};
    use tempfile::TempDir;

    /// A backend that never answers.
    struct StalledProvider;

    #[async_trait]
    impl Provider for StalledProvider {
        async fn chat(&self, _messages: &[ChatMessage]) -> Result<BrainReply> {
            std::future::pending().await
        }

        fn endpoint(&self) -> String {
            "stalled://brain".to_string()
        }

        async fn probe(&self) -> Result<()> {
            Ok(())
        }
    }

    fn profile(name: &str, capabilities: &[&str]) -> AgentProfile {
        AgentProfile {
            name: name.to_string(),
            description: format!("{} agent", name),
            persona: String::new(),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            max_steps: None,
            mailbox_capacity: None,
        }
    }

    fn config(dir: &TempDir, agents: Vec<AgentProfile>) -> Config {
        let mut config = Config::default();
        config.storage_root = Some(dir.path().to_string_lossy().to_string());
        config.agents = agents;
        config.runtime.shutdown_grace_secs = 0;
        config.runtime.idle_timeout_secs = 1;
        config
    }

    fn ids(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|m| m.id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_default_capabilities_exclude_micro_finish() {
        let dir = TempDir::new().unwrap();
        let provider: Arc<dyn Provider> = ScriptedProvider::new("brain", &[]);
        let supervisor = Supervisor::assemble(
            config(&dir, vec![profile("Coder", &[]), profile("Mailer", &["send_message"])]),
            provider.clone(),
            provider,
            CapabilityRegistry::with_builtins(),
        )
        .await
        .unwrap();

        let coder = &supervisor.agents[0].runtime;
        assert!(coder.capabilities().contains("delegate"));
        assert!(!coder.capabilities().contains("all_finished"));
        assert_eq!(supervisor.agents[1].runtime.capabilities().names(), vec!["send_message"]);
    }

    #[tokio::test]
    async fn test_unknown_capability_rejected() {
        let dir = TempDir::new().unwrap();
        let provider: Arc<dyn Provider> = ScriptedProvider::new("brain", &[]);
        let result = Supervisor::assemble(
            config(&dir, vec![profile("Coder", &["teleport"])]),
            provider.clone(),
            provider,
            CapabilityRegistry::with_builtins(),
        )
        .await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_reply_reaches_user() {
        let dir = TempDir::new().unwrap();
        let brain: Arc<dyn Provider> = ScriptedProvider::new(
            "brain",
            &["I will answer.\nACTION: send_message"],
        );
        let cerebellum: Arc<dyn Provider> = ScriptedProvider::new(
            "cerebellum",
            &[r#"{"decision": "ready", "params": {"to": "User", "subject": "re", "body": "hello"}}"#],
        );
        let mut supervisor = Supervisor::assemble(
            config(&dir, vec![profile("Coder", &[])]),
            brain,
            cerebellum,
            CapabilityRegistry::with_builtins(),
        )
        .await
        .unwrap();
        let user = supervisor.register_external("User", "the operator").await;
        supervisor.start();

        let question = Message::new("User", "Coder", "hi", "say hello").with_id("M1");
        supervisor.send(question).await;

        let reply = user.recv_timeout(Duration::from_secs(2)).await.unwrap();
        user.complete().await;
        assert_eq!(reply.sender, "Coder");
        assert_eq!(reply.body, "hello");
        assert_eq!(reply.correlation_id.as_deref(), Some("M1"));

        // The reply leaves before Coder marks M1 complete.
        let coder = supervisor.post_office().mailbox("Coder").await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while coder.in_flight().await.is_some() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let snapshot = supervisor.shutdown().await.unwrap();
        assert_eq!(snapshot.message_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_snapshot_and_restore() {
        let dir = TempDir::new().unwrap();
        let stalled: Arc<dyn Provider> = Arc::new(StalledProvider);
        let mut supervisor = Supervisor::assemble(
            config(&dir, vec![profile("Coder", &[])]),
            stalled.clone(),
            stalled.clone(),
            CapabilityRegistry::with_builtins(),
        )
        .await
        .unwrap();
        supervisor.start();

        for id in ["M1", "M2", "M3"] {
            supervisor
                .send(Message::new("User", "Coder", "", id).with_id(id))
                .await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let live = supervisor.snapshot().await;
        assert_eq!(ids(&live.agents["Coder"].mailbox), vec!["M1", "M2", "M3"]);
        assert_eq!(live.agents["Coder"].extra_state["in_flight"], "M1");
        assert!(!supervisor.post_office().is_paused());

        let snapshot_file = supervisor.paths().snapshot_file();
        let stopped = supervisor.shutdown().await.unwrap();
        assert_eq!(ids(&stopped.agents["Coder"].mailbox), vec!["M1", "M2", "M3"]);
        assert_eq!(Snapshot::load(&snapshot_file).await.unwrap(), stopped);

        let revived = Supervisor::assemble(
            config(&dir, vec![profile("Coder", &[])]),
            stalled.clone(),
            stalled,
            CapabilityRegistry::with_builtins(),
        )
        .await
        .unwrap();
        assert_eq!(revived.restore_from_file(&snapshot_file).await.unwrap(), 3);
        let mailbox = revived.post_office().mailbox("Coder").await.unwrap();
        assert_eq!(ids(&mailbox.contents().await), vec!["M1", "M2", "M3"]);
    }

    #[tokio::test]
    async fn test_live_snapshot_covers_full_mailbox_and_transit() {
        let dir = TempDir::new().unwrap();
        let stalled: Arc<dyn Provider> = Arc::new(StalledProvider);
        let mut coder = profile("Coder", &[]);
        coder.mailbox_capacity = Some(1);
        let mut supervisor = Supervisor::assemble(
            config(&dir, vec![coder]),
            stalled.clone(),
            stalled,
            CapabilityRegistry::with_builtins(),
        )
        .await
        .unwrap();
        supervisor.start();

        for id in ["M1", "M2", "M3", "M4"] {
            supervisor
                .send(Message::new("User", "Coder", "", id).with_id(id))
                .await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let snapshot = supervisor.snapshot().await;
        let mut seen = ids(&snapshot.agents["Coder"].mailbox);
        seen.extend(ids(&snapshot.broker_undelivered));
        assert_eq!(seen, vec!["M1", "M2", "M3", "M4"]);
        assert_eq!(snapshot.agents["Coder"].extra_state["in_flight"], "M1");

        let stopped = supervisor.shutdown().await.unwrap();
        assert_eq!(stopped.message_count(), 4);
    }

    #[tokio::test]
    async fn test_restore_routes_orphaned_mail_to_post_office() {
        let dir = TempDir::new().unwrap();
        let provider: Arc<dyn Provider> = ScriptedProvider::new("brain", &[]);
        let mut supervisor = Supervisor::assemble(
            config(&dir, vec![profile("Coder", &[])]),
            provider.clone(),
            provider,
            CapabilityRegistry::with_builtins(),
        )
        .await
        .unwrap();

        let mut snapshot = Snapshot::new();
        snapshot.agents.insert(
            "Retired".to_string(),
            AgentSnapshot {
                mailbox: vec![Message::new("User", "Retired", "", "late").with_id("X1")],
                extra_state: json!({}),
            },
        );
        snapshot.broker_undelivered = vec![Message::new("User", "Coder", "", "queued").with_id("Q1")];
        assert_eq!(supervisor.restore(snapshot.clone()).await.unwrap(), 2);
        assert_eq!(ids(&supervisor.post_office().undelivered().await), vec!["Q1", "X1"]);

        supervisor.start();
        assert!(matches!(supervisor.restore(snapshot).await, Err(Error::Other(_))));
        supervisor.shutdown().await.unwrap();
    }
}
