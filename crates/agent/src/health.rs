use chrono::{DateTime, Utc};
use courier_core::config::HealthConfig;
use courier_core::{Error, Result};
use courier_providers::Provider;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub healthy: bool,
    pub last_error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// Process-wide availability flag for the model backends.
///
/// The gate is open only while every known backend is healthy. Callers that
/// hit an unavailable backend close it for that endpoint and poll until the
/// [`BackendMonitor`] reopens it.
pub struct HealthGate {
    available: AtomicBool,
    backends: RwLock<HashMap<String, BackendStatus>>,
    poll_interval: Duration,
    log_every: u32,
    max_wait: Duration,
}

impl HealthGate {
    pub fn new(cfg: &HealthConfig) -> Self {
        Self {
            available: AtomicBool::new(true),
            backends: RwLock::new(HashMap::new()),
            poll_interval: Duration::from_millis(cfg.poll_interval_ms.max(1)),
            log_every: cfg.log_every.max(1),
            max_wait: Duration::from_secs(cfg.max_wait_secs),
        }
    }

    pub fn is_open(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub async fn statuses(&self) -> HashMap<String, BackendStatus> {
        self.backends.read().await.clone()
    }

    async fn set_status(&self, endpoint: &str, healthy: bool, last_error: Option<String>) {
        let mut backends = self.backends.write().await;
        backends.insert(
            endpoint.to_string(),
            BackendStatus {
                healthy,
                last_error,
                checked_at: Utc::now(),
            },
        );
        let open = backends.values().all(|s| s.healthy);
        let was_open = self.available.swap(open, Ordering::SeqCst);
        if was_open && !open {
            warn!(endpoint = %endpoint, "Health gate closed");
        } else if !was_open && open {
            info!("Health gate reopened, all backends healthy");
        }
    }

    /// Gate state is written by [`BackendMonitor`] only.
    pub(crate) async fn mark_healthy(&self, endpoint: &str) {
        self.set_status(endpoint, true, None).await;
    }

    pub(crate) async fn mark_unhealthy(&self, endpoint: &str, error: &str) {
        self.set_status(endpoint, false, Some(error.to_string())).await;
    }

    /// Block until the gate is open, polling at the configured interval.
    ///
    /// Fails with [`Error::BackendUnavailable`] once the maximum wait elapses.
    pub async fn wait_until_open(&self) -> Result<()> {
        let started = Instant::now();
        let mut polls: u32 = 0;
        while !self.is_open() {
            if started.elapsed() >= self.max_wait {
                return Err(Error::BackendUnavailable(format!(
                    "backends still unavailable after {}s",
                    self.max_wait.as_secs()
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
            polls += 1;
            if polls % self.log_every == 0 {
                info!(
                    waited_secs = started.elapsed().as_secs(),
                    "Waiting for model backends to recover"
                );
            }
        }
        Ok(())
    }

    /// Run `call` against `endpoint` behind the gate.
    ///
    /// An unavailable backend leaves the gate alone: the caller sleeps one poll
    /// interval, waits for the gate and retries the same call, giving up with
    /// the last error after the maximum wait. Other errors are returned
    /// unchanged.
    pub async fn call<T, F, Fut>(&self, endpoint: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        loop {
            self.wait_until_open().await?;
            match call().await {
                Err(e) if e.is_backend_unavailable() => {
                    if started.elapsed() >= self.max_wait {
                        return Err(e);
                    }
                    warn!(endpoint = %endpoint, error = %e, "Backend call failed, retrying behind the gate");
                    tokio::time::sleep(self.poll_interval).await;
                }
                other => return other,
            }
        }
    }
}

/// Periodically probes every distinct backend endpoint and feeds the gate.
pub struct BackendMonitor {
    gate: Arc<HealthGate>,
    /// One provider per endpoint; roles sharing a backend are probed once.
    providers: BTreeMap<String, Arc<dyn Provider>>,
    interval: Duration,
}

impl BackendMonitor {
    pub fn new(
        gate: Arc<HealthGate>,
        providers: impl IntoIterator<Item = Arc<dyn Provider>>,
        interval: Duration,
    ) -> Self {
        let mut by_endpoint = BTreeMap::new();
        for provider in providers {
            by_endpoint.entry(provider.endpoint()).or_insert(provider);
        }
        Self {
            gate,
            providers: by_endpoint,
            interval,
        }
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    /// Probe every endpoint once. Returns true when all passed.
    pub async fn probe_once(&self) -> bool {
        let mut all_ok = true;
        for (endpoint, provider) in &self.providers {
            match provider.probe().await {
                Ok(()) => {
                    debug!(endpoint = %endpoint, "Backend probe ok");
                    self.gate.mark_healthy(endpoint).await;
                }
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, "Backend probe failed");
                    self.gate.mark_unhealthy(endpoint, &e.to_string()).await;
                    all_ok = false;
                }
            }
        }
        all_ok
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            endpoints = self.providers.len(),
            interval_secs = self.interval.as_secs(),
            "Backend monitor started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    self.probe_once().await;
                }
            }
        }
        info!("Backend monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use courier_core::types::{BrainReply, ChatMessage};
    use std::sync::atomic::AtomicUsize;

    struct Switchable {
        endpoint: String,
        healthy: AtomicBool,
        probes: AtomicUsize,
    }

    impl Switchable {
        fn new(endpoint: &str, healthy: bool) -> Arc<Self> {
            Arc::new(Self {
                endpoint: endpoint.to_string(),
                healthy: AtomicBool::new(healthy),
                probes: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Provider for Switchable {
        async fn chat(&self, _messages: &[ChatMessage]) -> Result<BrainReply> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(BrainReply::text("ok"))
            } else {
                Err(Error::BackendUnavailable("down".to_string()))
            }
        }

        fn endpoint(&self) -> String {
            self.endpoint.clone()
        }

        async fn probe(&self) -> Result<()> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            self.chat(&[]).await.map(|_| ())
        }
    }

    fn fast_config(max_wait_secs: u64) -> HealthConfig {
        HealthConfig {
            probe_interval_secs: 1,
            poll_interval_ms: 5,
            log_every: 3,
            max_wait_secs,
        }
    }

    #[tokio::test]
    async fn test_shared_endpoint_probed_once() {
        let gate = Arc::new(HealthGate::new(&fast_config(1)));
        let backend = Switchable::new("http://local#m", true);
        let brain: Arc<dyn Provider> = backend.clone();
        let cerebellum: Arc<dyn Provider> = backend.clone();
        let monitor = BackendMonitor::new(gate, vec![brain, cerebellum], Duration::from_secs(1));

        assert_eq!(monitor.endpoints(), vec!["http://local#m"]);
        assert!(monitor.probe_once().await);
        assert_eq!(backend.probes.load(Ordering::SeqCst), 1);
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_gate_blocks_callers_until_backends_recover() {
        let gate = Arc::new(HealthGate::new(&fast_config(30)));
        let brain = Switchable::new("brain", false);
        let cerebellum = Switchable::new("cerebellum", false);
        let monitor = BackendMonitor::new(
            gate.clone(),
            vec![brain.clone() as Arc<dyn Provider>, cerebellum.clone() as Arc<dyn Provider>],
            Duration::from_millis(20),
        );
        let (tx, rx) = broadcast::channel(1);
        let monitor_task = tokio::spawn(monitor.run(rx));

        // Two consecutive failed health-check rounds.
        wait_for(|| {
            brain.probes.load(Ordering::SeqCst) >= 2 && cerebellum.probes.load(Ordering::SeqCst) >= 2
        })
        .await;
        assert!(!gate.is_open());
        let statuses = gate.statuses().await;
        assert_eq!(statuses.len(), 2);
        assert!(statuses.values().all(|s| !s.healthy && s.last_error.is_some()));

        let mut callers = Vec::new();
        for _ in 0..3 {
            let gate = gate.clone();
            let brain = brain.clone();
            callers.push(tokio::spawn(async move {
                gate.call("brain", || brain.chat(&[])).await
            }));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(callers.iter().all(|c| !c.is_finished()));

        // One backend back is not enough.
        brain.healthy.store(true, Ordering::SeqCst);
        let seen = cerebellum.probes.load(Ordering::SeqCst);
        wait_for(|| cerebellum.probes.load(Ordering::SeqCst) >= seen + 2).await;
        assert!(!gate.is_open());
        assert!(callers.iter().all(|c| !c.is_finished()));

        cerebellum.healthy.store(true, Ordering::SeqCst);
        wait_for(|| gate.is_open()).await;

        for caller in callers {
            let reply = caller.await.unwrap().unwrap();
            assert_eq!(reply.content, "ok");
        }
        tx.send(()).unwrap();
        monitor_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_transient_failure_retried_without_closing_gate() {
        let gate = HealthGate::new(&fast_config(1));
        let calls = AtomicUsize::new(0);
        let result = gate
            .call("brain", || {
                let attempt = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Err(Error::BackendUnavailable("connection reset".to_string()))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(gate.is_open());
        assert!(gate.statuses().await.is_empty());
    }

    #[tokio::test]
    async fn test_persistent_failure_gives_up_after_max_wait() {
        let gate = HealthGate::new(&fast_config(0));
        let result: Result<()> = gate
            .call("brain", || async { Err(Error::BackendUnavailable("down".to_string())) })
            .await;
        assert!(result.unwrap_err().is_backend_unavailable());
        assert!(gate.is_open());
    }

    #[tokio::test]
    async fn test_wait_gives_up_after_max_wait() {
        let gate = HealthGate::new(&fast_config(0));
        gate.mark_unhealthy("brain", "down").await;
        assert!(gate.wait_until_open().await.unwrap_err().is_backend_unavailable());
    }

    #[tokio::test]
    async fn test_non_availability_errors_pass_through() {
        let gate = HealthGate::new(&fast_config(1));
        let result: Result<()> = gate
            .call("brain", || async { Err(Error::Provider("bad request".to_string())) })
            .await;
        assert!(matches!(result, Err(Error::Provider(_))));
        assert!(gate.is_open());
    }
}
