use courier_core::types::{BrainReply, ChatMessage};
use courier_core::Result;
use courier_providers::Provider;
use std::sync::Arc;
use tracing::debug;

use crate::health::HealthGate;

/// A model backend reached through the health gate. Used for both the brain
/// and the cerebellum role.
#[derive(Clone)]
pub struct Brain {
    role: &'static str,
    provider: Arc<dyn Provider>,
    gate: Arc<HealthGate>,
}

impl Brain {
    pub fn new(role: &'static str, provider: Arc<dyn Provider>, gate: Arc<HealthGate>) -> Self {
        Self {
            role,
            provider,
            gate,
        }
    }

    pub fn role(&self) -> &'static str {
        self.role
    }

    pub fn endpoint(&self) -> String {
        self.provider.endpoint()
    }

    pub fn provider(&self) -> Arc<dyn Provider> {
        self.provider.clone()
    }

    /// One model call. Backend outages are absorbed by waiting on the gate;
    /// only an exhausted wait surfaces as `BackendUnavailable`.
    pub async fn think(&self, messages: &[ChatMessage]) -> Result<BrainReply> {
        let endpoint = self.provider.endpoint();
        let reply = self
            .gate
            .call(&endpoint, || self.provider.chat(messages))
            .await?;
        debug!(role = self.role, content_len = reply.content.len(), "Model replied");
        Ok(reply)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use async_trait::async_trait;
    use courier_core::config::HealthConfig;
    use courier_core::Error;
    use std::collections::VecDeque;
    use tokio::sync::Mutex;

    /// Replays canned replies in order and records every conversation it saw.
    pub struct ScriptedProvider {
        name: String,
        replies: Mutex<VecDeque<String>>,
        pub seen: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ScriptedProvider {
        pub fn new(name: &str, replies: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
                seen: Mutex::new(Vec::new()),
            })
        }

        pub async fn remaining(&self) -> usize {
            self.replies.lock().await.len()
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        async fn chat(&self, messages: &[ChatMessage]) -> Result<BrainReply> {
            self.seen.lock().await.push(messages.to_vec());
            match self.replies.lock().await.pop_front() {
                Some(r) => Ok(BrainReply::text(&r)),
                None => Err(Error::Provider(format!("{}: script exhausted", self.name))),
            }
        }

        fn endpoint(&self) -> String {
            format!("scripted://{}", self.name)
        }

        async fn probe(&self) -> Result<()> {
            Ok(())
        }
    }

    pub fn open_gate() -> Arc<HealthGate> {
        Arc::new(HealthGate::new(&HealthConfig {
            probe_interval_secs: 1,
            poll_interval_ms: 5,
            log_every: 10,
            max_wait_secs: 1,
        }))
    }

    pub fn scripted(role: &'static str, replies: &[&str]) -> (Brain, Arc<ScriptedProvider>) {
        let provider = ScriptedProvider::new(role, replies);
        (Brain::new(role, provider.clone(), open_gate()), provider)
    }
}
