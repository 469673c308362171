use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::paths::Paths;

/// One physical model-serving backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    /// `openai` (any OpenAI-compatible server) or `anthropic`. Inferred from the
    /// model name when empty.
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default)]
    pub api_key: String,
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub proxy: Option<String>,
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_temperature() -> f32 {
    0.7
}

fn default_timeout_secs() -> u64 {
    120
}

/// Which backend plays which role.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RolesConfig {
    pub brain: String,
    /// Falls back to the brain backend when unset.
    #[serde(default)]
    pub cerebellum: Option<String>,
}

impl RolesConfig {
    pub fn cerebellum(&self) -> &str {
        self.cerebellum.as_deref().unwrap_or(&self.brain)
    }
}

/// A named agent and the capability set it is composed from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentProfile {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub persona: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub max_steps: Option<u32>,
    #[serde(default)]
    pub mailbox_capacity: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    /// Wall-clock budget for one inbound message; unlimited when unset.
    #[serde(default)]
    pub max_time_secs: Option<u64>,
    #[serde(default = "default_negotiation_turns")]
    pub negotiation_turns: u32,
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_queue_warn_depth")]
    pub queue_warn_depth: usize,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_micro_max_steps")]
    pub micro_max_steps: u32,
    #[serde(default)]
    pub micro_max_time_secs: Option<u64>,
    #[serde(default = "default_micro_finish_capability")]
    pub micro_finish_capability: String,
}

fn default_max_steps() -> u32 {
    50
}

fn default_negotiation_turns() -> u32 {
    3
}

fn default_mailbox_capacity() -> usize {
    64
}

fn default_idle_timeout_secs() -> u64 {
    30
}

fn default_cache_ttl_secs() -> u64 {
    600
}

fn default_queue_warn_depth() -> usize {
    1000
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

fn default_micro_max_steps() -> u32 {
    15
}

fn default_micro_finish_capability() -> String {
    "all_finished".to_string()
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            max_time_secs: None,
            negotiation_turns: default_negotiation_turns(),
            mailbox_capacity: default_mailbox_capacity(),
            idle_timeout_secs: default_idle_timeout_secs(),
            cache_ttl_secs: default_cache_ttl_secs(),
            queue_warn_depth: default_queue_warn_depth(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            micro_max_steps: default_micro_max_steps(),
            micro_max_time_secs: None,
            micro_finish_capability: default_micro_finish_capability(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthConfig {
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Emit a waiting log line every N polls.
    #[serde(default = "default_log_every")]
    pub log_every: u32,
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,
}

fn default_probe_interval_secs() -> u64 {
    15
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_log_every() -> u32 {
    15
}

fn default_max_wait_secs() -> u64 {
    600
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: default_probe_interval_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            log_every: default_log_every(),
            max_wait_secs: default_max_wait_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub storage_root: Option<String>,
    #[serde(default)]
    pub backends: HashMap<String, BackendConfig>,
    #[serde(default)]
    pub roles: RolesConfig,
    #[serde(default)]
    pub agents: Vec<AgentProfile>,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub health: HealthConfig,
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|h| h.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}

impl Config {
    /// Load from JSON (parsed leniently, comments and trailing commas allowed) or
    /// YAML, chosen by file extension.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        let config: Config = if is_yaml {
            serde_yaml::from_str(&content)?
        } else {
            json5::from_str(&content)
                .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject configurations the runtime cannot boot with.
    pub fn validate(&self) -> Result<()> {
        if self.roles.brain.is_empty() {
            return Err(Error::Config("roles.brain is not set".to_string()));
        }
        for (role, backend) in [("brain", self.roles.brain.as_str()), ("cerebellum", self.roles.cerebellum())] {
            if !self.backends.contains_key(backend) {
                return Err(Error::Config(format!(
                    "role '{}' refers to unknown backend '{}'",
                    role, backend
                )));
            }
        }
        let mut seen = HashSet::new();
        for agent in &self.agents {
            if agent.name.trim().is_empty() {
                return Err(Error::Config("agent with empty name".to_string()));
            }
            if !seen.insert(agent.name.as_str()) {
                return Err(Error::Config(format!("duplicate agent '{}'", agent.name)));
            }
        }
        if self.runtime.max_steps == 0 {
            return Err(Error::Config("runtime.maxSteps must be positive".to_string()));
        }
        if self.runtime.mailbox_capacity == 0 {
            return Err(Error::Config("runtime.mailboxCapacity must be positive".to_string()));
        }
        Ok(())
    }

    pub fn paths(&self) -> Paths {
        match self.storage_root.as_deref() {
            Some(root) if !root.trim().is_empty() => Paths::with_base(expand_home(root.trim())),
            _ => Paths::new(),
        }
    }

    pub fn brain_backend(&self) -> Option<&BackendConfig> {
        self.backends.get(&self.roles.brain)
    }

    pub fn cerebellum_backend(&self) -> Option<&BackendConfig> {
        self.backends.get(self.roles.cerebellum())
    }

    pub fn agent(&self, name: &str) -> Option<&AgentProfile> {
        self.agents.iter().find(|a| a.name == name)
    }
}
