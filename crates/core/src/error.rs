use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A model backend could not be reached (network failure, timeout, 429/5xx).
    /// Callers wait on the health gate and retry instead of surfacing this to the agent.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Unknown capability: {0}")]
    HallucinatedCapability(String),

    #[error("Negotiation exhausted for capability: {0}")]
    NegotiationExhausted(String),

    #[error("Capability '{name}' failed: {reason}")]
    CapabilityExecution { name: String, reason: String },

    #[error("Budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Snapshot corrupted: {0}")]
    SnapshotCorruption(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn capability(name: &str, reason: impl std::fmt::Display) -> Self {
        Error::CapabilityExecution {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn is_backend_unavailable(&self) -> bool {
        matches!(self, Error::BackendUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
