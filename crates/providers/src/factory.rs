use courier_core::config::BackendConfig;
use courier_core::{Config, Error, Result};
use std::sync::Arc;

use crate::{AnthropicProvider, OpenAIProvider, Provider};

/// Default api_base for the OpenAI-compatible kinds.
fn default_api_base(kind: &str) -> Option<&'static str> {
    match kind {
        "openrouter" => Some("https://openrouter.ai/api/v1"),
        "openai" => Some("https://api.openai.com/v1"),
        "deepseek" => Some("https://api.deepseek.com/v1"),
        "groq" => Some("https://api.groq.com/openai/v1"),
        "vllm" | "local" => Some("http://localhost:8000/v1"),
        _ => None,
    }
}

/// Infer the backend kind from the model string prefix.
pub fn infer_kind_from_model(model: &str) -> Option<&'static str> {
    if model.starts_with("anthropic/") || model.starts_with("claude-") {
        Some("anthropic")
    } else if model.starts_with("openai/")
        || model.starts_with("gpt-")
        || model.starts_with("o1")
        || model.starts_with("o3")
    {
        Some("openai")
    } else if model.starts_with("deepseek") {
        Some("deepseek")
    } else if model.starts_with("groq/") {
        Some("groq")
    } else {
        None
    }
}

/// Build one backend. An explicit `kind` wins over the model prefix; models
/// nobody recognizes are assumed to sit behind an OpenAI-compatible server.
pub fn create_provider(cfg: &BackendConfig) -> Result<Arc<dyn Provider>> {
    let kind = if !cfg.kind.trim().is_empty() {
        cfg.kind.trim()
    } else {
        infer_kind_from_model(&cfg.model).unwrap_or("openai")
    };

    match kind {
        "anthropic" => Ok(Arc::new(AnthropicProvider::new(cfg))),
        other => {
            let base = default_api_base(other).ok_or_else(|| {
                Error::Config(format!("unknown backend kind '{}'", other))
            })?;
            let mut resolved = cfg.clone();
            if resolved.api_base.is_none() {
                resolved.api_base = Some(base.to_string());
            }
            Ok(Arc::new(OpenAIProvider::new(&resolved)))
        }
    }
}

fn role_backend<'a>(config: &'a Config, role: &str, backend: &str) -> Result<&'a BackendConfig> {
    config.backends.get(backend).ok_or_else(|| {
        Error::Config(format!("role '{}' refers to unknown backend '{}'", role, backend))
    })
}

pub fn create_brain_provider(config: &Config) -> Result<Arc<dyn Provider>> {
    create_provider(role_backend(config, "brain", &config.roles.brain)?)
}

pub fn create_cerebellum_provider(config: &Config) -> Result<Arc<dyn Provider>> {
    create_provider(role_backend(config, "cerebellum", config.roles.cerebellum())?)
}
