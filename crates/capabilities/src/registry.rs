use courier_core::{CapabilityDefinition, Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::delegate::DelegateCapability;
use crate::finish::{AllFinishedCapability, FinishTaskCapability};
use crate::mail::SendMessageCapability;
use crate::remember::RememberCapability;
use crate::Capability;

/// Name-indexed table of capabilities. Each agent gets its own subset.
#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    capabilities: HashMap<String, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SendMessageCapability));
        registry.register(Arc::new(FinishTaskCapability));
        registry.register(Arc::new(AllFinishedCapability));
        registry.register(Arc::new(RememberCapability));
        registry.register(Arc::new(DelegateCapability));
        registry
    }

    pub fn register(&mut self, capability: Arc<dyn Capability>) {
        let name = capability.definition().name;
        debug!(name = %name, "Registering capability");
        self.capabilities.insert(name, capability);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Capability>> {
        self.capabilities.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.capabilities.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    /// Sorted, so prompts are stable.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.capabilities.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn definitions(&self) -> Vec<CapabilityDefinition> {
        self.names()
            .iter()
            .filter_map(|n| self.capabilities.get(n))
            .map(|c| c.definition())
            .collect()
    }

    /// A registry restricted to `names`. Unknown names are a configuration error.
    pub fn subset(&self, names: &[String]) -> Result<Self> {
        let mut out = Self::new();
        for name in names {
            let cap = self
                .capabilities
                .get(name)
                .ok_or_else(|| Error::Config(format!("unknown capability '{}'", name)))?;
            out.capabilities.insert(name.clone(), cap.clone());
        }
        Ok(out)
    }

    /// Copy with `names` removed.
    pub fn without(&self, names: &[&str]) -> Self {
        let mut out = self.clone();
        for name in names {
            out.capabilities.remove(*name);
        }
        out
    }

    /// The capability list shown in system prompts.
    pub fn catalogue(&self) -> String {
        self.definitions()
            .iter()
            .map(|d| d.prompt_line())
            .collect::<Vec<_>>()
            .join("\n")
    }
}
