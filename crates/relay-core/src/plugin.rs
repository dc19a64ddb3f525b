//! Capability-typed registry of collaborators.
//!
//! Discovery and loading happen elsewhere; the relay only sees trait
//! objects filed under a closed set of capability slots.

use std::{collections::BTreeMap, fmt, sync::Arc};

use thiserror::Error;

use crate::{AgentEngine, ChannelAdapter, MemoryStore, Skill};

/// Capability slot a plugin fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    Channel,
    Skill,
    Provider,
    Memory,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Channel => "channel",
            Self::Skill => "skill",
            Self::Provider => "provider",
            Self::Memory => "memory",
        };
        f.write_str(name)
    }
}

/// A collaborator filed under its capability.
#[derive(Clone)]
pub enum Plugin {
    Channel(Arc<dyn ChannelAdapter>),
    Skill(Arc<dyn Skill>),
    Provider(Arc<dyn AgentEngine>),
    Memory(Arc<dyn MemoryStore>),
}

impl Plugin {
    /// Slot this plugin belongs to.
    #[must_use]
    pub const fn capability(&self) -> Capability {
        match self {
            Self::Channel(_) => Capability::Channel,
            Self::Skill(_) => Capability::Skill,
            Self::Provider(_) => Capability::Provider,
            Self::Memory(_) => Capability::Memory,
        }
    }
}

/// Registry error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Duplicate {capability} plugin: {name}")]
    Duplicate { capability: Capability, name: String },
}

/// Registry of plugins keyed by capability and name.
#[derive(Default)]
pub struct PluginRegistry {
    slots: BTreeMap<(Capability, String), Plugin>,
}

impl PluginRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin under `name`.
    ///
    /// # Errors
    /// Returns error if the slot already holds a plugin with that name.
    pub fn register(&mut self, name: impl Into<String>, plugin: Plugin) -> Result<(), RegistryError> {
        let name = name.into();
        let slot = (plugin.capability(), name);
        if self.slots.contains_key(&slot) {
            return Err(RegistryError::Duplicate {
                capability: slot.0,
                name: slot.1,
            });
        }
        tracing::debug!(capability = %slot.0, name = %slot.1, "Plugin registered");
        self.slots.insert(slot, plugin);
        Ok(())
    }

    /// Names registered under a capability, sorted.
    #[must_use]
    pub fn names(&self, capability: Capability) -> Vec<&str> {
        self.slots
            .keys()
            .filter(|(c, _)| *c == capability)
            .map(|(_, name)| name.as_str())
            .collect()
    }

    fn get(&self, capability: Capability, name: &str) -> Option<&Plugin> {
        self.slots.get(&(capability, name.to_owned()))
    }

    /// Look up a provider (agent engine).
    #[must_use]
    pub fn provider(&self, name: &str) -> Option<Arc<dyn AgentEngine>> {
        match self.get(Capability::Provider, name)? {
            Plugin::Provider(engine) => Some(Arc::clone(engine)),
            _ => None,
        }
    }

    /// Look up a memory store.
    #[must_use]
    pub fn memory(&self, name: &str) -> Option<Arc<dyn MemoryStore>> {
        match self.get(Capability::Memory, name)? {
            Plugin::Memory(store) => Some(Arc::clone(store)),
            _ => None,
        }
    }

    /// All registered channels.
    #[must_use]
    pub fn channels(&self) -> Vec<Arc<dyn ChannelAdapter>> {
        self.slots
            .values()
            .filter_map(|plugin| match plugin {
                Plugin::Channel(channel) => Some(Arc::clone(channel)),
                _ => None,
            })
            .collect()
    }

    /// All registered skills.
    #[must_use]
    pub fn skills(&self) -> Vec<Arc<dyn Skill>> {
        self.slots
            .values()
            .filter_map(|plugin| match plugin {
                Plugin::Skill(skill) => Some(Arc::clone(skill)),
                _ => None,
            })
            .collect()
    }
}
