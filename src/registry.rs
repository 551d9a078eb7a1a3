//! Provider registry
//!
//! Maps a provider group name to the actuator pair that reconciles it.
//! The registry is plain data handed to the orchestrators; nothing is
//! registered through process-global state, so tests wire up registries
//! with mock actuators freely.

use std::collections::HashMap;
use std::sync::Arc;

use crate::actuator::{ActuatorSet, ClusterActuator, MachineActuator};
use crate::error::{Error, Result};

#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, ActuatorSet>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the actuator pair for a provider group, replacing any
    /// earlier registration
    pub fn register(
        &mut self,
        group: impl Into<String>,
        cluster: Arc<dyn ClusterActuator>,
        machine: Arc<dyn MachineActuator>,
    ) -> &mut Self {
        self.providers
            .insert(group.into(), ActuatorSet { cluster, machine });
        self
    }

    /// The actuator pair registered for `group`
    pub fn lookup(&self, group: &str) -> Result<&ActuatorSet> {
        self.providers
            .get(group)
            .ok_or_else(|| Error::not_found(format!("provider group {group:?}")))
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
