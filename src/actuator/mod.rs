//! Lifecycle actuators
//!
//! Actuators carry the provider-specific reconcile and delete logic for
//! clusters and machines. The orchestrators drive them: the cluster
//! actuator runs once up front, then one machine-actuator pipeline runs
//! per machine, concurrently. All state an actuator needs arrives through
//! its parameters.

pub mod cluster;
pub mod machine;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::model::{Cluster, Machine};
use crate::status::ClusterStatus;

#[cfg(test)]
use mockall::automock;

/// Provider group of the built-in virtual-machine actuators
pub const VM_PROVIDER_GROUP: &str = "vm";

/// Reconciles cluster-scoped state
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterActuator: Send + Sync {
    /// Bring cluster-wide resources to their desired state. Runs before
    /// any machine pipeline and may mutate the cluster record.
    async fn reconcile(
        &self,
        cancel: &CancellationToken,
        cluster: &mut Cluster,
        status: &ClusterStatus,
    ) -> Result<()>;

    /// Tear down cluster-wide resources. Must succeed when nothing was
    /// ever created.
    async fn delete(&self, cancel: &CancellationToken, cluster: &Cluster) -> Result<()>;
}

/// Reconciles one machine
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MachineActuator: Send + Sync {
    /// Drive the machine through its provisioning pipeline
    async fn reconcile(
        &self,
        cancel: &CancellationToken,
        cluster: &Cluster,
        status: &ClusterStatus,
        machine: &mut Machine,
    ) -> Result<()>;

    /// Tear the machine down. Must succeed when the machine was never
    /// created.
    async fn delete(
        &self,
        cancel: &CancellationToken,
        cluster: &Cluster,
        machine: &Machine,
    ) -> Result<()>;
}

/// The actuator pair registered for one provider group
#[derive(Clone)]
pub struct ActuatorSet {
    pub cluster: Arc<dyn ClusterActuator>,
    pub machine: Arc<dyn MachineActuator>,
}
