//! Network address translation backends
//!
//! A cluster's machines sit on a private network; NAT provisioning is what
//! makes the Kubernetes API and SSH reachable from outside. Two real
//! backends exist, IPVS forwarding on a bastion host ([`lvs`]) and a cloud
//! network load balancer ([`elb`]), plus a pass-through for clusters whose
//! machines are directly routable.
//!
//! Dispatch over [`NatConfig`] is exhaustive: a new variant fails to
//! compile until every call site handles it.

pub mod elb;
pub mod lvs;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::{NatConfig, ServiceEndpoint, SshEndpoint};
use crate::error::Result;
use crate::model::{Cluster, Machine};
use crate::roles::MachineRole;
use crate::shell::ShellClient;
use crate::status::ClusterStatus;

use self::elb::{ElbNat, LoadBalancerClient};
use self::lvs::LvsNat;

/// Port the Kubernetes API is published on
pub const API_PORT: u16 = 443;
/// Port SSH is forwarded to
pub const SSH_PORT: u16 = 22;

/// Forwarding id of a cluster's API service
pub fn api_service_id(cluster_name: &str) -> String {
    format!("{cluster_name}-api")
}

/// Forwarding id of a cluster's SSH service
pub fn ssh_service_id(cluster_name: &str) -> String {
    format!("{cluster_name}-ssh")
}

/// One NAT backend
///
/// `ensure_cluster` runs once per reconcile, before any machine pipeline,
/// and publishes the cluster's API endpoint (and bastion hop, when the
/// backend has one) into the shared status. `register_machine` runs from
/// each machine pipeline once the machine's internal address is known and
/// returns how that machine is reached over SSH. `delete_cluster` tears
/// the forwarding down and must succeed when nothing was ever created.
#[async_trait]
pub trait NatProvisioner: Send + Sync {
    async fn ensure_cluster(
        &self,
        cancel: &CancellationToken,
        cluster: &Cluster,
        status: &ClusterStatus,
    ) -> Result<()>;

    async fn register_machine(
        &self,
        cancel: &CancellationToken,
        cluster: &Cluster,
        status: &ClusterStatus,
        machine: &Machine,
    ) -> Result<SshEndpoint>;

    async fn delete_cluster(&self, cancel: &CancellationToken, cluster: &Cluster) -> Result<()>;
}

/// Constructs the provisioner matching a cluster's NAT configuration
#[derive(Clone)]
pub struct NatProvisioners {
    shell: Arc<dyn ShellClient>,
    load_balancer: Arc<dyn LoadBalancerClient>,
    /// One SSH forwarding slot per reconciliation, shared across every
    /// machine pipeline regardless of which backend instance it uses
    ssh_slot: Arc<tokio::sync::Mutex<()>>,
}

impl NatProvisioners {
    pub fn new(shell: Arc<dyn ShellClient>, load_balancer: Arc<dyn LoadBalancerClient>) -> Self {
        Self {
            shell,
            load_balancer,
            ssh_slot: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn for_config(&self, nat: &NatConfig) -> Box<dyn NatProvisioner> {
        match nat {
            NatConfig::Lvs(config) => {
                Box::new(LvsNat::new(config.clone(), Arc::clone(&self.shell)))
            }
            NatConfig::LoadBalancer(config) => Box::new(ElbNat::new(
                config.clone(),
                Arc::clone(&self.load_balancer),
                Arc::clone(&self.ssh_slot),
            )),
            NatConfig::None => Box::new(DirectNat),
        }
    }
}

/// Pass-through backend for directly routable machines
///
/// The first control-plane machine to register publishes the API endpoint
/// at its own internal address; every machine is reached over SSH
/// directly.
pub struct DirectNat;

#[async_trait]
impl NatProvisioner for DirectNat {
    async fn ensure_cluster(
        &self,
        _cancel: &CancellationToken,
        _cluster: &Cluster,
        _status: &ClusterStatus,
    ) -> Result<()> {
        Ok(())
    }

    async fn register_machine(
        &self,
        _cancel: &CancellationToken,
        cluster: &Cluster,
        status: &ClusterStatus,
        machine: &Machine,
    ) -> Result<SshEndpoint> {
        let addr = machine.status.ip_addr().ok_or_else(|| {
            crate::error::Error::validation_for(
                &cluster.name,
                format!("machine {} has no internal address", machine.name),
            )
        })?;
        if machine.role.has(MachineRole::CONTROL_PLANE) {
            status.publish_api_endpoint(ServiceEndpoint::new(addr, API_PORT));
        }
        Ok(SshEndpoint::direct(addr, SSH_PORT))
    }

    async fn delete_cluster(
        &self,
        _cancel: &CancellationToken,
        _cluster: &Cluster,
    ) -> Result<()> {
        Ok(())
    }
}
