//! Cloud network load balancer backend
//!
//! Publishes the cluster behind a managed layer-4 load balancer: one
//! listener forwards port 443 to the API target group, another forwards
//! port 22 to a single-machine SSH target group. All calls against the
//! cloud API go through the [`LoadBalancerClient`] seam, which a real
//! deployment backs with the provider SDK and tests back with a mock.
//!
//! Every operation is find-before-create, so a crashed run can be
//! repeated and converges on the same resources.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{LoadBalancerConfig, ServiceEndpoint, SshEndpoint};
use crate::error::{Error, Result};
use crate::model::{Cluster, Machine};
use crate::retry::{poll_until, Poll};
use crate::roles::MachineRole;
use crate::status::ClusterStatus;

use super::{api_service_id, ssh_service_id, NatProvisioner, API_PORT, SSH_PORT};

#[cfg(test)]
use mockall::automock;

/// A provisioned load balancer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadBalancer {
    /// Opaque provider id
    pub id: String,
    /// Public DNS name clients connect to
    pub dns_name: String,
}

/// Provisioning state reported by the cloud provider
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoadBalancerState {
    Provisioning,
    Active,
    Failed(String),
}

/// The slice of a cloud provider's load-balancer API this backend uses
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LoadBalancerClient: Send + Sync {
    async fn find_load_balancer(&self, name: &str) -> Result<Option<LoadBalancer>>;

    async fn create_load_balancer(&self, name: &str, subnet_id: &str) -> Result<LoadBalancer>;

    async fn load_balancer_state(&self, id: &str) -> Result<LoadBalancerState>;

    async fn find_target_group(&self, name: &str) -> Result<Option<String>>;

    /// Create a TCP target group; health checks probe `health_check_port`
    /// when nonzero, the traffic port otherwise
    async fn create_target_group(
        &self,
        name: &str,
        vpc_id: &str,
        port: u16,
        health_check_port: u16,
    ) -> Result<String>;

    /// Whether the load balancer already has a listener on `port`
    async fn has_listener(&self, lb_id: &str, port: u16) -> Result<bool>;

    async fn create_listener(&self, lb_id: &str, target_group_id: &str, port: u16) -> Result<()>;

    /// Register a target; registering a present target is a no-op
    async fn register_target(&self, target_group_id: &str, addr: &str, port: u16) -> Result<()>;

    /// Addresses currently registered in the target group
    async fn list_targets(&self, target_group_id: &str) -> Result<Vec<String>>;

    async fn delete_load_balancer(&self, id: &str) -> Result<()>;

    async fn delete_target_group(&self, target_group_id: &str) -> Result<()>;
}

pub struct ElbNat {
    config: LoadBalancerConfig,
    client: Arc<dyn LoadBalancerClient>,
    /// Serializes the list-then-register race for the single SSH slot
    ssh_slot: Arc<Mutex<()>>,
}

impl ElbNat {
    pub fn new(
        config: LoadBalancerConfig,
        client: Arc<dyn LoadBalancerClient>,
        ssh_slot: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            config,
            client,
            ssh_slot,
        }
    }

    async fn ensure_load_balancer(&self, cluster: &Cluster) -> Result<LoadBalancer> {
        if let Some(lb) = self.client.find_load_balancer(&cluster.name).await? {
            debug!(cluster = %cluster.name, lb = %lb.id, "load balancer already exists");
            return Ok(lb);
        }
        self.client
            .create_load_balancer(&cluster.name, &self.config.subnet_id)
            .await
    }

    async fn ensure_target_group(&self, name: &str, port: u16) -> Result<String> {
        if let Some(id) = self.client.find_target_group(name).await? {
            return Ok(id);
        }
        self.client
            .create_target_group(name, &self.config.vpc_id, port, self.config.health_check_port)
            .await
    }

    async fn ensure_listener(&self, lb: &LoadBalancer, target_group: &str, port: u16) -> Result<()> {
        if self.client.has_listener(&lb.id, port).await? {
            return Ok(());
        }
        self.client.create_listener(&lb.id, target_group, port).await
    }

    /// Poll until the load balancer leaves its provisioning state
    async fn wait_until_online(
        &self,
        cancel: &CancellationToken,
        cluster: &Cluster,
        lb: &LoadBalancer,
    ) -> Result<()> {
        poll_until(Duration::from_secs(5), cancel, move || async move {
            match self.client.load_balancer_state(&lb.id).await? {
                LoadBalancerState::Active => Ok(Poll::Ready(())),
                LoadBalancerState::Provisioning => Ok(Poll::Pending),
                LoadBalancerState::Failed(code) => Err(Error::provider_permanent(
                    &cluster.name,
                    "elb",
                    format!("load balancer entered unexpected state {code}"),
                )),
            }
        })
        .await
    }
}

#[async_trait]
impl NatProvisioner for ElbNat {
    async fn ensure_cluster(
        &self,
        cancel: &CancellationToken,
        cluster: &Cluster,
        status: &ClusterStatus,
    ) -> Result<()> {
        let lb = self.ensure_load_balancer(cluster).await?;

        let api_group = self
            .ensure_target_group(&api_service_id(&cluster.name), API_PORT)
            .await?;
        self.ensure_listener(&lb, &api_group, API_PORT).await?;

        let ssh_group = self
            .ensure_target_group(&ssh_service_id(&cluster.name), SSH_PORT)
            .await?;
        self.ensure_listener(&lb, &ssh_group, SSH_PORT).await?;

        self.wait_until_online(cancel, cluster, &lb).await?;

        status.publish_api_endpoint(ServiceEndpoint::new(lb.dns_name.clone(), API_PORT));
        status.publish_bastion(SshEndpoint::direct(lb.dns_name.clone(), SSH_PORT));
        info!(cluster = %cluster.name, dns = %lb.dns_name, "load balancer online");
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
            Error::validation_for(
                &cluster.name,
                format!("machine {} has no internal address", machine.name),
            )
        })?;
        let bastion = status.bastion().cloned().ok_or_else(|| {
            Error::validation_for(&cluster.name, "load balancer not provisioned")
        })?;

        if machine.role.has(MachineRole::CONTROL_PLANE) {
            let api_group = self
                .client
                .find_target_group(&api_service_id(&cluster.name))
                .await?
                .ok_or_else(|| Error::not_found(api_service_id(&cluster.name)))?;
            self.client.register_target(&api_group, addr, API_PORT).await?;
        }

        let ssh_group = self
            .client
            .find_target_group(&ssh_service_id(&cluster.name))
            .await?
            .ok_or_else(|| Error::not_found(ssh_service_id(&cluster.name)))?;

        let _slot = self.ssh_slot.lock().await;
        let registered = self.client.list_targets(&ssh_group).await?;
        let winner = match registered.first() {
            Some(existing) => existing.clone(),
            None => {
                self.client.register_target(&ssh_group, addr, SSH_PORT).await?;
                addr.to_string()
            }
        };

        if winner == addr {
            Ok(bastion)
        } else {
            Ok(SshEndpoint::proxied(addr, SSH_PORT, bastion))
        }
    }

    async fn delete_cluster(&self, _cancel: &CancellationToken, cluster: &Cluster) -> Result<()> {
        if let Some(lb) = self.client.find_load_balancer(&cluster.name).await? {
            self.client.delete_load_balancer(&lb.id).await?;
        }
        for name in [api_service_id(&cluster.name), ssh_service_id(&cluster.name)] {
            if let Some(id) = self.client.find_target_group(&name).await? {
                self.client.delete_target_group(&id).await?;
            }
        }
        info!(cluster = %cluster.name, "load balancer removed");
        Ok(())
    }
}
