//! Shared in-flight cluster state
//!
//! [`ClusterStatus`] is created once per reconcile and shared by reference
//! across every concurrently running machine pipeline. It is deliberately
//! not `Clone`: all parties must observe the same cells and gates.

use std::sync::{Arc, OnceLock};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::{ServiceEndpoint, SshEndpoint};
use crate::error::{Error, Result};
use crate::gate::Gate;

#[derive(Debug, Default)]
pub struct ClusterStatus {
    /// Won by the machine pipeline that bootstraps the control plane
    pub control_plane: Gate,
    /// Serializes read-then-write edits to the cluster's ssh config file
    pub ssh_config: Mutex<()>,
    image_id: OnceLock<String>,
    api_endpoint: OnceLock<ServiceEndpoint>,
    bastion: OnceLock<SshEndpoint>,
    join_command: OnceLock<String>,
}

impl ClusterStatus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record the provider id of the cluster's machine image. First write
    /// wins; later identical publications are ignored.
    pub fn publish_image_id(&self, id: impl Into<String>) {
        let _ = self.image_id.set(id.into());
    }

    pub fn image_id(&self) -> Option<&str> {
        self.image_id.get().map(String::as_str)
    }

    /// Record the published Kubernetes API endpoint
    pub fn publish_api_endpoint(&self, endpoint: ServiceEndpoint) {
        let _ = self.api_endpoint.set(endpoint);
    }

    pub fn api_endpoint(&self) -> Option<&ServiceEndpoint> {
        self.api_endpoint.get()
    }

    /// Record the ssh endpoint machines without their own forward hop
    /// through
    pub fn publish_bastion(&self, endpoint: SshEndpoint) {
        let _ = self.bastion.set(endpoint);
    }

    pub fn bastion(&self) -> Option<&SshEndpoint> {
        self.bastion.get()
    }

    /// Record the kubeadm join command produced by the bootstrap owner
    pub fn publish_join_command(&self, command: impl Into<String>) {
        let _ = self.join_command.set(command.into());
    }

    /// The join command, available only once the control plane is online
    ///
    /// This is the narrow window non-owner pipelines get into the owner's
    /// results: wait for the online gate, then read the command.
    pub async fn join_command(&self, cancel: &CancellationToken) -> Result<String> {
        self.control_plane.wait_ready(cancel).await?;
        self.join_command
            .get()
            .cloned()
            .ok_or_else(|| Error::not_found("kubeadm join command"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn story_join_command_becomes_visible_when_control_plane_is_online() {
        let status = ClusterStatus::new();
        let cancel = CancellationToken::new();

        let waiter = {
            let status = Arc::clone(&status);
            let cancel = cancel.clone();
            tokio::spawn(async move { status.join_command(&cancel).await })
        };

        status.publish_join_command("kubeadm join 10.0.0.1:443 --token t");
        status.control_plane.signal_ready();

        let command = waiter.await.unwrap().unwrap();
        assert!(command.starts_with("kubeadm join"));
    }

    #[test]
    fn test_first_publication_wins() {
        let status = ClusterStatus::new();
        status.publish_image_id("image-1");
        status.publish_image_id("image-2");
        assert_eq!(status.image_id(), Some("image-1"));
    }

    #[tokio::test]
    async fn test_missing_join_command_after_online_is_not_found() {
        let status = ClusterStatus::new();
        status.control_plane.signal_ready();
        let err = status
            .join_command(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
