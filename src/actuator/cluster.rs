//! Cluster-scoped reconciliation
//!
//! Runs once per reconcile, before the machine pipelines fan out: validate
//! the cluster record, make sure the machine image is available (importing
//! it on first use and reusing the recorded image afterwards), bring the
//! NAT forwarding up, and lay down the cluster's local SSH key files.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::actuator::ClusterActuator;
use crate::error::{Error, Result};
use crate::infra::InfrastructureClient;
use crate::labels;
use crate::model::{Cluster, Machine};
use crate::naming;
use crate::nat::NatProvisioners;
use crate::roles::MachineRole;
use crate::status::ClusterStatus;

pub struct VmClusterActuator {
    infra: Arc<dyn InfrastructureClient>,
    nat: NatProvisioners,
}

impl VmClusterActuator {
    pub fn new(infra: Arc<dyn InfrastructureClient>, nat: NatProvisioners) -> Self {
        Self { infra, nat }
    }

    fn validate(cluster: &Cluster) -> Result<()> {
        naming::validate_name(&cluster.name)?;
        if cluster.machines.is_empty() {
            return Err(Error::validation_for(&cluster.name, "cluster has no machines"));
        }
        if !cluster
            .machines
            .iter()
            .any(|m: &Machine| m.role.has(MachineRole::CONTROL_PLANE))
        {
            return Err(Error::validation_for(
                &cluster.name,
                "cluster has no control-plane machine",
            ));
        }
        if cluster.provider.image_source.is_empty() {
            return Err(Error::validation_for_field(
                &cluster.name,
                "no machine image source configured",
                "provider.imageSource",
            ));
        }
        Ok(())
    }

    /// Import the machine image on first use; reuse it afterwards
    async fn image_ensure(&self, cluster: &Cluster, status: &ClusterStatus) -> Result<()> {
        let name = image_name(&cluster.provider.image_source);
        if let Some(id) = self.infra.find_image(&name).await? {
            debug!(cluster = %cluster.name, image = %id, "machine image already imported");
            status.publish_image_id(id);
            return Ok(());
        }
        info!(cluster = %cluster.name, source = %cluster.provider.image_source, "importing machine image");
        let id = self
            .infra
            .import_image(&cluster.provider.image_source, &name)
            .await?;
        status.publish_image_id(id);
        Ok(())
    }

    /// Write the cluster's SSH key pair next to its manifest
    async fn ssh_files_ensure(&self, cluster: &Cluster) -> Result<()> {
        let Some(dir) = cluster.config_dir() else {
            return Ok(());
        };
        let credential = &cluster.provider.ssh;
        if credential.private_key.is_empty() {
            return Ok(());
        }
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| Error::io("ssh-key-files", e))?;

        let key_path = dir.join("id_rsa");
        tokio::fs::write(&key_path, &credential.private_key)
            .await
            .map_err(|e| Error::io("ssh-key-files", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(|e| Error::io("ssh-key-files", e))?;
        }

        if !credential.public_key.is_empty() {
            tokio::fs::write(dir.join("id_rsa.pub"), &credential.public_key)
                .await
                .map_err(|e| Error::io("ssh-key-files", e))?;
        }
        debug!(cluster = %cluster.name, "ssh key files written");
        Ok(())
    }
}

/// Image name derived from the source's final path segment
fn image_name(source: &str) -> String {
    let segment = source
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(source);
    segment
        .strip_suffix(".ova")
        .or_else(|| segment.strip_suffix(".ovf"))
        .unwrap_or(segment)
        .to_string()
}

#[async_trait]
impl ClusterActuator for VmClusterActuator {
    async fn reconcile(
        &self,
        cancel: &CancellationToken,
        cluster: &mut Cluster,
        status: &ClusterStatus,
    ) -> Result<()> {
        Self::validate(cluster)?;

        if !cluster.provider.cloud_provider.is_empty() {
            cluster.labels.insert(
                labels::CLOUD_PROVIDER.to_string(),
                cluster.provider.cloud_provider.clone(),
            );
        }

        self.image_ensure(cluster, status).await?;

        let nat = self.nat.for_config(&cluster.provider.nat);
        nat.ensure_cluster(cancel, cluster, status).await?;

        self.ssh_files_ensure(cluster).await?;

        if cluster.created.is_none() {
            cluster.created = Some(Utc::now());
        }
        info!(cluster = %cluster.name, "cluster resources reconciled");
        Ok(())
    }

    async fn delete(&self, cancel: &CancellationToken, cluster: &Cluster) -> Result<()> {
        let nat = self.nat.for_config(&cluster.provider.nat);
        if let Err(e) = nat.delete_cluster(cancel, cluster).await {
            if !e.is_not_found() {
                return Err(e);
            }
            debug!(cluster = %cluster.name, "nat forwarding already removed");
        }
        info!(cluster = %cluster.name, "cluster resources deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClusterProviderConfig, NatConfig};
    use crate::infra::MockInfrastructureClient;
    use crate::nat::elb::MockLoadBalancerClient;
    use crate::shell::MockShellClient;

    fn nat_providers() -> NatProvisioners {
        NatProvisioners::new(
            Arc::new(MockShellClient::new()),
            Arc::new(MockLoadBalancerClient::new()),
        )
    }

    fn cluster() -> Cluster {
        let mut cluster = Cluster {
            provider: ClusterProviderConfig {
                image_source: "https://images.example.com/node-1.16.2.ova".to_string(),
                nat: NatConfig::None,
                ..Default::default()
            },
            machines: vec![Machine {
                role: MachineRole::CONTROL_PLANE | MachineRole::WORKER,
                ..Default::default()
            }],
            ..Default::default()
        };
        cluster.with_name("kl-abc1234").unwrap();
        cluster
    }

    #[test]
    fn test_image_name_strips_path_and_extension() {
        assert_eq!(
            image_name("https://images.example.com/node-1.16.2.ova"),
            "node-1.16.2"
        );
        assert_eq!(image_name("local-image"), "local-image");
    }

    #[tokio::test]
    async fn story_image_is_imported_once_then_reused() {
        let mut infra = MockInfrastructureClient::new();
        let mut seq = mockall::Sequence::new();
        infra
            .expect_find_image()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(None));
        infra
            .expect_import_image()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok("image-1".to_string()));
        infra
            .expect_find_image()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Some("image-1".to_string())));

        let actuator = VmClusterActuator::new(Arc::new(infra), nat_providers());
        let mut cluster = cluster();
        let cancel = CancellationToken::new();

        let first = ClusterStatus::new();
        actuator.reconcile(&cancel, &mut cluster, &first).await.unwrap();
        assert_eq!(first.image_id(), Some("image-1"));

        let second = ClusterStatus::new();
        actuator
            .reconcile(&cancel, &mut cluster, &second)
            .await
            .unwrap();
        assert_eq!(second.image_id(), Some("image-1"));
    }

    #[tokio::test]
    async fn test_cloud_provider_label_is_applied() {
        let mut infra = MockInfrastructureClient::new();
        infra
            .expect_find_image()
            .returning(|_| Ok(Some("image-1".to_string())));

        let actuator = VmClusterActuator::new(Arc::new(infra), nat_providers());
        let mut cluster = cluster();
        cluster.provider.cloud_provider = "external".to_string();

        actuator
            .reconcile(&CancellationToken::new(), &mut cluster, &ClusterStatus::new())
            .await
            .unwrap();
        assert_eq!(
            cluster.labels.get(labels::CLOUD_PROVIDER).map(String::as_str),
            Some("external")
        );
        assert!(cluster.created.is_some());
    }

    #[tokio::test]
    async fn test_cluster_without_control_plane_is_rejected() {
        let actuator =
            VmClusterActuator::new(Arc::new(MockInfrastructureClient::new()), nat_providers());
        let mut cluster = cluster();
        for machine in &mut cluster.machines {
            machine.role = MachineRole::WORKER;
        }
        let err = actuator
            .reconcile(&CancellationToken::new(), &mut cluster, &ClusterStatus::new())
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_delete_with_direct_nat_is_a_no_op() {
        let actuator =
            VmClusterActuator::new(Arc::new(MockInfrastructureClient::new()), nat_providers());
        actuator
            .delete(&CancellationToken::new(), &cluster())
            .await
            .unwrap();
    }
}
