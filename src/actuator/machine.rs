//! Per-machine provisioning pipeline
//!
//! Each machine moves through six steps: create the virtual machine, wire
//! it into the cluster's NAT forwarding, wait for SSH, lay down its
//! configuration files, bring the control plane online (or wait for it),
//! and join the node to the cluster. Every step is written to be re-run:
//! an interrupted pipeline picks up where it left off.
//!
//! Control-plane coordination runs through the shared status gate: the
//! first control-plane machine to claim ownership runs `kubeadm init` and
//! publishes the join command; everyone else waits for the gate.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::actuator::MachineActuator;
use crate::config::SshEndpoint;
use crate::error::{Error, Result};
use crate::infra::InfrastructureClient;
use crate::kubeadm;
use crate::labels;
use crate::model::{Cluster, Machine};
use crate::nat::{NatProvisioners, API_PORT};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::roles::MachineRole;
use crate::shell::{self, ShellClient};
use crate::sshconf::{self, SshConfigEntry};
use crate::status::ClusterStatus;

const KUBEADM_CONF: &str = "/etc/kubernetes/kubeadm.conf";
const ADMIN_CONF: &str = "/etc/kubernetes/admin.conf";
const KUBELET_CONF: &str = "/etc/kubernetes/kubelet.conf";

/// Alias of the generated ssh-config block machines tunnel through
const BASTION_ALIAS: &str = "bastion";

pub struct VmMachineActuator {
    infra: Arc<dyn InfrastructureClient>,
    shell: Arc<dyn ShellClient>,
    nat: NatProvisioners,
}

impl VmMachineActuator {
    pub fn new(
        infra: Arc<dyn InfrastructureClient>,
        shell: Arc<dyn ShellClient>,
        nat: NatProvisioners,
    ) -> Self {
        Self { infra, shell, nat }
    }

    /// Create the virtual machine if absent and collect its addresses
    async fn vm_ensure(
        &self,
        cancel: &CancellationToken,
        cluster: &Cluster,
        status: &ClusterStatus,
        machine: &mut Machine,
    ) -> Result<()> {
        let id = match self.infra.find_machine(&machine.name).await? {
            Some(id) => {
                debug!(machine = %machine.name, id = %id, "machine already exists");
                id
            }
            None => {
                let image_id = status.image_id().ok_or_else(|| {
                    Error::validation_for(&cluster.name, "machine image not resolved")
                })?;
                info!(machine = %machine.name, image = %image_id, "creating machine");
                self.infra
                    .create_machine(&machine.name, image_id, &machine.provider)
                    .await?
            }
        };
        // Tolerant of an already-running machine, like power_off.
        self.infra.power_on(&id).await?;

        machine.status.ip_addrs = self.infra.wait_for_network(&id, cancel).await?;
        debug!(machine = %machine.name, addrs = ?machine.status.ip_addrs, "machine online");
        Ok(())
    }

    /// Register the machine with the cluster's NAT backend
    async fn nat_ensure(
        &self,
        cancel: &CancellationToken,
        cluster: &Cluster,
        status: &ClusterStatus,
        machine: &mut Machine,
    ) -> Result<()> {
        let nat = self.nat.for_config(&cluster.provider.nat);
        let endpoint = {
            let nat = nat.as_ref();
            let machine = &*machine;
            retry_with_backoff(&RetryConfig::default(), cancel, "nat-register", move || {
                async move { nat.register_machine(cancel, cluster, status, machine).await }
            })
            .await?
        };
        debug!(machine = %machine.name, endpoint = %endpoint.endpoint, "nat registered");
        machine.status.ssh = Some(endpoint);
        Ok(())
    }

    /// Wait for SSH and record the machine in the cluster's ssh config
    async fn ssh_ensure(
        &self,
        cancel: &CancellationToken,
        cluster: &Cluster,
        status: &ClusterStatus,
        machine: &Machine,
    ) -> Result<()> {
        let endpoint = self.endpoint_of(cluster, machine)?;
        let credential = &cluster.provider.ssh;
        shell::wait_online(self.shell.as_ref(), credential, &endpoint, cancel).await?;

        // Machines tunnel to each other with the cluster key, so every
        // machine gets its own copy.
        if !credential.private_key.is_empty() {
            let user = &credential.username;
            let key_path = format!("/home/{user}/.ssh/id_rsa");
            shell::write_file(
                self.shell.as_ref(),
                credential,
                &endpoint,
                &key_path,
                "0400",
                &credential.private_key,
            )
            .await?;
            self.shell
                .run(
                    credential,
                    &endpoint,
                    &format!("sudo chown {user}:{user} {key_path}"),
                )
                .await?;
        }

        let Some(dir) = cluster.config_dir() else {
            return Ok(());
        };
        let identity_file = dir.join("id_rsa").display().to_string();
        let alias = machine
            .name
            .split('.')
            .next()
            .unwrap_or(&machine.name)
            .to_string();

        let path = dir.join(sshconf::SSH_CONFIG_FILE);
        let _guard = status.ssh_config.lock().await;
        if let Some(proxy) = &endpoint.proxy {
            sshconf::upsert_file(
                &path,
                &SshConfigEntry {
                    alias: BASTION_ALIAS.to_string(),
                    host_name: proxy.endpoint.addr.clone(),
                    port: proxy.endpoint.port,
                    user: cluster.provider.ssh.username.clone(),
                    identity_file: identity_file.clone(),
                    proxy_alias: None,
                },
            )
            .await?;
        }
        sshconf::upsert_file(
            &path,
            &SshConfigEntry {
                alias,
                host_name: endpoint.endpoint.addr.clone(),
                port: endpoint.endpoint.port,
                user: cluster.provider.ssh.username.clone(),
                identity_file,
                proxy_alias: endpoint.proxy.as_ref().map(|_| BASTION_ALIAS.to_string()),
            },
        )
        .await?;
        Ok(())
    }

    /// Lay down the machine's Kubernetes configuration files
    async fn files_ensure(
        &self,
        cluster: &Cluster,
        status: &ClusterStatus,
        machine: &Machine,
    ) -> Result<()> {
        let endpoint = self.endpoint_of(cluster, machine)?;
        let credential = &cluster.provider.ssh;

        shell::mkdir_all(self.shell.as_ref(), credential, &endpoint, "/etc/kubernetes").await?;

        if let Some(cloud_config) = &cluster.provider.cloud_config {
            shell::write_file(
                self.shell.as_ref(),
                credential,
                &endpoint,
                &cloud_config.path,
                "0640",
                cloud_config.content.as_bytes(),
            )
            .await?;
        }

        if shell::file_exists(self.shell.as_ref(), credential, &endpoint, KUBEADM_CONF).await? {
            debug!(machine = %machine.name, "kubeadm config already present");
            return Ok(());
        }

        let addr = machine.status.ip_addr().ok_or_else(|| {
            Error::validation_for(
                &cluster.name,
                format!("machine {} has no internal address", machine.name),
            )
        })?;
        let config = kubeadm::render_config(&kubeadm::ConfigData {
            cluster_name: cluster.name.clone(),
            kubernetes_version: machine.kubernetes_version.clone(),
            control_plane_endpoint: format!("{addr}:{API_PORT}"),
            node_name: machine.name.clone(),
            cert_sans: status
                .api_endpoint()
                .map(|e| vec![e.addr.clone()])
                .unwrap_or_default(),
            pod_network_cidr: cluster.labels.get(labels::POD_NETWORK_CIDR).cloned(),
            cloud_provider: cluster
                .labels
                .get(labels::CLOUD_PROVIDER)
                .filter(|v| !v.is_empty())
                .cloned(),
        })?;

        shell::write_file(
            self.shell.as_ref(),
            credential,
            &endpoint,
            KUBEADM_CONF,
            "0640",
            config.as_bytes(),
        )
        .await
    }

    /// Bring the control plane online or wait for it
    async fn api_ensure(
        &self,
        cancel: &CancellationToken,
        cluster: &Cluster,
        status: &ClusterStatus,
        machine: &Machine,
    ) -> Result<()> {
        if machine.role.has(MachineRole::CONTROL_PLANE) && status.control_plane.try_own() {
            info!(machine = %machine.name, "bootstrapping control plane");
            self.bootstrap_control_plane(cluster, status, machine).await?;
            status.control_plane.signal_ready();
        }
        status.control_plane.wait_ready(cancel).await?;
        debug!(machine = %machine.name, "control plane online");
        Ok(())
    }

    async fn bootstrap_control_plane(
        &self,
        cluster: &Cluster,
        status: &ClusterStatus,
        machine: &Machine,
    ) -> Result<()> {
        let endpoint = self.endpoint_of(cluster, machine)?;
        let credential = &cluster.provider.ssh;
        let shell = self.shell.as_ref();

        let join_command =
            if shell::file_exists(shell, credential, &endpoint, ADMIN_CONF).await? {
                // A previous run already initialized this node; mint a
                // fresh join command instead of re-running init.
                info!(machine = %machine.name, "control plane already initialized");
                let stdout = shell
                    .run(
                        credential,
                        &endpoint,
                        "sudo kubeadm token create --print-join-command",
                    )
                    .await?;
                kubeadm::extract_join_command(&stdout)?
            } else {
                let cmd = format!("sudo kubeadm init --config {KUBEADM_CONF}");
                let stdout = shell.run(credential, &endpoint, &cmd).await?;
                if let Some(dir) = cluster.config_dir() {
                    tokio::fs::write(dir.join("kubeadm-init.log"), &stdout)
                        .await
                        .map_err(|e| Error::io("kubeadm-init-log", e))?;
                }
                self.network_ensure(cluster, machine, &endpoint).await?;
                kubeadm::extract_join_command(&stdout)?
            };
        status.publish_join_command(format!("{join_command} --config {KUBEADM_CONF}"));

        // Fetch the admin kubeconfig and point it at the published
        // endpoint so it works from outside the cluster network.
        if let Some(dir) = cluster.config_dir() {
            let kubeconfig = shell
                .run(credential, &endpoint, &format!("sudo cat {ADMIN_CONF}"))
                .await?;
            let kubeconfig = match status.api_endpoint() {
                Some(api) => kubeadm::rewrite_kubeconfig_server(&kubeconfig, &api.to_string()),
                None => kubeconfig,
            };
            tokio::fs::write(dir.join("kube.conf"), kubeconfig)
                .await
                .map_err(|e| Error::io("kube-conf", e))?;
        }
        Ok(())
    }

    /// Apply the configured pod network manifest on the bootstrap node.
    ///
    /// Skipped when the cluster carries a pod network CIDR label; in that
    /// case networking is expected to be applied out of band.
    async fn network_ensure(
        &self,
        cluster: &Cluster,
        machine: &Machine,
        endpoint: &SshEndpoint,
    ) -> Result<()> {
        if cluster.labels.contains_key(labels::POD_NETWORK_CIDR) {
            return Ok(());
        }
        let manifest = &cluster.provider.network_manifest;
        if manifest.is_empty() {
            return Ok(());
        }
        info!(machine = %machine.name, "applying pod network manifest");
        self.shell
            .run_with_stdin(
                &cluster.provider.ssh,
                endpoint,
                &format!("sudo kubectl --kubeconfig {ADMIN_CONF} apply -f -"),
                manifest.as_bytes(),
            )
            .await?;
        Ok(())
    }

    /// Join the node to the cluster; a no-op on already-joined nodes
    async fn node_ensure(
        &self,
        cancel: &CancellationToken,
        cluster: &Cluster,
        status: &ClusterStatus,
        machine: &Machine,
    ) -> Result<()> {
        let endpoint = self.endpoint_of(cluster, machine)?;
        let join_command = status.join_command(cancel).await?;
        info!(machine = %machine.name, "joining node");
        self.shell
            .run(
                &cluster.provider.ssh,
                &endpoint,
                &format!("sudo sh -c '[ -e {KUBELET_CONF} ]' || sudo {join_command}"),
            )
            .await?;
        Ok(())
    }

    fn endpoint_of(&self, cluster: &Cluster, machine: &Machine) -> Result<SshEndpoint> {
        machine.status.ssh.clone().ok_or_else(|| {
            Error::validation_for(
                &cluster.name,
                format!("machine {} has no ssh endpoint", machine.name),
            )
        })
    }
}

#[async_trait]
impl MachineActuator for VmMachineActuator {
    async fn reconcile(
        &self,
        cancel: &CancellationToken,
        cluster: &Cluster,
        status: &ClusterStatus,
        machine: &mut Machine,
    ) -> Result<()> {
        self.vm_ensure(cancel, cluster, status, machine).await?;
        self.nat_ensure(cancel, cluster, status, machine).await?;
        self.ssh_ensure(cancel, cluster, status, machine).await?;
        self.files_ensure(cluster, status, machine).await?;
        self.api_ensure(cancel, cluster, status, machine).await?;
        self.node_ensure(cancel, cluster, status, machine).await?;

        if machine.created.is_none() {
            machine.created = Some(Utc::now());
        }
        info!(machine = %machine.name, "machine reconciled");
        Ok(())
    }

    async fn delete(
        &self,
        _cancel: &CancellationToken,
        _cluster: &Cluster,
        machine: &Machine,
    ) -> Result<()> {
        let Some(id) = self.infra.find_machine(&machine.name).await? else {
            debug!(machine = %machine.name, "machine already gone");
            return Ok(());
        };
        self.infra.power_off(&id).await?;
        self.infra.destroy(&id).await?;
        info!(machine = %machine.name, "machine deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CloudConfigFile, ClusterProviderConfig, NatConfig, SshCredential};
    use crate::infra::MockInfrastructureClient;
    use crate::model::Cluster;
    use crate::nat::elb::MockLoadBalancerClient;
    use crate::testutil::FakeShell;

    fn actuator(infra: MockInfrastructureClient, shell: Arc<FakeShell>) -> VmMachineActuator {
        let nat = NatProvisioners::new(
            Arc::clone(&shell) as Arc<dyn ShellClient>,
            Arc::new(MockLoadBalancerClient::new()),
        );
        VmMachineActuator::new(Arc::new(infra), shell, nat)
    }

    fn cluster(dir: &std::path::Path) -> Cluster {
        let mut cluster = Cluster {
            provider: ClusterProviderConfig {
                image_source: "node-1.16.2.ova".to_string(),
                nat: NatConfig::None,
                ssh: SshCredential {
                    username: "kube".to_string(),
                    private_key: b"key".to_vec(),
                    ..Default::default()
                },
                cloud_config: Some(CloudConfigFile {
                    path: "/etc/kubernetes/cloud.conf".to_string(),
                    content: "[Global]\n".to_string(),
                }),
                network_manifest: "kind: DaemonSet\n".to_string(),
                ..Default::default()
            },
            machines: vec![Machine {
                role: MachineRole::CONTROL_PLANE | MachineRole::WORKER,
                kubernetes_version: "1.16.2".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };
        cluster.with_name("sk8-abc1234").unwrap();
        cluster.with_config_dir(dir.display().to_string());
        cluster
    }

    fn infra_for_new_machine() -> MockInfrastructureClient {
        let mut infra = MockInfrastructureClient::new();
        infra.expect_find_machine().returning(|_| Ok(None));
        infra
            .expect_create_machine()
            .times(1)
            .returning(|_, _, _| Ok("vm-1".to_string()));
        infra.expect_power_on().times(1).returning(|_| Ok(()));
        infra
            .expect_wait_for_network()
            .returning(|_, _| Ok(vec!["10.0.0.5".to_string()]));
        infra
    }

    #[tokio::test]
    async fn story_single_machine_bootstraps_and_joins() {
        let dir = std::env::temp_dir().join(format!("kubelift-machine-a-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();

        let shell = Arc::new(FakeShell::default());
        let actuator = actuator(infra_for_new_machine(), Arc::clone(&shell));
        let cluster = cluster(&dir);
        let status = ClusterStatus::new();
        status.publish_image_id("image-1");
        let mut machine = cluster.machines[0].clone();

        actuator
            .reconcile(&CancellationToken::new(), &cluster, &status, &mut machine)
            .await
            .unwrap();

        // The lone machine won ownership, bootstrapped, and came online.
        assert!(status.control_plane.is_ready());
        assert_eq!(shell.init_count(), 1);
        // Its join step was a no-op: init already produced kubelet.conf.
        assert_eq!(shell.join_count(), 0);
        // No pod CIDR label, so the configured network manifest went on.
        assert_eq!(shell.network_apply_count(), 1);
        // The cluster key and cloud-provider config landed on the machine.
        assert!(shell.has_file("10.0.0.5:22", "/home/kube/.ssh/id_rsa"));
        assert!(shell.has_file("10.0.0.5:22", "/etc/kubernetes/cloud.conf"));
        assert_eq!(machine.status.ip_addr(), Some("10.0.0.5"));
        assert!(machine.created.is_some());

        // The pipeline left artifacts next to the cluster manifest.
        assert!(dir.join("kubeadm-init.log").exists());
        let kubeconf = tokio::fs::read_to_string(dir.join("kube.conf")).await.unwrap();
        assert!(kubeconf.contains("server: https://10.0.0.5:443"));
        let sshconf = tokio::fs::read_to_string(dir.join("ssh.conf")).await.unwrap();
        assert!(sshconf.contains("Host c01\n"));

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn story_rerun_skips_init_but_still_opens_the_gate() {
        let dir = std::env::temp_dir().join(format!("kubelift-machine-b-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();

        let shell = Arc::new(FakeShell::default());
        // The machine was already bootstrapped by an earlier run.
        shell.seed_file("10.0.0.5:22", ADMIN_CONF);
        shell.seed_file("10.0.0.5:22", KUBELET_CONF);
        shell.seed_file("10.0.0.5:22", KUBEADM_CONF);

        let mut infra = MockInfrastructureClient::new();
        infra
            .expect_find_machine()
            .returning(|_| Ok(Some("vm-1".to_string())));
        infra.expect_create_machine().never();
        // An existing machine may have been powered down between runs.
        infra.expect_power_on().times(1).returning(|_| Ok(()));
        infra
            .expect_wait_for_network()
            .returning(|_, _| Ok(vec!["10.0.0.5".to_string()]));

        let actuator = actuator(infra, Arc::clone(&shell));
        let cluster = cluster(&dir);
        let status = ClusterStatus::new();
        status.publish_image_id("image-1");
        let mut machine = cluster.machines[0].clone();

        actuator
            .reconcile(&CancellationToken::new(), &cluster, &status, &mut machine)
            .await
            .unwrap();

        assert!(status.control_plane.is_ready());
        assert_eq!(shell.init_count(), 0);
        assert_eq!(shell.token_create_count(), 1);
        // Networking was applied the first time around, not again.
        assert_eq!(shell.network_apply_count(), 0);

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn test_delete_of_never_created_machine_succeeds() {
        let mut infra = MockInfrastructureClient::new();
        infra.expect_find_machine().returning(|_| Ok(None));
        infra.expect_destroy().never();

        let shell = Arc::new(FakeShell::default());
        let actuator = actuator(infra, shell);
        let dir = std::env::temp_dir();
        let cluster = cluster(&dir);

        actuator
            .delete(&CancellationToken::new(), &cluster, &cluster.machines[0])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_image_fails_the_pipeline() {
        let mut infra = MockInfrastructureClient::new();
        infra.expect_find_machine().returning(|_| Ok(None));

        let shell = Arc::new(FakeShell::default());
        let actuator = actuator(infra, shell);
        let dir = std::env::temp_dir();
        let cluster = cluster(&dir);
        let mut machine = cluster.machines[0].clone();

        let err = actuator
            .reconcile(
                &CancellationToken::new(),
                &cluster,
                &ClusterStatus::new(),
                &mut machine,
            )
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }
}
