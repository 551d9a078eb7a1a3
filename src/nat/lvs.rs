//! IPVS forwarding on a bastion host
//!
//! The bastion runs Linux Virtual Server: each cluster service (API, SSH)
//! becomes an `ipvsadm` virtual service on the bastion's public address,
//! listening on an ephemeral port recorded in a bookkeeping file under
//! `/var/run/kubelift/`. All mutation happens in shell scripts executed on
//! the bastion under a `flock`, so concurrent pipelines and repeated runs
//! converge on the same state: creating an existing service returns its
//! recorded port, adding a present target is a no-op, and the single SSH
//! target goes to whichever machine's script runs first.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{LvsConfig, ServiceEndpoint, SshEndpoint};
use crate::error::{Error, Result};
use crate::model::{Cluster, Machine};
use crate::roles::MachineRole;
use crate::shell::ShellClient;
use crate::status::ClusterStatus;

use super::{api_service_id, ssh_service_id, NatProvisioner, API_PORT, SSH_PORT};

/// Directory of per-service bookkeeping files on the bastion
const RUN_DIR: &str = "/var/run/kubelift";

const FREE_PORT_CMD: &str = "read _l _u </proc/sys/net/ipv4/ip_local_port_range && \
     while true; do \
     _p=$(shuf -i $_l-$_u -n 1); ss -lpn | grep -q $_p || break; \
     done";

fn create_service_cmd(nic: &str, sid: &str, vip: &str) -> String {
    format!(
        "sudo mkdir -p {RUN_DIR} && \
         sudo flock {RUN_DIR}/lvs.lock sh -c '\
         cat {RUN_DIR}/{sid}.lvs 2>/dev/null || {{ \
         {FREE_PORT_CMD} && \
         iptables -A INPUT -i {nic} -p tcp -m tcp --dport $_p -j ACCEPT && \
         ipvsadm -A -t {vip}:$_p -s rr && \
         echo $_p | tee {RUN_DIR}/{sid}.lvs\
         ; }}'"
    )
}

fn add_target_cmd(sid: &str, vip: &str, target: &ServiceEndpoint) -> String {
    format!(
        "sudo mkdir -p {RUN_DIR} && \
         sudo flock {RUN_DIR}/lvs.lock sh -c '\
         _p=$(cat {RUN_DIR}/{sid}.lvs) && {{ {{ \
         ipvsadm -ln -t {vip}:$_p | grep -q {addr}:{port}\
         ; }} || {{ \
         ipvsadm -a -t {vip}:$_p -r {addr}:{port} -m\
         ; }}; }}'",
        addr = target.addr,
        port = target.port,
    )
}

fn set_or_get_target_cmd(sid: &str, vip: &str, target: &ServiceEndpoint) -> String {
    format!(
        "sudo mkdir -p {RUN_DIR} && \
         sudo flock {RUN_DIR}/lvs.lock sh -c '\
         _p=$(cat {RUN_DIR}/{sid}.lvs) && {{ {{ \
         _a=$(ipvsadm -ln -t {vip}:$_p | grep Masq | awk \"{{print \\$2}}\") && \
         [ -n \"${{_a}}\" ] && echo \"${{_a}}\"\
         ; }} 2>/dev/null || {{ \
         ipvsadm -a -t {vip}:$_p -r {addr}:{port} -m && \
         echo {addr}:{port}\
         ; }}; }}'",
        addr = target.addr,
        port = target.port,
    )
}

fn delete_service_cmd(nic: &str, sid: &str, vip: &str) -> String {
    format!(
        "sudo mkdir -p {RUN_DIR} && \
         sudo flock {RUN_DIR}/lvs.lock sh -c '\
         [ ! -f {RUN_DIR}/{sid}.lvs ] || {{ \
         _p=$(cat {RUN_DIR}/{sid}.lvs) && \
         iptables -D INPUT -i {nic} -p tcp -m tcp --dport $_p -j ACCEPT && \
         ipvsadm -D -t {vip}:$_p && \
         rm -f {RUN_DIR}/{sid}.lvs\
         ; }}'"
    )
}

pub struct LvsNat {
    config: LvsConfig,
    shell: Arc<dyn ShellClient>,
}

impl LvsNat {
    pub fn new(config: LvsConfig, shell: Arc<dyn ShellClient>) -> Self {
        Self { config, shell }
    }

    async fn run_on_bastion(&self, command: &str) -> Result<String> {
        self.shell
            .run(
                &self.config.ssh.credential,
                &self.config.ssh.endpoint,
                command,
            )
            .await
    }

    /// Create the service if absent; either way, return its listen port
    async fn ensure_service(&self, cluster: &Cluster, sid: &str) -> Result<u16> {
        let cmd = create_service_cmd(&self.config.public_nic, sid, &self.config.public_ip_addr);
        let stdout = self.run_on_bastion(&cmd).await?;
        let port = stdout.trim().parse::<u16>().map_err(|_| {
            Error::provider_permanent(
                &cluster.name,
                "lvs",
                format!("service {sid} returned invalid port {:?}", stdout.trim()),
            )
        })?;
        debug!(cluster = %cluster.name, service = %sid, port = port, "ipvs service ensured");
        Ok(port)
    }
}

#[async_trait]
impl NatProvisioner for LvsNat {
    async fn ensure_cluster(
        &self,
        _cancel: &CancellationToken,
        cluster: &Cluster,
        status: &ClusterStatus,
    ) -> Result<()> {
        let api_port = self
            .ensure_service(cluster, &api_service_id(&cluster.name))
            .await?;
        status.publish_api_endpoint(ServiceEndpoint::new(
            self.config.public_ip_addr.clone(),
            api_port,
        ));

        let ssh_port = self
            .ensure_service(cluster, &ssh_service_id(&cluster.name))
            .await?;
        status.publish_bastion(SshEndpoint::direct(
            self.config.public_ip_addr.clone(),
            ssh_port,
        ));

        info!(
            cluster = %cluster.name,
            api_port = api_port,
            ssh_port = ssh_port,
            "ipvs forwarding online"
        );
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
            Error::validation_for(&cluster.name, "ssh forwarding not provisioned")
        })?;
        let vip = &self.config.public_ip_addr;

        if machine.role.has(MachineRole::CONTROL_PLANE) {
            let target = ServiceEndpoint::new(addr, API_PORT);
            let cmd = add_target_cmd(&api_service_id(&cluster.name), vip, &target);
            self.run_on_bastion(&cmd).await?;
        }

        let target = ServiceEndpoint::new(addr, SSH_PORT);
        let cmd = set_or_get_target_cmd(&ssh_service_id(&cluster.name), vip, &target);
        let stdout = self.run_on_bastion(&cmd).await?;
        let winner = stdout.trim();
        let (winner_addr, _) = winner.rsplit_once(':').ok_or_else(|| {
            Error::provider_permanent(
                &cluster.name,
                "lvs",
                format!("invalid ssh target {winner:?}"),
            )
        })?;

        if winner_addr == addr {
            // This machine is the forwarded target; reach it on the
            // bastion's public port.
            Ok(bastion)
        } else {
            Ok(SshEndpoint::proxied(addr, SSH_PORT, bastion))
        }
    }

    async fn delete_cluster(&self, _cancel: &CancellationToken, cluster: &Cluster) -> Result<()> {
        // Both services are attempted even when the first teardown fails,
        // so a partial delete can be re-run to completion.
        let vip = &self.config.public_ip_addr;
        let mut first_error = None;
        for sid in [api_service_id(&cluster.name), ssh_service_id(&cluster.name)] {
            let cmd = delete_service_cmd(&self.config.public_nic, &sid, vip);
            if let Err(e) = self.run_on_bastion(&cmd).await {
                warn!(cluster = %cluster.name, service = %sid, error = %e, "ipvs teardown failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                info!(cluster = %cluster.name, "ipvs forwarding removed");
                Ok(())
            }
        }
    }
}
