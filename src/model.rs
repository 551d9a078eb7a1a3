//! Cluster and machine records
//!
//! A [`Cluster`] is created by the caller before any actuator runs and is
//! mutated by actuators (labels, timestamps). Machines carry a role
//! bitmask, immutable provider configuration, and a status record written
//! during their actuator pipeline.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{ClusterProviderConfig, MachineProviderConfig, SshEndpoint};
use crate::error::{Error, Result};
use crate::labels;
use crate::naming;
use crate::roles::MachineRole;

/// Persisted cluster manifest file name
pub const CLUSTER_MANIFEST: &str = "cluster.yaml";

/// A Kubernetes cluster to be provisioned
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    /// Cluster name, `<prefix>-<7 hex chars>`
    pub name: String,
    /// Opaque labels carrying cross-cutting metadata
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Immutable provider configuration
    pub provider: ClusterProviderConfig,
    /// The machines belonging to this cluster
    #[serde(default)]
    pub machines: Vec<Machine>,
    /// When provisioning of the cluster started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
}

/// One cluster machine
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Machine {
    /// Machine name, `c01.<id>.<prefix>` / `w01.<id>.<prefix>`
    pub name: String,
    /// Role bitmask; control-plane and worker may both be set
    pub role: MachineRole,
    /// Kubernetes version deployed on this machine
    #[serde(default)]
    pub kubernetes_version: String,
    /// Immutable provider configuration
    pub provider: MachineProviderConfig,
    /// Status written during the actuator pipeline
    #[serde(default)]
    pub status: MachineStatus,
    /// When provisioning of the machine finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
}

/// Mutable per-machine status
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    /// How to reach the machine over SSH, assigned during NAT registration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh: Option<SshEndpoint>,
    /// Internal addresses reported by the primary network adapter
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_addrs: Vec<String>,
    /// Message of the last pipeline error, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl MachineStatus {
    /// The machine's primary internal address
    pub fn ip_addr(&self) -> Option<&str> {
        self.ip_addrs.first().map(String::as_str)
    }
}

impl Cluster {
    /// Create a cluster with a generated name and one machine per role set
    pub fn from_roles(
        provider: ClusterProviderConfig,
        machine_provider: MachineProviderConfig,
        roles: &[MachineRole],
    ) -> Result<Self> {
        let mut cluster = Cluster {
            provider,
            ..Default::default()
        };
        cluster.machines = roles
            .iter()
            .map(|role| Machine {
                role: *role,
                provider: machine_provider.clone(),
                ..Default::default()
            })
            .collect();
        cluster.with_name(naming::new_name())?;
        Ok(cluster)
    }

    /// Assign the cluster's name and derive machine names from it
    ///
    /// Machines are named `c01.<id>.<prefix>`, `w01.<id>.<prefix>`, with
    /// the counter scoped per role (control-plane wins for dual-role
    /// machines).
    pub fn with_name(&mut self, name: impl Into<String>) -> Result<&mut Self> {
        let name = name.into();
        naming::validate_name(&name)?;
        let (prefix, id) = name.split_once('-').expect("validated name has a dash");
        let domain = format!("{id}.{prefix}");

        let (mut cidx, mut widx) = (1, 1);
        for machine in &mut self.machines {
            machine.name = if machine.role.has(MachineRole::CONTROL_PLANE) {
                let n = format!("c{cidx:02}.{domain}");
                cidx += 1;
                n
            } else {
                let n = format!("w{widx:02}.{domain}");
                widx += 1;
                n
            };
        }
        self.name = name;
        Ok(self)
    }

    /// Assign the Kubernetes version deployed on every machine
    pub fn with_kubernetes_version(&mut self, version: impl Into<String>) -> &mut Self {
        let version = version.into();
        for machine in &mut self.machines {
            machine.kubernetes_version = version.clone();
        }
        self
    }

    /// Record the cluster's local configuration directory
    pub fn with_config_dir(&mut self, dir: impl Into<String>) -> &mut Self {
        self.labels.insert(labels::CONFIG_DIR.to_string(), dir.into());
        self
    }

    /// Record the pod network CIDR label
    pub fn with_pod_network_cidr(&mut self, cidr: impl Into<String>) -> &mut Self {
        let cidr = cidr.into();
        if !cidr.is_empty() {
            self.labels.insert(labels::POD_NETWORK_CIDR.to_string(), cidr);
        }
        self
    }

    /// The cluster's local configuration directory, if configured
    pub fn config_dir(&self) -> Option<&Path> {
        self.labels
            .get(labels::CONFIG_DIR)
            .filter(|d| !d.is_empty())
            .map(Path::new)
    }

    /// Path of the persisted cluster manifest, if a config dir is set
    pub fn manifest_path(&self) -> Option<PathBuf> {
        self.config_dir().map(|d| d.join(CLUSTER_MANIFEST))
    }

    /// Serialize the cluster record to its manifest file
    ///
    /// A no-op when no config directory is configured.
    pub async fn write_to_disk(&self) -> Result<()> {
        let Some(path) = self.manifest_path() else {
            return Ok(());
        };
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| Error::io("cluster-manifest", e))?;
        }
        let yaml = serde_yaml::to_string(self)
            .map_err(|e| Error::serialization_for_kind("Cluster", e.to_string()))?;
        tokio::fs::write(&path, yaml)
            .await
            .map_err(|e| Error::io("cluster-manifest", e))?;
        debug!(cluster = %self.name, path = %path.display(), "wrote cluster manifest");
        Ok(())
    }

    /// Read a cluster record back from its manifest file
    pub async fn read_from_disk(path: &Path) -> Result<Self> {
        let yaml = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::not_found(format!("cluster manifest {}", path.display()))
            } else {
                Error::io("cluster-manifest", e)
            }
        })?;
        serde_yaml::from_str(&yaml)
            .map_err(|e| Error::serialization_for_kind("Cluster", e.to_string()))
    }

    /// The provider group whose actuators reconcile this cluster
    pub fn provider_group(&self) -> &str {
        self.labels
            .get(labels::PROVIDER_GROUP)
            .map(String::as_str)
            .unwrap_or(crate::actuator::VM_PROVIDER_GROUP)
    }
}
