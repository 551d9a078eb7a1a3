//! Provider and network configuration types
//!
//! These types describe how to reach machines (SSH endpoints, possibly
//! proxied through a bastion), how the cluster is exposed externally
//! (the NAT variants), and the immutable per-entity provider settings.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The IP or DNS address and port of a service
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEndpoint {
    /// Network address at which the service is available (FQDN or IP)
    pub addr: String,
    /// Port on which the service is listening
    pub port: u16,
}

impl ServiceEndpoint {
    /// Create a new service endpoint
    pub fn new(addr: impl Into<String>, port: u16) -> Self {
        Self {
            addr: addr.into(),
            port,
        }
    }
}

impl fmt::Display for ServiceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.addr.contains(':') {
            write!(f, "[{}]:{}", self.addr, self.port)
        } else {
            write!(f, "{}:{}", self.addr, self.port)
        }
    }
}

/// An SSH endpoint, optionally reached through a bastion hop
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshEndpoint {
    /// The target address and port
    #[serde(flatten)]
    pub endpoint: ServiceEndpoint,
    /// Bastion to proxy through, if the target is not directly reachable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<Box<SshEndpoint>>,
}

impl SshEndpoint {
    /// Create a direct (unproxied) SSH endpoint
    pub fn direct(addr: impl Into<String>, port: u16) -> Self {
        Self {
            endpoint: ServiceEndpoint::new(addr, port),
            proxy: None,
        }
    }

    /// Create an SSH endpoint proxied through the given bastion
    pub fn proxied(addr: impl Into<String>, port: u16, bastion: SshEndpoint) -> Self {
        Self {
            endpoint: ServiceEndpoint::new(addr, port),
            proxy: Some(Box::new(bastion)),
        }
    }
}

impl fmt::Display for SshEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.endpoint.fmt(f)
    }
}

/// Credential used to authenticate SSH sessions
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshCredential {
    /// Remote username
    pub username: String,
    /// Private key material (PEM)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub private_key: Vec<u8>,
    /// Path to the private key on the local filesystem
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub private_key_path: String,
    /// Public side of the keypair (authorized_keys format)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub public_key: Vec<u8>,
}

/// Credential plus the endpoint it authenticates to (e.g., the LVS bastion)
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshCredentialAndEndpoint {
    /// How to reach the host
    #[serde(flatten)]
    pub endpoint: SshEndpoint,
    /// How to authenticate
    #[serde(flatten)]
    pub credential: SshCredential,
}

/// External-access configuration, exactly one variant per cluster
///
/// An unrecognized variant is a deserialization error rather than a
/// silently ignored branch.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum NatConfig {
    /// IPVS services on a single bastion host
    Lvs(LvsConfig),
    /// Cloud network load balancer
    LoadBalancer(LoadBalancerConfig),
    /// Direct access; the machine's internal address is used verbatim
    None,
}

impl Default for NatConfig {
    fn default() -> Self {
        NatConfig::None
    }
}

/// Configuration for the IPVS (Linux Virtual Server) bastion backend
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LvsConfig {
    /// Name of the public network interface device on the bastion
    pub public_nic: String,
    /// Public IP, also the virtual IP for services created on the bastion
    pub public_ip_addr: String,
    /// IP the bastion uses to reach the nodes; also the nodes' gateway
    pub private_ip_addr: String,
    /// How to reach and authenticate to the bastion
    pub ssh: SshCredentialAndEndpoint,
}

/// Configuration for the cloud network load balancer backend
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerConfig {
    /// Static access key id; the client may fall back to ambient credentials
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub access_key_id: String,
    /// Static secret access key
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub secret_access_key: String,
    /// Region hosting the load balancer
    pub region: String,
    /// Subnet the load balancer attaches to
    pub subnet_id: String,
    /// VPC the target groups are created in
    pub vpc_id: String,
    /// Port used for target health checks; 0 uses the traffic port
    #[serde(default)]
    pub health_check_port: u16,
}

/// A machine network interface attachment
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterfaceConfig {
    /// Interface name inside the guest, e.g. "eth0"
    pub name: String,
    /// Name of the provider network to attach to
    pub network: String,
}

/// Immutable provider configuration shared by all machines of a cluster
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterProviderConfig {
    /// Source of the VM image to import (e.g., an OVA URL)
    pub image_source: String,
    /// External-access backend
    #[serde(default)]
    pub nat: NatConfig,
    /// Credential used to reach the cluster's machines
    #[serde(default)]
    pub ssh: SshCredential,
    /// Cloud-provider integration kind, recorded as a cluster label
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cloud_provider: String,
    /// Cloud-provider configuration file uploaded to every machine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_config: Option<CloudConfigFile>,
    /// Pod network manifest applied after bootstrap when no pod network
    /// CIDR label is set on the cluster
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub network_manifest: String,
}

/// An opaque cloud-provider configuration file
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudConfigFile {
    /// Absolute path the file is written to on each machine
    pub path: String,
    /// File content, already rendered by the caller
    pub content: String,
}

/// Immutable provider configuration for one machine
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineProviderConfig {
    /// Datacenter containing the machine's resources
    pub datacenter: String,
    /// Datastore backing the machine's disks
    pub datastore: String,
    /// Folder the machine is created in
    pub folder: String,
    /// Resource pool the machine is scheduled into
    pub resource_pool: String,
    /// Network interfaces, first entry is the primary adapter
    pub interfaces: Vec<NetworkInterfaceConfig>,
    /// Boot disk size after resize
    #[serde(default)]
    pub disk_gib: u32,
    /// Opaque guest-info extra configuration (the cloud-init payload),
    /// produced by an external content generator
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_config: Vec<(String, String)>,
}
