//! Kubelift - one-shot Kubernetes cluster provisioner for test environments
//!
//! Kubelift turns a handful of freshly cloned virtual machines into a working
//! Kubernetes cluster in a single reconciliation pass. Every machine runs the
//! same pipeline concurrently; the first control plane to claim ownership
//! bootstraps the cluster with kubeadm and broadcasts the join command to the
//! rest.
//!
//! # Architecture
//!
//! - A [`registry::ProviderRegistry`] maps provider groups to actuator pairs
//! - [`orchestrate::create_cluster`] runs the cluster actuator, then fans one
//!   machine pipeline out per machine and drains every task before returning
//! - [`status::ClusterStatus`] carries the shared in-flight state: the control
//!   plane ownership gate, published endpoints, and the join command
//! - [`nat`] exposes the cluster behind a front end (LVS on a bastion host,
//!   a cloud load balancer, or nothing at all)
//!
//! # Modules
//!
//! - [`actuator`] - Cluster and machine reconciliation pipelines
//! - [`config`] - Provider configuration (NAT, SSH credentials, VM placement)
//! - [`error`] - Error types and retryability classification
//! - [`gate`] - Single-owner election plus broadcast-once readiness
//! - [`infra`] - Infrastructure client abstraction (images, VMs, networks)
//! - [`kubeadm`] - kubeadm config rendering and init output parsing
//! - [`model`] - Cluster and machine records and their on-disk manifest
//! - [`nat`] - NAT provisioners fronting the cluster's API and SSH
//! - [`orchestrate`] - Cluster-level create and delete entry points
//! - [`retry`] - Backoff retry and polling helpers
//! - [`shell`] - Remote command execution over SSH
//! - [`sshconf`] - Generated OpenSSH client configuration

pub mod actuator;
pub mod config;
pub mod error;
pub mod gate;
pub mod infra;
pub mod kubeadm;
pub mod labels;
pub mod model;
pub mod naming;
pub mod nat;
pub mod orchestrate;
pub mod registry;
pub mod retry;
pub mod roles;
pub mod shell;
pub mod sshconf;
pub mod status;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::{Error, Result};
pub use model::{Cluster, Machine};
pub use orchestrate::{create_cluster, delete_cluster};
pub use registry::ProviderRegistry;
pub use roles::MachineRole;

use std::sync::Arc;

use actuator::cluster::VmClusterActuator;
use actuator::machine::VmMachineActuator;
use infra::InfrastructureClient;
use nat::elb::LoadBalancerClient;
use nat::NatProvisioners;
use shell::ShellClient;

/// Build a registry with the VM provider wired under its default group.
pub fn vm_registry(
    infra: Arc<dyn InfrastructureClient>,
    shell: Arc<dyn ShellClient>,
    load_balancer: Arc<dyn LoadBalancerClient>,
) -> ProviderRegistry {
    let nat = NatProvisioners::new(shell.clone(), load_balancer);
    let mut registry = ProviderRegistry::new();
    registry.register(
        actuator::VM_PROVIDER_GROUP,
        Arc::new(VmClusterActuator::new(infra.clone(), nat.clone())),
        Arc::new(VmMachineActuator::new(infra, shell, nat)),
    );
    registry
}
