//! Virtualization platform seam
//!
//! The actuators never talk to a virtualization backend directly; they go
//! through [`InfrastructureClient`], which exposes the handful of
//! operations the lifecycle pipelines need. Handles for images and
//! machines are opaque provider ids. Tests substitute the generated mock.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::MachineProviderConfig;

use crate::error::Result;

#[cfg(test)]
use mockall::automock;

/// Operations the lifecycle pipelines require from a virtualization backend
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InfrastructureClient: Send + Sync {
    /// Look up a machine by name, returning its provider id
    async fn find_machine(&self, name: &str) -> Result<Option<String>>;

    /// Look up a previously imported machine image by name
    async fn find_image(&self, name: &str) -> Result<Option<String>>;

    /// Import the machine image from `source`, returning its provider id
    async fn import_image(&self, source: &str, name: &str) -> Result<String>;

    /// Create a machine from an image. Returns the machine's provider id;
    /// the machine is left powered off.
    async fn create_machine(
        &self,
        name: &str,
        image_id: &str,
        provider: &MachineProviderConfig,
    ) -> Result<String>;

    /// Power the machine on, tolerant of already-running machines
    async fn power_on(&self, machine_id: &str) -> Result<()>;

    /// Power the machine off, tolerant of already-off machines
    async fn power_off(&self, machine_id: &str) -> Result<()>;

    /// Destroy the machine and its disks
    async fn destroy(&self, machine_id: &str) -> Result<()>;

    /// Wait until the machine's primary adapter reports addresses
    async fn wait_for_network(
        &self,
        machine_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>>;
}
