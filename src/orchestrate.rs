//! Cluster provisioning and teardown orchestration
//!
//! `create_cluster` runs the cluster actuator, then fans one machine
//! pipeline out per machine and waits for every task to finish, whether or
//! not one of them fails. The first failure is what the caller gets, but
//! no task is orphaned: the shared cancellation token is tripped so
//! remaining pipelines wind down, and their machine records (including any
//! error message) are collected before returning.
//!
//! `delete_cluster` is best effort in the other direction: every machine
//! delete runs to completion, then cluster-scoped teardown, then the local
//! configuration directory is removed. The first error is reported after
//! everything has been attempted.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::model::Cluster;
use crate::registry::ProviderRegistry;
use crate::status::ClusterStatus;

/// Provision the cluster and all of its machines
pub async fn create_cluster(
    cancel: &CancellationToken,
    registry: &ProviderRegistry,
    mut cluster: Cluster,
) -> Result<Cluster> {
    let actuators = registry.lookup(cluster.provider_group())?.clone();
    let status = ClusterStatus::new();

    info!(cluster = %cluster.name, machines = cluster.machines.len(), "creating cluster");
    actuators
        .cluster
        .reconcile(cancel, &mut cluster, &status)
        .await?;
    cluster.write_to_disk().await?;

    let machines = std::mem::take(&mut cluster.machines);
    let shared = Arc::new(cluster);
    let fanout_cancel = cancel.child_token();

    let mut tasks = JoinSet::new();
    for (index, mut machine) in machines.iter().cloned().enumerate() {
        let actuator = Arc::clone(&actuators.machine);
        let cluster = Arc::clone(&shared);
        let status = Arc::clone(&status);
        let cancel = fanout_cancel.clone();
        tasks.spawn(async move {
            let result = actuator
                .reconcile(&cancel, &cluster, &status, &mut machine)
                .await;
            if let Err(e) = &result {
                machine.status.error_message = Some(e.to_string());
            }
            (index, machine, result)
        });
    }

    // Every task is drained, error or not, so no pipeline keeps running
    // against a cluster the caller believes failed.
    let mut machines = machines;
    let mut first_error: Option<Error> = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, machine, result)) => {
                machines[index] = machine;
                if let Err(e) = result {
                    error!(cluster = %shared.name, machine = %machines[index].name, error = %e, "machine pipeline failed");
                    if first_error.is_none() {
                        first_error = Some(e);
                        fanout_cancel.cancel();
                    }
                }
            }
            Err(join_error) => {
                if first_error.is_none() {
                    first_error = Some(Error::provider(format!(
                        "machine pipeline panicked: {join_error}"
                    )));
                    fanout_cancel.cancel();
                }
            }
        }
    }

    let mut cluster = Arc::try_unwrap(shared)
        .map_err(|_| Error::provider("machine pipeline leaked a cluster handle"))?;
    cluster.machines = machines;
    cluster.write_to_disk().await?;

    match first_error {
        Some(e) => Err(e),
        None => {
            info!(cluster = %cluster.name, "cluster created");
            Ok(cluster)
        }
    }
}

/// Tear the cluster down, tolerating resources that were never created
pub async fn delete_cluster(
    cancel: &CancellationToken,
    registry: &ProviderRegistry,
    cluster: Cluster,
) -> Result<()> {
    let actuators = registry.lookup(cluster.provider_group())?.clone();
    info!(cluster = %cluster.name, "deleting cluster");

    let shared = Arc::new(cluster);
    let mut tasks = JoinSet::new();
    for machine in shared.machines.iter().cloned() {
        let actuator = Arc::clone(&actuators.machine);
        let cluster = Arc::clone(&shared);
        let cancel = cancel.clone();
        tasks.spawn(async move {
            let name = machine.name.clone();
            (name, actuator.delete(&cancel, &cluster, &machine).await)
        });
    }

    let mut first_error: Option<Error> = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((name, Err(e))) => {
                warn!(cluster = %shared.name, machine = %name, error = %e, "machine delete failed");
                first_error.get_or_insert(e);
            }
            Ok((_, Ok(()))) => {}
            Err(join_error) => {
                first_error.get_or_insert(Error::provider(format!(
                    "machine delete panicked: {join_error}"
                )));
            }
        }
    }

    if let Err(e) = actuators.cluster.delete(cancel, &shared).await {
        warn!(cluster = %shared.name, error = %e, "cluster delete failed");
        first_error.get_or_insert(e);
    }

    if first_error.is_none() {
        if let Some(dir) = shared.config_dir() {
            match tokio::fs::remove_dir_all(dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => first_error = Some(Error::io("config-dir", e)),
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => {
            info!(cluster = %shared.name, "cluster deleted");
            Ok(())
        }
    }
}
