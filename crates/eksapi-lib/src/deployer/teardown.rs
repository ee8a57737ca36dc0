//! Teardown chain shared by Down and the janitor

use std::time::Duration;

use tracing::info;

use crate::cloud::CloudClients;
use crate::cluster::ClusterManager;
use crate::error::{Error, Result};
use crate::k8s::ClusterApi;
use crate::metrics::MetricRegistry;
use crate::nodes::{NodeManager, NODE_DELETION_TIMEOUT};
use crate::observability::ProgressLogger;
use crate::stack::InfrastructureManager;

#[derive(Debug, Clone)]
pub struct TeardownOptions {
    /// Also remove in-cluster node pools; needs a cluster client
    pub auto_mode: bool,
    pub node_deletion_timeout: Duration,
    pub cluster_deletion_timeout: Option<Duration>,
}

impl Default for TeardownOptions {
    fn default() -> Self {
        Self {
            auto_mode: false,
            node_deletion_timeout: NODE_DELETION_TIMEOUT,
            cluster_deletion_timeout: None,
        }
    }
}

/// Delete everything a run created, in reverse creation order
///
/// Node and cluster failures are returned once every step has been
/// attempted. Leaked interfaces and the infrastructure stack are
/// advisory; the janitor retries them.
pub async fn teardown(
    clients: &CloudClients,
    resource_id: &str,
    k8s: Option<&dyn ClusterApi>,
    opts: &TeardownOptions,
    metrics: &MetricRegistry,
    progress: &ProgressLogger,
) -> Result<()> {
    let mut errors = Vec::new();

    let nodes = NodeManager::new(clients.clone(), resource_id);
    if let Err(e) = progress
        .step(
            "delete nodes",
            resource_id,
            nodes.delete(k8s, opts.auto_mode, opts.node_deletion_timeout),
        )
        .await
    {
        errors.push(e);
    }

    // interfaces must go after the nodes and before the cluster
    let infra = InfrastructureManager::new(clients.clone(), resource_id, metrics.clone());
    progress
        .advisory(
            "delete leaked network interfaces",
            resource_id,
            infra.delete_leaked_enis(),
        )
        .await;

    let cluster = ClusterManager::new(clients.clone(), resource_id);
    if let Err(e) = progress
        .step(
            "delete cluster",
            resource_id,
            cluster.delete(opts.cluster_deletion_timeout),
        )
        .await
    {
        errors.push(e);
    }

    progress
        .advisory("delete infrastructure stack", resource_id, infra.delete())
        .await;

    if errors.is_empty() {
        info!(resource_id = %resource_id, "Teardown complete");
    }
    Error::aggregate(errors)
}
