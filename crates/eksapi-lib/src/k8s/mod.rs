//! Kubernetes seam
//!
//! Everything the lifecycle engine does inside the cluster goes through
//! [`ClusterApi`]. [`KubeClusterApi`] implements it over kube-rs; tests
//! use mocks or the in-memory fake.

mod client;

#[cfg(test)]
pub mod fake;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::{CronJob, Job};
#[cfg(test)]
use mockall::automock;
use tracing::{debug, info, warn};
use url::Url;

pub use client::{node_info, KubeClusterApi};

use crate::cloud::{CloudClients, MetricUnit};
use crate::error::{Error, Result};
use crate::metrics::{MetricRegistry, MetricSpec};

/// Custom resource addressed through the dynamic API
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynamicResource {
    pub group: &'static str,
    pub version: &'static str,
    pub kind: &'static str,
    pub plural: &'static str,
}

impl DynamicResource {
    pub fn api_version(&self) -> String {
        format!("{}/{}", self.group, self.version)
    }
}

pub const NODE_CLASS: DynamicResource = DynamicResource {
    group: "eks.amazonaws.com",
    version: "v1",
    kind: "NodeClass",
    plural: "nodeclasses",
};

pub const NODE_POOL: DynamicResource = DynamicResource {
    group: "karpenter.sh",
    version: "v1",
    kind: "NodePool",
    plural: "nodepools",
};

pub const NODE_DIAGNOSTIC: DynamicResource = DynamicResource {
    group: "eks.amazonaws.com",
    version: "v1alpha1",
    kind: "NodeDiagnostic",
    plural: "nodediagnostics",
};

/// The parts of a Node object the tester reads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub name: String,
    pub provider_id: Option<String>,
    pub instance_type: String,
    pub os: String,
    pub os_image: String,
    pub arch: String,
    pub created: Option<DateTime<Utc>>,
    pub ready: bool,
    /// Last transition time of the Ready condition, when Ready
    pub ready_since: Option<DateTime<Utc>>,
}

/// Change to the set of Node objects
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    Applied(NodeInfo),
    Deleted(String),
    /// Full resync; replaces everything seen so far
    Restarted(Vec<NodeInfo>),
}

pub type NodeEventStream = BoxStream<'static, Result<NodeEvent>>;

/// Batch workload flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum JobKind {
    Job,
    CronJob,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::Job => write!(f, "Job"),
            JobKind::CronJob => write!(f, "CronJob"),
        }
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>>;

    /// Node changes, starting with a [`NodeEvent::Restarted`] of the
    /// current set
    fn watch_nodes(&self) -> NodeEventStream;

    /// `major.minor` of the API server
    async fn server_version(&self) -> Result<String>;

    /// Create the configmap, replacing its data if it already exists
    async fn apply_config_map(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<()>;

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()>;

    /// Existing namespaces are success
    async fn create_namespace(&self, name: &str) -> Result<()>;

    /// Foreground deletion; missing namespaces are success
    async fn delete_namespace(&self, name: &str) -> Result<()>;

    async fn namespace_exists(&self, name: &str) -> Result<bool>;

    /// Opaque secret holding `data` as string data
    async fn create_secret(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<()>;

    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>>;

    /// Existing jobs are success
    async fn create_job(&self, namespace: &str, job: Job) -> Result<()>;

    /// Existing cron jobs are success
    async fn create_cron_job(&self, namespace: &str, cron_job: CronJob) -> Result<()>;

    /// Succeeded pods of a Job, or of every Job a CronJob spawned
    async fn succeeded_pods(&self, namespace: &str, kind: JobKind, name: &str) -> Result<i32>;

    /// Foreground deletion with zero grace; missing jobs are success
    async fn delete_job(&self, namespace: &str, kind: JobKind, name: &str) -> Result<()>;

    async fn create_deployment(&self, namespace: &str, deployment: Deployment) -> Result<()>;

    /// Delete with zero grace period
    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()>;

    /// Cluster-scoped custom object; `None` if it does not exist
    async fn get_object(
        &self,
        resource: DynamicResource,
        name: &str,
    ) -> Result<Option<serde_json::Value>>;

    async fn create_object(&self, resource: DynamicResource, object: serde_json::Value) -> Result<()>;

    async fn delete_object(&self, resource: DynamicResource, name: &str) -> Result<()>;
}

/// Count nodes whose Ready condition is True
pub fn count_ready(nodes: &[NodeInfo]) -> usize {
    nodes.iter().filter(|n| n.ready).count()
}

/// Follow the node watch until `check` accepts the current node set
async fn watch_nodes_until<T>(
    api: &dyn ClusterApi,
    operation: &str,
    timeout: Duration,
    mut check: impl FnMut(&BTreeMap<String, NodeInfo>) -> Option<T>,
) -> Result<T> {
    let mut events = api.watch_nodes();
    let mut nodes: BTreeMap<String, NodeInfo> = BTreeMap::new();
    let watch = async {
        while let Some(event) = events.next().await {
            match event {
                Ok(NodeEvent::Applied(node)) => {
                    nodes.insert(node.name.clone(), node);
                }
                Ok(NodeEvent::Deleted(name)) => {
                    nodes.remove(&name);
                }
                Ok(NodeEvent::Restarted(all)) => {
                    nodes = all.into_iter().map(|n| (n.name.clone(), n)).collect();
                }
                Err(e) if e.is_retryable() => {
                    warn!(operation = %operation, error = %e, "Node watch failed, will retry");
                    continue;
                }
                Err(e) => return Err(e),
            }
            if let Some(value) = check(&nodes) {
                return Ok(value);
            }
        }
        Err(Error::transient(operation, "node watch ended"))
    };

    match tokio::time::timeout(timeout, watch).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(operation, "cluster", timeout)),
    }
}

/// Wait until at least `count` nodes are Ready and return them
pub async fn wait_for_ready_nodes(
    api: &dyn ClusterApi,
    count: usize,
    timeout: Duration,
) -> Result<Vec<NodeInfo>> {
    info!(nodes = count, timeout_secs = timeout.as_secs(), "Waiting for nodes to be ready");
    let ready = watch_nodes_until(api, "node readiness", timeout, |nodes| {
        let ready: Vec<NodeInfo> = nodes.values().filter(|n| n.ready).cloned().collect();
        debug!(ready = ready.len(), want = count, "Node readiness");
        (ready.len() >= count).then_some(ready)
    })
    .await?;
    info!(nodes = ready.len(), "Nodes are ready");
    Ok(ready)
}

/// Wait until the cluster has exactly `count` Node objects
pub async fn wait_for_node_count(api: &dyn ClusterApi, count: usize, timeout: Duration) -> Result<()> {
    info!(nodes = count, timeout_secs = timeout.as_secs(), "Waiting for node count");
    watch_nodes_until(api, "node count", timeout, |nodes| {
        (nodes.len() == count).then_some(())
    })
    .await
}

/// Location of an instance as encoded in a node's provider ID
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderId {
    pub availability_zone: String,
    pub instance_id: String,
}

/// Parse `aws:///<az>/<instance-id>`
pub fn parse_provider_id(provider_id: &str) -> Result<ProviderId> {
    let invalid = |why: &str| Error::invalid_config(format!("provider ID {:?}: {}", provider_id, why));
    let url = Url::parse(provider_id).map_err(|e| invalid(&e.to_string()))?;
    if url.scheme() != "aws" {
        return Err(invalid("scheme is not aws"));
    }
    let path = url.path();
    if path.is_empty() {
        return Err(invalid("empty path"));
    }
    let parts: Vec<&str> = path.split('/').collect();
    match parts.as_slice() {
        ["", az, instance] if !az.is_empty() && !instance.is_empty() => Ok(ProviderId {
            availability_zone: az.to_string(),
            instance_id: instance.to_string(),
        }),
        _ => Err(invalid("expected /<az>/<instance-id>")),
    }
}

pub const NODE_METRIC_NAMESPACE: &str = "nodes";

fn time_to_registration() -> MetricSpec {
    MetricSpec::deployer(NODE_METRIC_NAMESPACE, "TimeToRegistrationSeconds", MetricUnit::Seconds)
}

fn time_to_ready() -> MetricSpec {
    MetricSpec::deployer(NODE_METRIC_NAMESPACE, "TimeToReadySeconds", MetricUnit::Seconds)
}

/// Distribution name of an Amazon Linux OS image, e.g. `Amazon Linux 2023`
pub fn os_distro(os_image: &str) -> Option<String> {
    if !os_image.starts_with("Amazon Linux") {
        return None;
    }
    os_image.split('.').next().map(|s| s.trim().to_string())
}

/// Full and pared-down dimension sets for a node
pub fn node_dimensions(node: &NodeInfo) -> Vec<BTreeMap<String, String>> {
    let mut full = BTreeMap::new();
    full.insert("instanceType".to_string(), node.instance_type.clone());
    full.insert("os".to_string(), node.os.clone());
    full.insert("osImage".to_string(), node.os_image.clone());
    full.insert("arch".to_string(), node.arch.clone());

    let mut sets = Vec::with_capacity(2);
    match os_distro(&node.os_image) {
        Some(distro) => {
            full.insert("osDistro".to_string(), distro.clone());
            let mut pared = BTreeMap::new();
            pared.insert("osDistro".to_string(), distro);
            pared.insert("instanceType".to_string(), node.instance_type.clone());
            pared.insert("arch".to_string(), node.arch.clone());
            sets.push(full);
            sets.push(pared);
        }
        None => sets.push(full),
    }
    sets
}

/// Record time-to-registration and time-to-ready for every node
///
/// Both are measured from the backing instance's launch time. Nodes
/// without a parseable provider ID or a known instance are skipped.
pub async fn record_node_launch_metrics(
    clients: &CloudClients,
    nodes: &[NodeInfo],
    metrics: &MetricRegistry,
) -> Result<()> {
    let mut by_instance = BTreeMap::new();
    for node in nodes {
        let Some(raw) = node.provider_id.as_deref() else {
            continue;
        };
        match parse_provider_id(raw) {
            Ok(id) => {
                by_instance.insert(id.instance_id, node);
            }
            Err(e) => warn!(node = %node.name, error = %e, "Skipping node with unusable provider ID"),
        }
    }
    if by_instance.is_empty() {
        return Ok(());
    }

    let ids: Vec<String> = by_instance.keys().cloned().collect();
    let instances = clients
        .call("DescribeInstances", || clients.compute.describe_instances(&ids))
        .await?;

    for instance in instances {
        let Some(node) = by_instance.get(&instance.id) else {
            continue;
        };
        let registration = node
            .created
            .map(|c| (c - instance.launch_time).num_milliseconds() as f64 / 1000.0);
        let ready = node
            .ready_since
            .map(|r| (r - instance.launch_time).num_milliseconds() as f64 / 1000.0);

        for dims in node_dimensions(node) {
            if let Some(v) = registration {
                metrics.record(&time_to_registration(), v, dims.clone());
            }
            if let Some(v) = ready {
                metrics.record(&time_to_ready(), v, dims);
            }
        }
        debug!(node = %node.name, instance = %instance.id, "Recorded node launch metrics");
    }
    Ok(())
}
