//! Node manager
//!
//! Provisions worker nodes with one of three strategies and tears down
//! whatever any of them left behind. All strategies share the
//! instance-type resolution step.

pub mod auto;
pub mod efa;
mod managed;
pub mod unmanaged;
pub mod userdata;

use std::time::Duration;

use tracing::{info, warn};

use crate::cloud::CloudClients;
use crate::error::{Error, Result};
use crate::k8s::{wait_for_node_count, wait_for_ready_nodes, ClusterApi};
use crate::models::{Cluster, Infrastructure, NodeStrategy, UserDataFormat};
use crate::resolver::{resolve_instance_types, InstanceTypeRequest};

pub const NODE_CREATION_TIMEOUT: Duration = Duration::from_secs(20 * 60);
pub const NODE_DELETION_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Workload that keeps a static cluster's autoscaler busy
pub const STATIC_PLACEHOLDER_NAME: &str = "busybox-deployment";
const STATIC_NODE_READY_TIMEOUT: Duration = Duration::from_secs(15 * 60);
const STATIC_NODE_DELETION_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// What the node manager needs from the run's options
#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub strategy: NodeStrategy,
    pub nodes: u32,
    pub instance_types: Vec<String>,
    pub instance_type_archs: Vec<String>,
    pub ami: Option<String>,
    pub ami_type: Option<String>,
    pub user_data_format: UserDataFormat,
    pub kubernetes_version: String,
    pub nodeadm_feature_gates: Vec<String>,
    pub set_cluster_dns_ip: bool,
    pub efa: bool,
    pub capacity_reservation: bool,
    pub capacity_reservation_id: Option<String>,
    pub expected_ami: Option<String>,
    /// Preferred AZ order for single-zone placement
    pub az_hints: Vec<String>,
    pub node_creation_timeout: Duration,
    pub node_deletion_timeout: Duration,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            strategy: NodeStrategy::default(),
            nodes: 3,
            instance_types: Vec::new(),
            instance_type_archs: Vec::new(),
            ami: None,
            ami_type: None,
            user_data_format: UserDataFormat::default(),
            kubernetes_version: String::new(),
            nodeadm_feature_gates: Vec::new(),
            set_cluster_dns_ip: false,
            efa: false,
            capacity_reservation: false,
            capacity_reservation_id: None,
            expected_ami: None,
            az_hints: Vec::new(),
            node_creation_timeout: NODE_CREATION_TIMEOUT,
            node_deletion_timeout: NODE_DELETION_TIMEOUT,
        }
    }
}

impl NodeOptions {
    fn instance_type_request(&self) -> InstanceTypeRequest {
        InstanceTypeRequest {
            instance_types: self.instance_types.clone(),
            architectures: self.instance_type_archs.clone(),
            strategy: self.strategy,
            ami: self.ami.clone(),
            ami_type: self.ami_type.clone(),
        }
    }
}

pub struct NodeManager {
    clients: CloudClients,
    resource_id: String,
}

impl NodeManager {
    pub fn new(clients: CloudClients, resource_id: impl Into<String>) -> Self {
        Self {
            clients,
            resource_id: resource_id.into(),
        }
    }

    /// Resolve instance types and create nodes with the chosen strategy
    ///
    /// Returns the instance types actually used.
    pub async fn create(
        &self,
        infra: &Infrastructure,
        cluster: &Cluster,
        opts: &NodeOptions,
        k8s: Option<&dyn ClusterApi>,
    ) -> Result<Vec<String>> {
        let instance_types =
            resolve_instance_types(&self.clients, &opts.instance_type_request()).await?;
        info!(
            resource_id = %self.resource_id,
            strategy = %opts.strategy,
            nodes = opts.nodes,
            "Creating nodes"
        );
        match opts.strategy {
            NodeStrategy::Managed => {
                managed::create(&self.clients, &self.resource_id, infra, opts, &instance_types)
                    .await?
            }
            NodeStrategy::Unmanaged => {
                unmanaged::create(
                    &self.clients,
                    &self.resource_id,
                    infra,
                    cluster,
                    opts,
                    &instance_types,
                )
                .await?
            }
            NodeStrategy::Auto => {
                let api = k8s.ok_or_else(|| {
                    Error::invalid_config("auto nodes need a Kubernetes client")
                })?;
                auto::create(api, &self.resource_id, opts.nodes, &instance_types).await?
            }
        }
        Ok(instance_types)
    }

    /// Delete nodes of every strategy; missing resources are success
    ///
    /// The in-cluster objects of auto nodes can only be removed when a
    /// Kubernetes client is available, which is not the case for the
    /// janitor.
    pub async fn delete(&self, k8s: Option<&dyn ClusterApi>, auto_mode: bool, timeout: Duration) -> Result<()> {
        unmanaged::delete(&self.clients, &self.resource_id).await?;
        managed::delete(&self.clients, &self.resource_id, timeout).await?;
        if let (Some(api), true) = (k8s, auto_mode) {
            auto::delete(api, &self.resource_id).await?;
            wait_for_node_count(api, 0, timeout).await?;
        }
        Ok(())
    }
}

/// Check every instance of an auto scaling group runs `expected_ami`
pub async fn verify_group_ami(clients: &CloudClients, group: &str, expected_ami: &str) -> Result<()> {
    info!(group = %group, ami = %expected_ami, "Verifying AMI of auto scaling group");
    let asg = clients
        .call("DescribeAutoScalingGroups", || {
            clients.autoscaling.describe_auto_scaling_group(group)
        })
        .await?
        .ok_or_else(|| Error::not_found("auto scaling group", group))?;
    let instances = clients
        .call("DescribeInstances", || {
            clients.compute.describe_instances(&asg.instance_ids)
        })
        .await?;

    let mismatched: Vec<Error> = instances
        .iter()
        .filter(|i| i.image_id != expected_ami)
        .map(|i| {
            Error::invalid_config(format!(
                "instance {} of {} uses AMI {}, expected {}",
                i.id, group, i.image_id, expected_ami
            ))
        })
        .collect();
    Error::aggregate(mismatched)?;
    info!(group = %group, ami = %expected_ami, "Auto scaling group uses expected AMI");
    Ok(())
}

/// Scale an existing cluster to `nodes` Ready nodes with a placeholder
/// workload
pub async fn ensure_static_nodes(api: &dyn ClusterApi, nodes: u32) -> Result<()> {
    info!(nodes = nodes, "Deploying placeholder workload on static cluster");
    let deployment = auto::placeholder_deployment(STATIC_PLACEHOLDER_NAME, nodes);
    match api
        .create_deployment(auto::PLACEHOLDER_NAMESPACE, deployment)
        .await
    {
        Err(e) if e.is_conflict() => {
            info!(deployment = STATIC_PLACEHOLDER_NAME, "Placeholder workload already exists")
        }
        other => other?,
    }
    wait_for_ready_nodes(api, nodes as usize, STATIC_NODE_READY_TIMEOUT).await?;
    Ok(())
}

/// Remove the static cluster's placeholder workload and wait for the
/// autoscaler to drain every node
pub async fn teardown_static_nodes(api: &dyn ClusterApi) -> Result<()> {
    info!("Removing placeholder workload from static cluster");
    api.delete_deployment(auto::PLACEHOLDER_NAMESPACE, STATIC_PLACEHOLDER_NAME)
        .await?;
    if let Err(e) = wait_for_node_count(api, 0, STATIC_NODE_DELETION_TIMEOUT).await {
        warn!(error = %e, "Static cluster nodes were not drained");
        return Err(e);
    }
    Ok(())
}
