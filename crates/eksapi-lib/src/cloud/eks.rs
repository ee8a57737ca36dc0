//! Managed-Kubernetes control plane seam

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::error::Result;
use crate::models::IpFamily;

/// Compute-managed ("auto mode") block of a cluster create request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoModeConfig {
    pub node_role_arn: String,
    pub node_pools: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateClusterRequest {
    pub name: String,
    pub version: String,
    pub role_arn: String,
    pub subnet_ids: Vec<String>,
    pub ip_family: IpFamily,
    pub endpoint_public_access: bool,
    pub endpoint_private_access: bool,
    pub auto_mode: Option<AutoModeConfig>,
    pub block_storage_enabled: bool,
    pub elastic_load_balancing_enabled: bool,
    /// `API`, `API_AND_CONFIG_MAP` or `CONFIG_MAP`
    pub authentication_mode: Option<String>,
    pub bootstrap_self_managed_addons: Option<bool>,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterStatus {
    Creating,
    Active,
    Deleting,
    Failed,
    Updating,
    Pending,
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClusterStatus::Creating => "CREATING",
            ClusterStatus::Active => "ACTIVE",
            ClusterStatus::Deleting => "DELETING",
            ClusterStatus::Failed => "FAILED",
            ClusterStatus::Updating => "UPDATING",
            ClusterStatus::Pending => "PENDING",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterDescription {
    pub name: String,
    pub arn: String,
    pub status: ClusterStatus,
    pub version: String,
    pub endpoint: Option<String>,
    pub certificate_authority: Option<String>,
    pub security_group_id: Option<String>,
    pub service_ipv4_cidr: Option<String>,
    pub service_ipv6_cidr: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateNodegroupRequest {
    pub cluster_name: String,
    pub name: String,
    pub node_role_arn: String,
    pub subnet_ids: Vec<String>,
    pub disk_size_gib: u32,
    pub capacity_type: String,
    pub min_size: u32,
    pub max_size: u32,
    pub desired_size: u32,
    pub ami_type: String,
    pub instance_types: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodegroupStatus {
    Creating,
    Active,
    Updating,
    Deleting,
    CreateFailed,
    DeleteFailed,
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nodegroup {
    pub name: String,
    pub status: NodegroupStatus,
    /// Names of the auto-scaling groups backing this node group
    pub auto_scaling_groups: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddonStatus {
    Creating,
    Active,
    CreateFailed,
    Updating,
    Deleting,
    DeleteFailed,
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Addon {
    pub name: String,
    pub version: String,
    pub status: AddonStatus,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterControlApi: Send + Sync {
    async fn create_cluster(&self, request: &CreateClusterRequest) -> Result<ClusterDescription>;

    /// `None` if the cluster does not exist
    async fn describe_cluster(&self, name: &str) -> Result<Option<ClusterDescription>>;

    /// Returns `Error::NotFound` if the cluster does not exist
    async fn delete_cluster(&self, name: &str) -> Result<()>;

    /// Kubernetes version new clusters get when none is requested
    async fn default_kubernetes_version(&self) -> Result<String>;

    async fn create_nodegroup(&self, request: &CreateNodegroupRequest) -> Result<()>;

    async fn describe_nodegroup(&self, cluster: &str, name: &str) -> Result<Option<Nodegroup>>;

    /// Returns `Error::NotFound` if the node group does not exist
    async fn delete_nodegroup(&self, cluster: &str, name: &str) -> Result<()>;

    /// Resolve `latest` or `default` to a concrete add-on version
    async fn resolve_addon_version(
        &self,
        addon: &str,
        kubernetes_version: &str,
        default_version: bool,
    ) -> Result<String>;

    async fn create_addon(&self, cluster: &str, addon: &str, version: &str) -> Result<()>;

    async fn describe_addon(&self, cluster: &str, addon: &str) -> Result<Option<Addon>>;

    async fn delete_addon(&self, cluster: &str, addon: &str) -> Result<()>;
}
