//! Cluster manager: create, describe and delete the managed control plane

use std::time::Duration;

use tracing::info;

use crate::cloud::{
    wait_until, AutoModeConfig, CloudClients, ClusterDescription, ClusterStatus,
    CreateClusterRequest,
};
use crate::error::{Error, Result};
use crate::models::{Cluster, Infrastructure, IpFamily};

pub const CLUSTER_CREATION_TIMEOUT: Duration = Duration::from_secs(15 * 60);
pub const CLUSTER_DELETION_TIMEOUT: Duration = Duration::from_secs(15 * 60);
const CLUSTER_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Node pools auto mode enables on the control plane
const AUTO_MODE_NODE_POOLS: &[&str] = &["system"];

#[derive(Debug, Clone, Default)]
pub struct ClusterOptions {
    pub kubernetes_version: String,
    pub ip_family: IpFamily,
    pub auto_mode: bool,
    pub cluster_role_arn_override: Option<String>,
    pub creation_timeout: Option<Duration>,
    pub deletion_timeout: Option<Duration>,
}

pub struct ClusterManager {
    clients: CloudClients,
    resource_id: String,
}

impl ClusterManager {
    pub fn new(clients: CloudClients, resource_id: impl Into<String>) -> Self {
        Self {
            clients,
            resource_id: resource_id.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.resource_id
    }

    /// Build the create request for this run's cluster
    pub fn create_request(&self, infra: &Infrastructure, opts: &ClusterOptions) -> CreateClusterRequest {
        let role_arn = opts
            .cluster_role_arn_override
            .clone()
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| infra.cluster_role_arn.clone());

        let mut request = CreateClusterRequest {
            name: self.resource_id.clone(),
            version: opts.kubernetes_version.clone(),
            role_arn,
            subnet_ids: infra.subnets(),
            ip_family: opts.ip_family,
            endpoint_public_access: true,
            endpoint_private_access: true,
            tags: self.clients.endpoint.stack_tags(),
            ..Default::default()
        };
        if opts.auto_mode {
            request.auto_mode = Some(AutoModeConfig {
                node_role_arn: infra.node_role_arn.clone(),
                node_pools: AUTO_MODE_NODE_POOLS.iter().map(|s| s.to_string()).collect(),
            });
            request.block_storage_enabled = true;
            request.elastic_load_balancing_enabled = true;
            request.authentication_mode = Some("API".to_string());
            request.bootstrap_self_managed_addons = Some(false);
        }
        request
    }

    async fn describe(&self) -> Result<Option<ClusterDescription>> {
        let name = self.name();
        self.clients
            .call("DescribeCluster", || self.clients.eks.describe_cluster(name))
            .await
    }

    /// Create the cluster, or adopt an existing one, and wait for Active
    pub async fn create(&self, infra: &Infrastructure, opts: &ClusterOptions) -> Result<Cluster> {
        match self.describe().await? {
            Some(existing) => {
                info!(cluster = %existing.name, status = %existing.status, "Cluster already exists");
            }
            None => {
                let request = self.create_request(infra, opts);
                info!(cluster = %request.name, version = %request.version, "Creating cluster");
                let created = self
                    .clients
                    .call("CreateCluster", || self.clients.eks.create_cluster(&request))
                    .await?;
                info!(arn = %created.arn, "Cluster creation requested");
            }
        }

        let timeout = opts.creation_timeout.unwrap_or(CLUSTER_CREATION_TIMEOUT);
        info!(cluster = %self.name(), timeout_secs = timeout.as_secs(), "Waiting for cluster to be active");
        let description = wait_until(
            "cluster activation",
            self.name(),
            timeout,
            CLUSTER_POLL_INTERVAL,
            || async {
                let description = self
                    .describe()
                    .await?
                    .ok_or_else(|| Error::not_found("cluster", self.name()))?;
                Ok(is_active(&description)?.then_some(description))
            },
        )
        .await?;

        let cluster = to_cluster(&description, opts.ip_family)?;
        info!(cluster = %cluster.name, endpoint = %cluster.endpoint, "Cluster is active");
        Ok(cluster)
    }

    /// True when the cluster is Active, false while Creating
    pub async fn is_up(&self) -> Result<bool> {
        match self.describe().await? {
            Some(description) => is_active(&description),
            None => Err(Error::not_found("cluster", self.name())),
        }
    }

    /// Current cluster handle, if the cluster exists and is Active
    pub async fn get(&self, ip_family: IpFamily) -> Result<Option<Cluster>> {
        match self.describe().await? {
            Some(d) if d.status == ClusterStatus::Active => Ok(Some(to_cluster(&d, ip_family)?)),
            _ => Ok(None),
        }
    }

    /// Delete the cluster and wait until it is gone; a missing cluster is
    /// success
    pub async fn delete(&self, timeout: Option<Duration>) -> Result<()> {
        let name = self.name();
        let result = self
            .clients
            .call("DeleteCluster", || self.clients.eks.delete_cluster(name))
            .await;
        match result {
            Ok(()) => info!(cluster = %name, "Deleting cluster"),
            Err(e) if e.is_not_found() => {
                info!(cluster = %name, "Cluster does not exist");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        wait_until(
            "cluster deletion",
            name,
            timeout.unwrap_or(CLUSTER_DELETION_TIMEOUT),
            CLUSTER_POLL_INTERVAL,
            || async { Ok(self.describe().await?.is_none().then_some(())) },
        )
        .await?;
        info!(cluster = %name, "Deleted cluster");
        Ok(())
    }
}

/// Describe a cluster the tester did not create
pub async fn describe_static_cluster(
    clients: &CloudClients,
    name: &str,
    ip_family: IpFamily,
) -> Result<Cluster> {
    let description = clients
        .call("DescribeCluster", || clients.eks.describe_cluster(name))
        .await?
        .ok_or_else(|| Error::not_found("cluster", name))?;
    if !is_active(&description)? {
        return Err(Error::invalid_config(format!(
            "static cluster {} is not active: {}",
            name, description.status
        )));
    }
    to_cluster(&description, ip_family)
}

/// Active is up, Creating is not yet up, anything else is an error
pub fn is_active(description: &ClusterDescription) -> Result<bool> {
    match description.status {
        ClusterStatus::Active => Ok(true),
        ClusterStatus::Creating => Ok(false),
        other => Err(Error::cloud(
            "cluster status",
            format!("cluster {} is {}", description.name, other),
        )),
    }
}

/// Extract the handle, taking the service CIDR matching the IP family
pub fn to_cluster(description: &ClusterDescription, ip_family: IpFamily) -> Result<Cluster> {
    let missing = |field: &str| {
        Error::cloud(
            "DescribeCluster",
            format!("cluster {} has no {}", description.name, field),
        )
    };
    let service_cidr = match ip_family {
        IpFamily::Ipv4 => description.service_ipv4_cidr.clone(),
        IpFamily::Ipv6 => description.service_ipv6_cidr.clone(),
    }
    .ok_or_else(|| missing("service CIDR"))?;

    Ok(Cluster {
        arn: description.arn.clone(),
        name: description.name.clone(),
        endpoint: description.endpoint.clone().ok_or_else(|| missing("endpoint"))?,
        certificate_authority: description
            .certificate_authority
            .clone()
            .ok_or_else(|| missing("certificate authority"))?,
        service_cidr,
        security_group_id: description
            .security_group_id
            .clone()
            .ok_or_else(|| missing("security group"))?,
        version: description.version.clone(),
    })
}
