//! Stack provisioner for the run's network and IAM infrastructure
//!
//! Creates one stack named after the run's resource id, waits for a
//! terminal state and reads the infrastructure handle from its outputs.
//! Deletion sweeps the known leak classes first: instance profiles bound
//! to the node role, and CNI-owned network interfaces in the VPC.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{info, warn};

use crate::cloud::{
    wait_until, CloudClients, CreateStackRequest, InterfaceStatus, MetricUnit, Stack, StackStatus,
};
use crate::error::{Error, Result};
use crate::metrics::{MetricRegistry, MetricSpec};
use crate::models::Infrastructure;
use crate::resolver::{resolve_availability_zones, subnet_cidrs, ZoneRequest, INFRA_AZ_COUNT};

const INFRA_TEMPLATE: &str = include_str!("templates/infra.yaml");

pub const STACK_CREATION_TIMEOUT: Duration = Duration::from_secs(15 * 60);
pub const STACK_DELETION_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const ENI_AVAILABLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const STACK_POLL_INTERVAL: Duration = Duration::from_secs(15);
const ENI_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Tag keys the VPC CNI puts on interfaces it creates
pub const CNI_TAG_KEYS: [&str; 2] = [
    "node.k8s.amazonaws.com/createdAt",
    "eks:kubernetes-cni-node-name",
];

const METRIC_NAMESPACE: &str = "infrastructure";

fn stack_deletion_failed() -> MetricSpec {
    MetricSpec::deployer(METRIC_NAMESPACE, "StackDeletionFailed", MetricUnit::Count)
}

fn leaked_enis() -> MetricSpec {
    MetricSpec::deployer(METRIC_NAMESPACE, "LeakedENIs", MetricUnit::Count)
}

/// Stack-level knobs the lifecycle engine passes through
#[derive(Debug, Clone, Default)]
pub struct InfraStackOptions {
    pub zones: ZoneRequest,
    pub auto_mode: bool,
    pub cluster_role_service_principal: Option<String>,
}

pub struct InfrastructureManager {
    clients: CloudClients,
    resource_id: String,
    metrics: MetricRegistry,
}

impl InfrastructureManager {
    pub fn new(clients: CloudClients, resource_id: impl Into<String>, metrics: MetricRegistry) -> Self {
        Self {
            clients,
            resource_id: resource_id.into(),
            metrics,
        }
    }

    pub fn stack_name(&self) -> &str {
        &self.resource_id
    }

    async fn describe(&self) -> Result<Option<Stack>> {
        let name = self.stack_name();
        self.clients
            .call("DescribeStacks", || self.clients.stacks.describe_stack(name))
            .await
    }

    /// Create the infrastructure stack, or adopt it if it already exists
    pub async fn create(&self, opts: &InfraStackOptions) -> Result<Infrastructure> {
        if let Some(existing) = self.describe().await? {
            info!(stack = %existing.name, status = %existing.status, "Infrastructure stack already exists");
            let stack = self.wait_for_creation(existing).await?;
            return self.infrastructure_from(&stack, None).await;
        }

        let azs = resolve_availability_zones(&self.clients, &opts.zones).await?;
        let request = self.create_request(opts, &azs)?;

        info!(stack = %request.name, azs = ?azs, "Creating infrastructure stack");
        let stack_id = self
            .clients
            .call("CreateStack", || self.clients.stacks.create_stack(&request))
            .await?;
        info!(stack_id = %stack_id, "Waiting for infrastructure stack to be created");

        let stack = self.wait_for_creation_by_name().await?;
        let infra = self.infrastructure_from(&stack, Some(azs)).await?;
        info!(vpc = %infra.vpc, "Created infrastructure");
        Ok(infra)
    }

    fn create_request(&self, opts: &InfraStackOptions, azs: &[String]) -> Result<CreateStackRequest> {
        if azs.len() < INFRA_AZ_COUNT {
            return Err(Error::invalid_config(format!(
                "infrastructure stack needs {} availability zones, got {:?}",
                INFRA_AZ_COUNT, azs
            )));
        }
        // two public + two private subnets
        let cidrs = subnet_cidrs(INFRA_AZ_COUNT * 2)?;

        let mut parameters = BTreeMap::new();
        parameters.insert("ResourceId".to_string(), self.resource_id.clone());
        parameters.insert("Subnet01AZ".to_string(), azs[0].clone());
        parameters.insert("Subnet02AZ".to_string(), azs[1].clone());
        parameters.insert("AutoMode".to_string(), opts.auto_mode.to_string());
        parameters.insert("PublicSubnet01Block".to_string(), cidrs[0].clone());
        parameters.insert("PublicSubnet02Block".to_string(), cidrs[1].clone());
        parameters.insert("PrivateSubnet01Block".to_string(), cidrs[2].clone());
        parameters.insert("PrivateSubnet02Block".to_string(), cidrs[3].clone());
        if let Some(principal) = opts
            .cluster_role_service_principal
            .as_deref()
            .filter(|p| !p.is_empty())
        {
            parameters.insert(
                "AdditionalClusterRoleServicePrincipal".to_string(),
                principal.to_string(),
            );
        }

        Ok(CreateStackRequest {
            name: self.resource_id.clone(),
            template_body: INFRA_TEMPLATE.to_string(),
            parameters,
            tags: self.clients.endpoint.stack_tags(),
        })
    }

    async fn wait_for_creation_by_name(&self) -> Result<Stack> {
        let stack = self
            .describe()
            .await?
            .ok_or_else(|| Error::not_found("stack", self.stack_name()))?;
        self.wait_for_creation(stack).await
    }

    async fn wait_for_creation(&self, stack: Stack) -> Result<Stack> {
        let stack = if stack.status.is_create_terminal() {
            stack
        } else {
            wait_for_stack_creation(&self.clients, self.stack_name(), STACK_CREATION_TIMEOUT).await?
        };
        ensure_created(&stack)?;
        Ok(stack)
    }

    /// Read the infrastructure handle of an existing stack
    pub async fn get(&self) -> Result<Option<Infrastructure>> {
        match self.describe().await? {
            Some(stack) if stack.status.is_create_success() => {
                Ok(Some(self.infrastructure_from(&stack, None).await?))
            }
            _ => Ok(None),
        }
    }

    async fn infrastructure_from(
        &self,
        stack: &Stack,
        azs: Option<Vec<String>>,
    ) -> Result<Infrastructure> {
        let mut infra = parse_outputs(&stack.outputs)?;
        infra.availability_zones = match azs {
            Some(azs) => azs,
            None => self.subnet_zones(&infra.subnets_private).await?,
        };
        Ok(infra)
    }

    async fn subnet_zones(&self, subnet_ids: &[String]) -> Result<Vec<String>> {
        let subnets = self
            .clients
            .call("DescribeSubnets", || self.clients.compute.describe_subnets(subnet_ids))
            .await?;
        let mut zones: Vec<String> = Vec::new();
        for id in subnet_ids {
            if let Some(subnet) = subnets.iter().find(|s| &s.id == id) {
                if !zones.contains(&subnet.availability_zone) {
                    zones.push(subnet.availability_zone.clone());
                }
            }
        }
        Ok(zones)
    }

    /// Delete the stack after sweeping leaked instance profiles
    ///
    /// A missing stack is success. A deletion that does not complete is
    /// recorded and logged but not returned as an error; the janitor
    /// re-drives it later.
    pub async fn delete(&self) -> Result<()> {
        let Some(stack) = self.describe().await? else {
            info!(stack = %self.stack_name(), "Infrastructure stack does not exist");
            return Ok(());
        };
        if stack.status == StackStatus::DeleteComplete {
            return Ok(());
        }

        if let Ok(infra) = parse_outputs(&stack.outputs) {
            self.delete_leaked_instance_profiles(&infra.node_role_name).await?;
        }

        info!(stack = %self.stack_name(), "Deleting infrastructure stack");
        let name = self.stack_name();
        self.clients
            .call("DeleteStack", || self.clients.stacks.delete_stack(name))
            .await?;

        if let Err(e) = wait_for_stack_deletion(&self.clients, name, STACK_DELETION_TIMEOUT).await {
            warn!(stack = %name, error = %e, "Infrastructure stack deletion did not complete");
            self.metrics
                .record(&stack_deletion_failed(), 1.0, BTreeMap::new());
            return Ok(());
        }
        info!(stack = %name, "Deleted infrastructure stack");
        Ok(())
    }

    /// Remove instance profiles the cluster's compute feature created
    /// for the node role
    pub async fn delete_leaked_instance_profiles(&self, node_role_name: &str) -> Result<()> {
        if node_role_name.is_empty() {
            return Ok(());
        }
        let profiles = self
            .clients
            .call("ListInstanceProfilesForRole", || {
                self.clients.identity.list_instance_profiles_for_role(node_role_name)
            })
            .await;
        let profiles = match profiles {
            Ok(p) => p,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };

        for profile in &profiles {
            info!(profile = %profile, role = %node_role_name, "Deleting leaked instance profile");
            let detached = self
                .clients
                .call("RemoveRoleFromInstanceProfile", || {
                    self.clients
                        .identity
                        .remove_role_from_instance_profile(profile, node_role_name)
                })
                .await;
            match detached {
                Err(e) if !e.is_not_found() => return Err(e),
                _ => {}
            }
            let deleted = self
                .clients
                .call("DeleteInstanceProfile", || {
                    self.clients.identity.delete_instance_profile(profile)
                })
                .await;
            match deleted {
                Err(e) if !e.is_not_found() => return Err(e),
                _ => {}
            }
        }
        Ok(())
    }

    /// Delete CNI-owned interfaces left in the VPC so the security group
    /// and subnets can go
    pub async fn delete_leaked_enis(&self) -> Result<()> {
        let Some(stack) = self.describe().await? else {
            return Ok(());
        };
        let Ok(infra) = parse_outputs(&stack.outputs) else {
            return Ok(());
        };
        let vpc = infra.vpc.as_str();
        let tag_keys: Vec<String> = CNI_TAG_KEYS.iter().map(|s| s.to_string()).collect();

        let interfaces = self
            .clients
            .call("DescribeNetworkInterfaces", || {
                self.clients.compute.describe_network_interfaces(vpc, &tag_keys)
            })
            .await?;
        let ids: Vec<String> = interfaces.iter().map(|i| i.id.clone()).collect();
        if ids.is_empty() {
            info!(vpc = %vpc, "No leaked network interfaces");
            self.metrics.record(&leaked_enis(), 0.0, BTreeMap::new());
            return Ok(());
        }

        info!(vpc = %vpc, count = ids.len(), "Waiting for leaked network interfaces to become available");
        wait_until(
            "network interfaces available",
            vpc,
            ENI_AVAILABLE_TIMEOUT,
            ENI_POLL_INTERVAL,
            || async {
                let current = self
                    .clients
                    .call("DescribeNetworkInterfaces", || {
                        self.clients.compute.describe_network_interfaces(vpc, &tag_keys)
                    })
                    .await?;
                let pending = current
                    .iter()
                    .filter(|i| ids.contains(&i.id) && i.status != InterfaceStatus::Available)
                    .count();
                Ok((pending == 0).then_some(()))
            },
        )
        .await?;

        for id in &ids {
            info!(eni = %id, "Deleting leaked network interface");
            let result = self
                .clients
                .call("DeleteNetworkInterface", || {
                    self.clients.compute.delete_network_interface(id)
                })
                .await;
            match result {
                Err(e) if !e.is_not_found() => return Err(e),
                _ => {}
            }
        }
        self.metrics
            .record(&leaked_enis(), ids.len() as f64, BTreeMap::new());
        Ok(())
    }
}

/// Fail unless the stack finished creating successfully
pub fn ensure_created(stack: &Stack) -> Result<()> {
    if stack.status.is_create_success() {
        return Ok(());
    }
    Err(Error::cloud(
        "stack creation",
        format!(
            "stack {} ended in {}: {}",
            stack.name,
            stack.status,
            stack.status_reason.as_deref().unwrap_or("no reason given")
        ),
    ))
}

/// Poll a stack until creation reaches a terminal state
pub async fn wait_for_stack_creation(
    clients: &CloudClients,
    name: &str,
    timeout: Duration,
) -> Result<Stack> {
    wait_until("stack creation", name, timeout, STACK_POLL_INTERVAL, || async {
        let stack = clients
            .call("DescribeStacks", || clients.stacks.describe_stack(name))
            .await?
            .ok_or_else(|| Error::not_found("stack", name))?;
        Ok(stack.status.is_create_terminal().then_some(stack))
    })
    .await
}

/// Poll until the stack is gone or reports DELETE_COMPLETE
pub async fn wait_for_stack_deletion(
    clients: &CloudClients,
    name: &str,
    timeout: Duration,
) -> Result<()> {
    wait_until("stack deletion", name, timeout, STACK_POLL_INTERVAL, || async {
        match clients
            .call("DescribeStacks", || clients.stacks.describe_stack(name))
            .await?
        {
            None => Ok(Some(())),
            Some(s) if s.status == StackStatus::DeleteComplete => Ok(Some(())),
            Some(s) if s.status == StackStatus::DeleteFailed => Err(Error::cloud(
                "stack deletion",
                format!(
                    "stack {} DELETE_FAILED: {}",
                    name,
                    s.status_reason.unwrap_or_default()
                ),
            )),
            Some(_) => Ok(None),
        }
    })
    .await
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Build the infrastructure handle from stack outputs
pub fn parse_outputs(outputs: &BTreeMap<String, String>) -> Result<Infrastructure> {
    let get = |key: &str| {
        outputs
            .get(key)
            .cloned()
            .ok_or_else(|| Error::cloud("stack outputs", format!("missing output {}", key)))
    };
    let node_role_arn = get("NodeRole")?;
    let node_role_name = node_role_arn
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string();

    Ok(Infrastructure {
        vpc: get("VPC")?,
        subnets_public: split_list(&get("SubnetsPublic")?),
        subnets_private: split_list(&get("SubnetsPrivate")?),
        cluster_role_arn: get("ClusterRole")?,
        node_role_arn,
        node_role_name,
        availability_zones: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::fake::FakeCloud;
    use crate::cloud::{AvailabilityZone, NetworkInterface};

    const RESOURCE_ID: &str = "kubetest2-eksapi-test";

    fn manager(fake: &FakeCloud, metrics: &MetricRegistry) -> InfrastructureManager {
        InfrastructureManager::new(fake.clients(), RESOURCE_ID, metrics.clone())
    }

    fn options() -> InfraStackOptions {
        InfraStackOptions {
            zones: ZoneRequest {
                zone_type: "availability-zone".into(),
                node_count: 3,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn seed_zones(fake: &FakeCloud) {
        fake.set_zones(
            ["us-west-2a", "us-west-2b", "us-west-2c"]
                .iter()
                .map(|n| AvailabilityZone {
                    name: n.to_string(),
                    zone_type: "availability-zone".into(),
                })
                .collect(),
        );
    }

    #[test]
    fn test_parse_outputs() {
        let mut outputs = BTreeMap::new();
        outputs.insert("VPC".to_string(), "vpc-1".to_string());
        outputs.insert("SubnetsPublic".to_string(), "subnet-a,subnet-b".to_string());
        outputs.insert("SubnetsPrivate".to_string(), "subnet-c, subnet-d".to_string());
        outputs.insert("ClusterRole".to_string(), "arn:aws:iam::1:role/cluster".to_string());
        outputs.insert(
            "NodeRole".to_string(),
            "arn:aws:iam::1:role/path/kubetest2-node".to_string(),
        );

        let infra = parse_outputs(&outputs).unwrap();
        assert_eq!(infra.vpc, "vpc-1");
        assert_eq!(infra.subnets_public, vec!["subnet-a", "subnet-b"]);
        assert_eq!(infra.subnets_private, vec!["subnet-c", "subnet-d"]);
        assert_eq!(infra.node_role_name, "kubetest2-node");

        outputs.remove("VPC");
        assert!(parse_outputs(&outputs).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_builds_two_by_two_subnets() {
        let fake = FakeCloud::new();
        seed_zones(&fake);
        let metrics = MetricRegistry::noop();

        let infra = manager(&fake, &metrics).create(&options()).await.unwrap();
        assert_eq!(infra.subnets_public.len(), 2);
        assert_eq!(infra.subnets_private.len(), 2);
        assert_eq!(infra.availability_zones, vec!["us-west-2a", "us-west-2b"]);

        let request = fake.created_stack_request(RESOURCE_ID).unwrap();
        assert_eq!(request.parameters["Subnet01AZ"], "us-west-2a");
        assert_eq!(request.parameters["AutoMode"], "false");
        assert_eq!(request.parameters["PrivateSubnet02Block"], "192.168.192.0/18");
        assert!(!request.parameters.contains_key("AdditionalClusterRoleServicePrincipal"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_is_idempotent() {
        let fake = FakeCloud::new();
        seed_zones(&fake);
        let metrics = MetricRegistry::noop();
        let mgr = manager(&fake, &metrics);

        let first = mgr.create(&options()).await.unwrap();
        let second = mgr.create(&options()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(fake.create_stack_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_endpoint_tag_attached() {
        let fake = FakeCloud::new();
        seed_zones(&fake);
        let mut clients = fake.clients();
        clients.endpoint.endpoint_url = Some("https://eks.gamma.example.com".into());
        let mgr = InfrastructureManager::new(clients, RESOURCE_ID, MetricRegistry::noop());

        mgr.create(&options()).await.unwrap();
        let request = fake.created_stack_request(RESOURCE_ID).unwrap();
        assert_eq!(
            request.tags.get("endpoint-url").map(String::as_str),
            Some("https://eks.gamma.example.com")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_creation_is_error() {
        let fake = FakeCloud::new();
        seed_zones(&fake);
        fake.fail_stack_creation(RESOURCE_ID, "VPC limit exceeded");

        let err = manager(&fake, &MetricRegistry::noop())
            .create(&options())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("VPC limit exceeded"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_missing_stack_is_success() {
        let fake = FakeCloud::new();
        manager(&fake, &MetricRegistry::noop()).delete().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_sweeps_instance_profiles_first() {
        let fake = FakeCloud::new();
        seed_zones(&fake);
        let metrics = MetricRegistry::noop();
        let mgr = manager(&fake, &metrics);
        let infra = mgr.create(&options()).await.unwrap();
        fake.add_instance_profile("eks-auto-profile", &infra.node_role_name);

        mgr.delete().await.unwrap();
        assert!(fake.instance_profiles_for(&infra.node_role_name).is_empty());
        assert!(fake.stack(RESOURCE_ID).is_none());
        let calls = fake.calls();
        let profile_idx = calls.iter().position(|c| c == "DeleteInstanceProfile").unwrap();
        let stack_idx = calls.iter().position(|c| c == "DeleteStack").unwrap();
        assert!(profile_idx < stack_idx);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_deletion_is_advisory() {
        let fake = FakeCloud::new();
        seed_zones(&fake);
        let metrics = MetricRegistry::noop();
        let mgr = manager(&fake, &metrics);
        mgr.create(&options()).await.unwrap();
        fake.fail_stack_deletion(RESOURCE_ID);

        mgr.delete().await.unwrap();
        let samples = metrics.snapshot();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].metric, "StackDeletionFailed");
        assert_eq!(samples[0].namespace, "kubetest2/eksapi/infrastructure");
    }

    #[tokio::test(start_paused = true)]
    async fn test_leaked_enis_wait_then_delete() {
        let fake = FakeCloud::new();
        seed_zones(&fake);
        let metrics = MetricRegistry::noop();
        let mgr = manager(&fake, &metrics);
        let infra = mgr.create(&options()).await.unwrap();

        for id in ["eni-1", "eni-2"] {
            fake.add_network_interface(
                &infra.vpc,
                NetworkInterface {
                    id: id.to_string(),
                    status: InterfaceStatus::InUse,
                },
                // becomes available after three describes
                3,
            );
        }

        mgr.delete_leaked_enis().await.unwrap();
        assert!(fake.network_interfaces(&infra.vpc).is_empty());

        let samples = metrics.snapshot();
        let leaked = samples.iter().find(|s| s.metric == "LeakedENIs").unwrap();
        assert_eq!(leaked.value, 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leaked_enis_timeout() {
        let fake = FakeCloud::new();
        seed_zones(&fake);
        let metrics = MetricRegistry::noop();
        let mgr = manager(&fake, &metrics);
        let infra = mgr.create(&options()).await.unwrap();
        fake.add_network_interface(
            &infra.vpc,
            NetworkInterface {
                id: "eni-stuck".into(),
                status: InterfaceStatus::InUse,
            },
            u32::MAX,
        );

        let err = mgr.delete_leaked_enis().await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }
}
