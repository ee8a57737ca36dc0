//! In-memory cloud used by multi-phase tests
//!
//! One `FakeCloud` implements every service seam against shared state, so
//! a test can drive create, describe and delete across components and then
//! inspect what is left behind.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use super::*;
use crate::error::{Error, Result};
use crate::models::Architecture;
use crate::resolver::default_instance_types;

pub const FAKE_ACCOUNT: &str = "123456789012";
pub const FAKE_ENDPOINT: &str = "https://ABCDEF.gr7.us-west-2.eks.amazonaws.com";
pub const FAKE_CA: &str = "LS0tLS1CRUdJTiBDRVJUSUZJQ0FURS0tLS0tCg==";
pub const FAKE_SERVICE_CIDR: &str = "10.100.0.0/16";
pub const FAKE_SECURITY_GROUP: &str = "sg-0cluster";
pub const FAKE_MANAGED_AMI: &str = "ami-0managed";

struct FakeInterface {
    vpc: String,
    interface: NetworkInterface,
    describes_until_available: u32,
}

struct FakeCluster {
    description: ClusterDescription,
    polls_until_active: u32,
}

#[derive(Default)]
struct State {
    zones: Vec<AvailabilityZone>,
    offerings: Vec<InstanceTypeOffering>,
    instance_types: BTreeMap<String, InstanceTypeInfo>,
    images: BTreeMap<String, ImageInfo>,
    reservations: Vec<CapacityReservation>,
    interfaces: Vec<FakeInterface>,
    subnets: BTreeMap<String, String>,
    instances: BTreeMap<String, Instance>,
    instance_names: BTreeMap<String, Vec<String>>,
    next_instance: u32,

    stacks: BTreeMap<String, Stack>,
    stack_requests: BTreeMap<String, CreateStackRequest>,
    create_stack_calls: u32,
    failing_creations: BTreeMap<String, String>,
    stuck_deletions: BTreeSet<String>,

    groups: BTreeMap<String, AutoScalingGroup>,

    clusters: BTreeMap<String, FakeCluster>,
    cluster_requests: Vec<CreateClusterRequest>,
    cluster_activation_polls: u32,
    default_version: String,
    nodegroups: BTreeMap<(String, String), Nodegroup>,
    nodegroup_requests: Vec<CreateNodegroupRequest>,
    addons: BTreeMap<(String, String), Addon>,

    instance_profiles: BTreeMap<String, String>,
    objects: BTreeMap<(String, String), Vec<u8>>,
    parameters: BTreeMap<String, String>,
    metric_batches: Vec<(String, Vec<MetricDatum>)>,
    documents: BTreeSet<String>,
    commands: Vec<SendCommandRequest>,
    invocation_status: BTreeMap<String, InvocationStatus>,

    transient_failures: BTreeMap<String, u32>,
    calls: Vec<String>,
}

/// Shared in-memory cloud
#[derive(Clone)]
pub struct FakeCloud {
    state: Arc<Mutex<State>>,
}

impl Default for FakeCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCloud {
    pub fn new() -> Self {
        let state = State {
            default_version: "1.31".to_string(),
            cluster_activation_polls: 1,
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Client bundle backed by this fake, with millisecond retry delays
    pub fn clients(&self) -> CloudClients {
        let handle = Arc::new(self.clone());
        CloudClients {
            endpoint: CloudEndpoint {
                region: Some("us-west-2".to_string()),
                endpoint_url: None,
            },
            compute: handle.clone(),
            stacks: handle.clone(),
            autoscaling: handle.clone(),
            eks: handle.clone(),
            identity: handle.clone(),
            object_store: handle.clone(),
            parameters: handle.clone(),
            monitoring: handle.clone(),
            remote_command: handle,
            retry: RetryConfig {
                max_attempts: 3,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                backoff_multiplier: 2.0,
            },
        }
    }

    /// Record a call and consume any injected transient failure for it
    fn enter(&self, operation: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(operation.to_string());
        if let Some(remaining) = state.transient_failures.get_mut(operation) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::transient(operation, "throttled"));
            }
        }
        Ok(())
    }

    // ---- seeding ----------------------------------------------------------

    pub fn set_zones(&self, zones: Vec<AvailabilityZone>) {
        self.lock().zones = zones;
    }

    pub fn add_offering(&self, instance_type: &str, az: &str) {
        self.lock().offerings.push(InstanceTypeOffering {
            instance_type: instance_type.to_string(),
            availability_zone: az.to_string(),
        });
    }

    pub fn add_capacity_reservation(&self, reservation: CapacityReservation) {
        self.lock().reservations.push(reservation);
    }

    pub fn add_instance_type(&self, name: &str, arch: Architecture, efa: bool, network_cards: u32) {
        self.lock().instance_types.insert(
            name.to_string(),
            InstanceTypeInfo {
                instance_type: name.to_string(),
                architectures: vec![arch],
                efa_supported: efa,
                maximum_network_cards: network_cards,
            },
        );
    }

    pub fn register_default_instance_types(&self) {
        for arch in [Architecture::X86_64, Architecture::Arm64] {
            for name in default_instance_types(arch) {
                self.add_instance_type(&name, arch, false, 1);
            }
        }
    }

    pub fn add_image(&self, image_id: &str, arch: Architecture) {
        self.lock().images.insert(
            image_id.to_string(),
            ImageInfo {
                image_id: image_id.to_string(),
                name: format!("{}-name", image_id),
                architecture: arch,
            },
        );
    }

    pub fn set_parameter(&self, name: &str, value: &str) {
        self.lock()
            .parameters
            .insert(name.to_string(), value.to_string());
    }

    pub fn set_default_version(&self, version: &str) {
        self.lock().default_version = version.to_string();
    }

    /// Number of describes a new cluster reports CREATING before ACTIVE
    pub fn set_cluster_activation_polls(&self, polls: u32) {
        self.lock().cluster_activation_polls = polls;
    }

    /// Interface that turns available after `describes` listings
    pub fn add_network_interface(&self, vpc: &str, interface: NetworkInterface, describes: u32) {
        self.lock().interfaces.push(FakeInterface {
            vpc: vpc.to_string(),
            interface,
            describes_until_available: describes,
        });
    }

    pub fn add_instance_profile(&self, profile: &str, role: &str) {
        self.lock()
            .instance_profiles
            .insert(profile.to_string(), role.to_string());
    }

    pub fn add_instance(&self, instance_type: &str, image_id: &str, name_tag: Option<&str>) -> String {
        let mut state = self.lock();
        Self::launch(&mut state, instance_type, image_id, name_tag)
    }

    /// Insert a stack directly, bypassing creation
    pub fn insert_stack(&self, stack: Stack) {
        self.lock().stacks.insert(stack.name.clone(), stack);
    }

    pub fn fail_stack_creation(&self, name: &str, reason: &str) {
        self.lock()
            .failing_creations
            .insert(name.to_string(), reason.to_string());
    }

    pub fn fail_stack_deletion(&self, name: &str) {
        self.lock().stuck_deletions.insert(name.to_string());
    }

    pub fn set_invocation_status(&self, instance_id: &str, status: InvocationStatus) {
        self.lock()
            .invocation_status
            .insert(instance_id.to_string(), status);
    }

    /// Make the next `times` calls of `operation` fail transiently
    pub fn inject_transient(&self, operation: &str, times: u32) {
        self.lock()
            .transient_failures
            .insert(operation.to_string(), times);
    }

    // ---- inspection -------------------------------------------------------

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.lock().calls.iter().filter(|c| *c == operation).count()
    }

    pub fn create_stack_calls(&self) -> u32 {
        self.lock().create_stack_calls
    }

    pub fn created_stack_request(&self, name: &str) -> Option<CreateStackRequest> {
        self.lock().stack_requests.get(name).cloned()
    }

    pub fn stack(&self, name: &str) -> Option<Stack> {
        self.lock().stacks.get(name).cloned()
    }

    pub fn stack_names(&self) -> Vec<String> {
        self.lock().stacks.keys().cloned().collect()
    }

    pub fn cluster_requests(&self) -> Vec<CreateClusterRequest> {
        self.lock().cluster_requests.clone()
    }

    pub fn has_cluster(&self, name: &str) -> bool {
        self.lock().clusters.contains_key(name)
    }

    pub fn nodegroup_requests(&self) -> Vec<CreateNodegroupRequest> {
        self.lock().nodegroup_requests.clone()
    }

    pub fn has_nodegroup(&self, cluster: &str, name: &str) -> bool {
        self.lock()
            .nodegroups
            .contains_key(&(cluster.to_string(), name.to_string()))
    }

    pub fn network_interfaces(&self, vpc: &str) -> Vec<NetworkInterface> {
        self.lock()
            .interfaces
            .iter()
            .filter(|i| i.vpc == vpc)
            .map(|i| i.interface.clone())
            .collect()
    }

    pub fn instance_profiles_for(&self, role: &str) -> Vec<String> {
        self.lock()
            .instance_profiles
            .iter()
            .filter(|(_, r)| *r == role)
            .map(|(p, _)| p.clone())
            .collect()
    }

    pub fn auto_scaling_group(&self, name: &str) -> Option<AutoScalingGroup> {
        self.lock().groups.get(name).cloned()
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.lock()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub fn object_keys(&self, bucket: &str) -> Vec<String> {
        self.lock()
            .objects
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }

    pub fn metric_batches(&self) -> Vec<(String, Vec<MetricDatum>)> {
        self.lock().metric_batches.clone()
    }

    pub fn documents(&self) -> Vec<String> {
        self.lock().documents.iter().cloned().collect()
    }

    pub fn commands(&self) -> Vec<SendCommandRequest> {
        self.lock().commands.clone()
    }

    // ---- internals --------------------------------------------------------

    fn launch(state: &mut State, instance_type: &str, image_id: &str, name_tag: Option<&str>) -> String {
        state.next_instance += 1;
        let id = format!("i-{:017x}", state.next_instance);
        let launch_time = Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_else(Utc::now);
        state.instances.insert(
            id.clone(),
            Instance {
                id: id.clone(),
                image_id: image_id.to_string(),
                instance_type: instance_type.to_string(),
                launch_time,
            },
        );
        if let Some(name) = name_tag {
            state
                .instance_names
                .entry(name.to_string())
                .or_default()
                .push(id.clone());
        }
        id
    }

    fn terminate_group(state: &mut State, name: &str) {
        if let Some(group) = state.groups.remove(name) {
            for id in group.instance_ids {
                state.instances.remove(&id);
                for ids in state.instance_names.values_mut() {
                    ids.retain(|i| i != &id);
                }
            }
        }
    }

    fn infra_outputs(state: &mut State, request: &CreateStackRequest) -> BTreeMap<String, String> {
        let id = request
            .parameters
            .get("ResourceId")
            .cloned()
            .unwrap_or_default();
        let az1 = request.parameters.get("Subnet01AZ").cloned().unwrap_or_default();
        let az2 = request.parameters.get("Subnet02AZ").cloned().unwrap_or_default();
        for (subnet, az) in [
            ("subnet-public-1", &az1),
            ("subnet-public-2", &az2),
            ("subnet-private-1", &az1),
            ("subnet-private-2", &az2),
        ] {
            state.subnets.insert(subnet.to_string(), az.clone());
        }

        let mut outputs = BTreeMap::new();
        outputs.insert("VPC".to_string(), format!("vpc-{}", id));
        outputs.insert(
            "SubnetsPublic".to_string(),
            "subnet-public-1,subnet-public-2".to_string(),
        );
        outputs.insert(
            "SubnetsPrivate".to_string(),
            "subnet-private-1,subnet-private-2".to_string(),
        );
        outputs.insert(
            "ClusterRole".to_string(),
            format!("arn:aws:iam::{}:role/{}-cluster", FAKE_ACCOUNT, id),
        );
        outputs.insert(
            "NodeRole".to_string(),
            format!("arn:aws:iam::{}:role/{}-node", FAKE_ACCOUNT, id),
        );
        outputs
    }

    fn launch_unmanaged(state: &mut State, request: &CreateStackRequest) {
        let params = &request.parameters;
        let id = params.get("ResourceId").cloned().unwrap_or_default();
        let count: u32 = params
            .get("NodeCount")
            .and_then(|c| c.parse().ok())
            .unwrap_or_default();
        let ami = params.get("AMIId").cloned().unwrap_or_default();
        let instance_type = params
            .get("InstanceTypes")
            .and_then(|t| t.split(',').next().map(String::from))
            .unwrap_or_default();
        let name_tag = format!("{}-Node", id);
        let instance_ids = (0..count)
            .map(|_| Self::launch(state, &instance_type, &ami, Some(&name_tag)))
            .collect();
        state.groups.insert(
            id.clone(),
            AutoScalingGroup {
                name: id,
                instance_ids,
            },
        );
    }
}

#[async_trait]
impl ComputeApi for FakeCloud {
    async fn describe_availability_zones(&self) -> Result<Vec<AvailabilityZone>> {
        self.enter("DescribeAvailabilityZones")?;
        Ok(self.lock().zones.clone())
    }

    async fn describe_instance_type_offerings(
        &self,
        instance_types: &[String],
    ) -> Result<Vec<InstanceTypeOffering>> {
        self.enter("DescribeInstanceTypeOfferings")?;
        Ok(self
            .lock()
            .offerings
            .iter()
            .filter(|o| instance_types.contains(&o.instance_type))
            .cloned()
            .collect())
    }

    async fn describe_instance_type(
        &self,
        instance_type: &str,
    ) -> Result<Option<InstanceTypeInfo>> {
        self.enter("DescribeInstanceTypes")?;
        Ok(self.lock().instance_types.get(instance_type).cloned())
    }

    async fn describe_image(&self, image_id: &str) -> Result<ImageInfo> {
        self.enter("DescribeImages")?;
        self.lock()
            .images
            .get(image_id)
            .cloned()
            .ok_or_else(|| Error::not_found("image", image_id))
    }

    async fn describe_capacity_reservations(
        &self,
        filter: &CapacityReservationFilter,
    ) -> Result<Vec<CapacityReservation>> {
        self.enter("DescribeCapacityReservations")?;
        Ok(self
            .lock()
            .reservations
            .iter()
            .filter(|r| {
                filter.instance_types.is_empty() || filter.instance_types.contains(&r.instance_type)
            })
            .filter(|r| {
                filter
                    .reservation_id
                    .as_ref()
                    .map_or(true, |id| &r.id == id)
            })
            .cloned()
            .collect())
    }

    async fn describe_network_interfaces(
        &self,
        vpc_id: &str,
        _tag_keys: &[String],
    ) -> Result<Vec<NetworkInterface>> {
        self.enter("DescribeNetworkInterfaces")?;
        let mut state = self.lock();
        let mut found = Vec::new();
        for entry in state.interfaces.iter_mut().filter(|i| i.vpc == vpc_id) {
            if entry.describes_until_available == 0 {
                entry.interface.status = InterfaceStatus::Available;
            } else if entry.describes_until_available != u32::MAX {
                entry.describes_until_available -= 1;
            }
            found.push(entry.interface.clone());
        }
        Ok(found)
    }

    async fn delete_network_interface(&self, interface_id: &str) -> Result<()> {
        self.enter("DeleteNetworkInterface")?;
        let mut state = self.lock();
        let idx = state
            .interfaces
            .iter()
            .position(|i| i.interface.id == interface_id)
            .ok_or_else(|| Error::not_found("network interface", interface_id))?;
        if state.interfaces[idx].interface.status != InterfaceStatus::Available {
            return Err(Error::cloud(
                "DeleteNetworkInterface",
                format!("{} is currently in use", interface_id),
            ));
        }
        state.interfaces.remove(idx);
        Ok(())
    }

    async fn describe_subnets(&self, subnet_ids: &[String]) -> Result<Vec<Subnet>> {
        self.enter("DescribeSubnets")?;
        let state = self.lock();
        Ok(subnet_ids
            .iter()
            .filter_map(|id| {
                state.subnets.get(id).map(|az| Subnet {
                    id: id.clone(),
                    availability_zone: az.clone(),
                })
            })
            .collect())
    }

    async fn describe_instances(&self, instance_ids: &[String]) -> Result<Vec<Instance>> {
        self.enter("DescribeInstances")?;
        let state = self.lock();
        Ok(instance_ids
            .iter()
            .filter_map(|id| state.instances.get(id).cloned())
            .collect())
    }

    async fn find_instances_by_name(&self, name: &str) -> Result<Vec<String>> {
        self.enter("DescribeInstances")?;
        Ok(self
            .lock()
            .instance_names
            .get(name)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl StackApi for FakeCloud {
    async fn create_stack(&self, request: &CreateStackRequest) -> Result<String> {
        self.enter("CreateStack")?;
        let mut state = self.lock();
        if state.stacks.contains_key(&request.name) {
            return Err(Error::conflict("stack", &request.name, "already exists"));
        }
        state.create_stack_calls += 1;
        state
            .stack_requests
            .insert(request.name.clone(), request.clone());

        let id = format!(
            "arn:aws:cloudformation:us-west-2:{}:stack/{}/{}",
            FAKE_ACCOUNT, request.name, state.create_stack_calls
        );
        let failure = state.failing_creations.get(&request.name).cloned();
        let (status, status_reason, outputs) = match failure {
            Some(reason) => (StackStatus::RollbackComplete, Some(reason), BTreeMap::new()),
            None if request.parameters.contains_key("Subnet01AZ") => {
                (StackStatus::CreateComplete, None, Self::infra_outputs(&mut state, request))
            }
            None => {
                if request.parameters.contains_key("NodeCount") {
                    Self::launch_unmanaged(&mut state, request);
                }
                (StackStatus::CreateComplete, None, BTreeMap::new())
            }
        };

        let stack = Stack {
            name: request.name.clone(),
            id: id.clone(),
            status,
            status_reason,
            outputs,
            tags: request.tags.clone(),
            creation_time: Utc::now(),
        };
        state.stacks.insert(request.name.clone(), stack);
        Ok(id)
    }

    async fn describe_stack(&self, name: &str) -> Result<Option<Stack>> {
        self.enter("DescribeStacks")?;
        Ok(self.lock().stacks.get(name).cloned())
    }

    async fn delete_stack(&self, name: &str) -> Result<()> {
        self.enter("DeleteStack")?;
        let mut state = self.lock();
        if state.stuck_deletions.contains(name) {
            if let Some(stack) = state.stacks.get_mut(name) {
                stack.status = StackStatus::DeleteFailed;
                stack.status_reason = Some("resource in use".to_string());
            }
            return Ok(());
        }
        if state.stacks.remove(name).is_some() {
            let group = state
                .stack_requests
                .get(name)
                .and_then(|r| r.parameters.get("ResourceId").cloned())
                .filter(|_| name.ends_with("-unmanaged-nodegroup"));
            if let Some(group) = group {
                Self::terminate_group(&mut state, &group);
            }
        }
        Ok(())
    }

    async fn list_stacks(&self, next_token: Option<String>) -> Result<StackPage> {
        self.enter("ListStacks")?;
        const PAGE_SIZE: usize = 2;
        let state = self.lock();
        let start: usize = next_token.and_then(|t| t.parse().ok()).unwrap_or(0);
        let all: Vec<&Stack> = state.stacks.values().collect();
        let stacks = all
            .iter()
            .skip(start)
            .take(PAGE_SIZE)
            .map(|s| StackSummary {
                name: s.name.clone(),
                id: s.id.clone(),
                status: s.status.clone(),
                creation_time: s.creation_time,
            })
            .collect();
        let next = start + PAGE_SIZE;
        Ok(StackPage {
            stacks,
            next_token: (next < all.len()).then(|| next.to_string()),
        })
    }
}

#[async_trait]
impl AutoScalingApi for FakeCloud {
    async fn describe_auto_scaling_group(&self, name: &str) -> Result<Option<AutoScalingGroup>> {
        self.enter("DescribeAutoScalingGroups")?;
        Ok(self.lock().groups.get(name).cloned())
    }
}

#[async_trait]
impl ClusterControlApi for FakeCloud {
    async fn create_cluster(&self, request: &CreateClusterRequest) -> Result<ClusterDescription> {
        self.enter("CreateCluster")?;
        let mut state = self.lock();
        if state.clusters.contains_key(&request.name) {
            return Err(Error::conflict("cluster", &request.name, "already exists"));
        }
        state.cluster_requests.push(request.clone());
        let (v4, v6) = match request.ip_family {
            crate::models::IpFamily::Ipv4 => (Some(FAKE_SERVICE_CIDR.to_string()), None),
            crate::models::IpFamily::Ipv6 => (None, Some("fd00:1234::/108".to_string())),
        };
        let description = ClusterDescription {
            name: request.name.clone(),
            arn: format!(
                "arn:aws:eks:us-west-2:{}:cluster/{}",
                FAKE_ACCOUNT, request.name
            ),
            status: ClusterStatus::Creating,
            version: request.version.clone(),
            endpoint: None,
            certificate_authority: None,
            security_group_id: None,
            service_ipv4_cidr: v4,
            service_ipv6_cidr: v6,
        };
        let polls = state.cluster_activation_polls;
        state.clusters.insert(
            request.name.clone(),
            FakeCluster {
                description: description.clone(),
                polls_until_active: polls,
            },
        );
        Ok(description)
    }

    async fn describe_cluster(&self, name: &str) -> Result<Option<ClusterDescription>> {
        self.enter("DescribeCluster")?;
        let mut state = self.lock();
        let Some(cluster) = state.clusters.get_mut(name) else {
            return Ok(None);
        };
        if cluster.description.status == ClusterStatus::Creating {
            if cluster.polls_until_active == 0 {
                cluster.description.status = ClusterStatus::Active;
                cluster.description.endpoint = Some(FAKE_ENDPOINT.to_string());
                cluster.description.certificate_authority = Some(FAKE_CA.to_string());
                cluster.description.security_group_id = Some(FAKE_SECURITY_GROUP.to_string());
            } else {
                cluster.polls_until_active -= 1;
            }
        }
        Ok(Some(cluster.description.clone()))
    }

    async fn delete_cluster(&self, name: &str) -> Result<()> {
        self.enter("DeleteCluster")?;
        match self.lock().clusters.remove(name) {
            Some(_) => Ok(()),
            None => Err(Error::not_found("cluster", name)),
        }
    }

    async fn default_kubernetes_version(&self) -> Result<String> {
        self.enter("DescribeClusterVersions")?;
        Ok(self.lock().default_version.clone())
    }

    async fn create_nodegroup(&self, request: &CreateNodegroupRequest) -> Result<()> {
        self.enter("CreateNodegroup")?;
        let mut state = self.lock();
        let key = (request.cluster_name.clone(), request.name.clone());
        if state.nodegroups.contains_key(&key) {
            return Err(Error::conflict("nodegroup", &request.name, "already exists"));
        }
        state.nodegroup_requests.push(request.clone());
        let group_name = format!("eks-{}-asg", request.name);
        let instance_type = request.instance_types.first().cloned().unwrap_or_default();
        let instance_ids = (0..request.desired_size)
            .map(|_| Self::launch(&mut state, &instance_type, FAKE_MANAGED_AMI, None))
            .collect();
        state.groups.insert(
            group_name.clone(),
            AutoScalingGroup {
                name: group_name.clone(),
                instance_ids,
            },
        );
        state.nodegroups.insert(
            key,
            Nodegroup {
                name: request.name.clone(),
                status: NodegroupStatus::Creating,
                auto_scaling_groups: vec![group_name],
            },
        );
        Ok(())
    }

    async fn describe_nodegroup(&self, cluster: &str, name: &str) -> Result<Option<Nodegroup>> {
        self.enter("DescribeNodegroup")?;
        let mut state = self.lock();
        let key = (cluster.to_string(), name.to_string());
        Ok(state.nodegroups.get_mut(&key).map(|ng| {
            let current = ng.clone();
            if ng.status == NodegroupStatus::Creating {
                ng.status = NodegroupStatus::Active;
            }
            current
        }))
    }

    async fn delete_nodegroup(&self, cluster: &str, name: &str) -> Result<()> {
        self.enter("DeleteNodegroup")?;
        let mut state = self.lock();
        let key = (cluster.to_string(), name.to_string());
        match state.nodegroups.remove(&key) {
            Some(ng) => {
                for group in ng.auto_scaling_groups {
                    Self::terminate_group(&mut state, &group);
                }
                Ok(())
            }
            None => Err(Error::not_found("nodegroup", name)),
        }
    }

    async fn resolve_addon_version(
        &self,
        addon: &str,
        kubernetes_version: &str,
        default_version: bool,
    ) -> Result<String> {
        self.enter("DescribeAddonVersions")?;
        let build = if default_version { "1" } else { "2" };
        Ok(format!("v{}-{}-eksbuild.{}", kubernetes_version, addon, build))
    }

    async fn create_addon(&self, cluster: &str, addon: &str, version: &str) -> Result<()> {
        self.enter("CreateAddon")?;
        let mut state = self.lock();
        let key = (cluster.to_string(), addon.to_string());
        if state.addons.contains_key(&key) {
            return Err(Error::conflict("addon", addon, "already exists"));
        }
        state.addons.insert(
            key,
            Addon {
                name: addon.to_string(),
                version: version.to_string(),
                status: AddonStatus::Active,
            },
        );
        Ok(())
    }

    async fn describe_addon(&self, cluster: &str, addon: &str) -> Result<Option<Addon>> {
        self.enter("DescribeAddon")?;
        Ok(self
            .lock()
            .addons
            .get(&(cluster.to_string(), addon.to_string()))
            .cloned())
    }

    async fn delete_addon(&self, cluster: &str, addon: &str) -> Result<()> {
        self.enter("DeleteAddon")?;
        match self
            .lock()
            .addons
            .remove(&(cluster.to_string(), addon.to_string()))
        {
            Some(_) => Ok(()),
            None => Err(Error::not_found("addon", addon)),
        }
    }
}

#[async_trait]
impl IdentityApi for FakeCloud {
    async fn list_instance_profiles_for_role(&self, role_name: &str) -> Result<Vec<String>> {
        self.enter("ListInstanceProfilesForRole")?;
        Ok(self.instance_profiles_for(role_name))
    }

    async fn remove_role_from_instance_profile(&self, profile: &str, _role_name: &str) -> Result<()> {
        self.enter("RemoveRoleFromInstanceProfile")?;
        match self.lock().instance_profiles.get_mut(profile) {
            Some(role) => {
                role.clear();
                Ok(())
            }
            None => Err(Error::not_found("instance profile", profile)),
        }
    }

    async fn delete_instance_profile(&self, profile: &str) -> Result<()> {
        self.enter("DeleteInstanceProfile")?;
        match self.lock().instance_profiles.remove(profile) {
            Some(_) => Ok(()),
            None => Err(Error::not_found("instance profile", profile)),
        }
    }
}

#[async_trait]
impl ObjectStoreApi for FakeCloud {
    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<()> {
        self.enter("PutObject")?;
        self.lock()
            .objects
            .insert((bucket.to_string(), key.to_string()), body);
        Ok(())
    }

    async fn presign_put(&self, bucket: &str, key: &str, expires_in: Duration) -> Result<String> {
        self.enter("PresignPutObject")?;
        Ok(format!(
            "https://{}.s3.us-west-2.amazonaws.com/{}?X-Amz-Expires={}",
            bucket,
            key,
            expires_in.as_secs()
        ))
    }
}

#[async_trait]
impl ParameterStoreApi for FakeCloud {
    async fn get_parameter(&self, name: &str) -> Result<String> {
        self.enter("GetParameter")?;
        self.lock()
            .parameters
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found("parameter", name))
    }
}

#[async_trait]
impl MonitoringApi for FakeCloud {
    async fn put_metric_data(&self, namespace: &str, data: Vec<MetricDatum>) -> Result<()> {
        self.enter("PutMetricData")?;
        self.lock()
            .metric_batches
            .push((namespace.to_string(), data));
        Ok(())
    }
}

#[async_trait]
impl RemoteCommandApi for FakeCloud {
    async fn create_document(&self, name: &str, _content: &str) -> Result<()> {
        self.enter("CreateDocument")?;
        if !self.lock().documents.insert(name.to_string()) {
            return Err(Error::conflict("document", name, "already exists"));
        }
        Ok(())
    }

    async fn delete_document(&self, name: &str) -> Result<()> {
        self.enter("DeleteDocument")?;
        match self.lock().documents.remove(name) {
            true => Ok(()),
            false => Err(Error::not_found("document", name)),
        }
    }

    async fn send_command(&self, request: &SendCommandRequest) -> Result<String> {
        self.enter("SendCommand")?;
        let mut state = self.lock();
        if !state.documents.contains(&request.document_name) {
            return Err(Error::not_found("document", &request.document_name));
        }
        state.commands.push(request.clone());
        Ok(format!("cmd-{}", state.commands.len()))
    }

    async fn get_command_invocation(
        &self,
        _command_id: &str,
        instance_id: &str,
    ) -> Result<InvocationStatus> {
        self.enter("GetCommandInvocation")?;
        Ok(self
            .lock()
            .invocation_status
            .get(instance_id)
            .copied()
            .unwrap_or(InvocationStatus::Success))
    }
}

/// Fixed timestamp helper for stacks inserted by janitor tests
pub fn days_ago(days: i64) -> DateTime<Utc> {
    Utc::now() - chrono::Duration::days(days)
}
