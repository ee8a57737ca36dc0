//! Stack-provisioned auto scaling group

use std::collections::BTreeMap;

use tracing::info;

use super::efa::{render_yaml, resolve_network_interfaces, NetworkInterfaceSpec};
use super::userdata::{self, extract_feature_gates, UserDataInput};
use super::{verify_group_ami, NodeOptions};
use crate::cloud::{CapacityReservationFilter, CloudClients, CreateStackRequest, StackStatus};
use crate::error::{Error, Result};
use crate::models::{Cluster, Infrastructure, UserDataFormat};
use crate::resolver::zones::apply_hinted_order;
use crate::stack::{
    ensure_created, wait_for_stack_creation, wait_for_stack_deletion, STACK_DELETION_TIMEOUT,
};

const UNMANAGED_TEMPLATE: &str = include_str!("../templates/unmanaged-nodegroup.yaml");

/// Indentation of list items under `NetworkInterfaces:` in the template
const INTERFACES_INDENT: usize = 10;
/// Indentation of list items under `Overrides:` in the template
const OVERRIDES_INDENT: usize = 12;

pub const STACK_SUFFIX: &str = "-unmanaged-nodegroup";

pub fn stack_name(resource_id: &str) -> String {
    format!("{}{}", resource_id, STACK_SUFFIX)
}

/// Root volume device for a user data format
pub fn volume_mount_path(format: UserDataFormat) -> &'static str {
    match format {
        UserDataFormat::Bottlerocket => "/dev/xvdb",
        _ => "/dev/xvda",
    }
}

/// Fill the interface schedule and instance-type overrides into the template
pub fn render_template(interfaces: &[NetworkInterfaceSpec], instance_types: &[String]) -> String {
    let pad = " ".repeat(OVERRIDES_INDENT);
    let overrides: String = instance_types
        .iter()
        .map(|t| format!("{}- InstanceType: {}\n", pad, t))
        .collect();
    UNMANAGED_TEMPLATE
        .replace(
            "{{NETWORK_INTERFACES}}\n",
            &render_yaml(interfaces, INTERFACES_INDENT),
        )
        .replace("{{INSTANCE_TYPE_OVERRIDES}}\n", &overrides)
}

/// First active reservation with room for every node
async fn capacity_reservation(
    clients: &CloudClients,
    opts: &NodeOptions,
    instance_types: &[String],
) -> Result<(String, String)> {
    let filter = CapacityReservationFilter {
        instance_types: instance_types.to_vec(),
        reservation_id: opts.capacity_reservation_id.clone(),
    };
    let reservations = clients
        .call("DescribeCapacityReservations", || {
            clients.compute.describe_capacity_reservations(&filter)
        })
        .await?;
    let reservation = reservations
        .into_iter()
        .find(|r| r.available_instance_count >= opts.nodes)
        .ok_or_else(|| {
            Error::invalid_config(format!(
                "no capacity reservation found for instance types {:?} with {} available instances",
                instance_types, opts.nodes
            ))
        })?;
    info!(reservation = %reservation.id, az = %reservation.availability_zone, "Using capacity reservation");
    Ok((reservation.id, reservation.availability_zone))
}

/// The single AZ EFA nodes land in
///
/// EFA traffic cannot cross zones, so every node goes to the first
/// hinted infrastructure AZ that offers the instance type.
async fn efa_availability_zone(
    clients: &CloudClients,
    infra: &Infrastructure,
    instance_types: &[String],
    hints: &[String],
) -> Result<String> {
    let offerings = clients
        .call("DescribeInstanceTypeOfferings", || {
            clients.compute.describe_instance_type_offerings(instance_types)
        })
        .await?;
    let mut candidates: Vec<String> = Vec::new();
    for offering in offerings {
        if infra.availability_zones.contains(&offering.availability_zone)
            && !candidates.contains(&offering.availability_zone)
        {
            candidates.push(offering.availability_zone);
        }
    }
    let az = apply_hinted_order(candidates, hints)
        .into_iter()
        .next()
        .ok_or_else(|| {
            Error::invalid_config(format!(
                "no availability zone in {:?} offers {:?}",
                infra.availability_zones, instance_types
            ))
        })?;
    info!(az = %az, instance_types = ?instance_types, "Found availability zone offering instance types");
    Ok(az)
}

/// Subnets nodes may launch into, restricted to `zone` when given
async fn target_subnets(
    clients: &CloudClients,
    infra: &Infrastructure,
    efa: bool,
    zone: Option<&str>,
) -> Result<Vec<String>> {
    // EFA requires private subnets
    let candidates = if efa {
        infra.subnets_private.clone()
    } else {
        infra.subnets()
    };
    let subnets = clients
        .call("DescribeSubnets", || clients.compute.describe_subnets(&candidates))
        .await?;
    let selected: Vec<String> = subnets
        .into_iter()
        .filter(|s| zone.map_or(true, |z| s.availability_zone == z))
        .map(|s| s.id)
        .collect();
    if selected.is_empty() {
        return Err(Error::invalid_config(format!(
            "no subnet in {:?} is in availability zone {:?}",
            candidates, zone
        )));
    }
    info!(subnets = ?selected, "Using subnets");
    Ok(selected)
}

/// Create the node stack, wait for it and check the expected AMI
pub(super) async fn create(
    clients: &CloudClients,
    resource_id: &str,
    infra: &Infrastructure,
    cluster: &Cluster,
    opts: &NodeOptions,
    instance_types: &[String],
) -> Result<()> {
    let name = stack_name(resource_id);
    let existing = clients
        .call("DescribeStacks", || clients.stacks.describe_stack(&name))
        .await?;

    if let Some(existing) = existing {
        info!(stack = %name, status = %existing.status, "Unmanaged nodegroup stack already exists");
    } else {
        let request = create_request(clients, resource_id, infra, cluster, opts, instance_types).await?;
        info!(stack = %name, nodes = opts.nodes, "Creating unmanaged nodegroup stack");
        let stack_id = clients
            .call("CreateStack", || clients.stacks.create_stack(&request))
            .await?;
        info!(stack_id = %stack_id, "Waiting for unmanaged nodegroup stack to be created");
    }

    let stack = wait_for_stack_creation(clients, &name, opts.node_creation_timeout).await?;
    ensure_created(&stack)?;
    info!(stack = %name, "Created unmanaged nodegroup stack");

    if let Some(expected) = opts.expected_ami.as_deref() {
        verify_group_ami(clients, resource_id, expected).await?;
    }
    Ok(())
}

async fn create_request(
    clients: &CloudClients,
    resource_id: &str,
    infra: &Infrastructure,
    cluster: &Cluster,
    opts: &NodeOptions,
    instance_types: &[String],
) -> Result<CreateStackRequest> {
    let mut input = UserDataInput::for_cluster(cluster, &opts.kubernetes_version);
    input.nodeadm_feature_gates = extract_feature_gates(&opts.nodeadm_feature_gates)?;
    input.set_cluster_dns_ip = opts.set_cluster_dns_ip;
    let user_data = userdata::render(opts.user_data_format, &input)?;

    let (reservation_id, zone) = if opts.capacity_reservation {
        let (id, az) = capacity_reservation(clients, opts, instance_types).await?;
        (Some(id), Some(az))
    } else if opts.efa {
        let az = efa_availability_zone(clients, infra, instance_types, &opts.az_hints).await?;
        (None, Some(az))
    } else {
        (None, None)
    };

    let subnets = target_subnets(clients, infra, opts.efa, zone.as_deref()).await?;
    let security_groups = vec![cluster.security_group_id.clone()];
    let interfaces =
        resolve_network_interfaces(clients, opts.efa, instance_types, &subnets, &security_groups)
            .await?;

    let ami = opts
        .ami
        .clone()
        .ok_or_else(|| Error::invalid_config("unmanaged nodes require an AMI"))?;

    let mut parameters = BTreeMap::new();
    let mut set = |key: &str, value: String| {
        parameters.insert(key.to_string(), value);
    };
    set("ResourceId", resource_id.to_string());
    set("VpcId", infra.vpc.clone());
    set("SubnetIds", subnets.join(","));
    set("UserData", user_data.body);
    set("UserDataIsMIMEPart", user_data.is_mime.to_string());
    set(
        "VolumeMountPath",
        volume_mount_path(opts.user_data_format).to_string(),
    );
    set("ClusterName", cluster.name.clone());
    set("NodeRoleName", infra.node_role_name.clone());
    set("NodeCount", opts.nodes.to_string());
    set("SecurityGroup", cluster.security_group_id.clone());
    set("AMIId", ami);
    set("CapacityReservationId", reservation_id.unwrap_or_default());
    set("InstanceTypes", instance_types.join(","));

    Ok(CreateStackRequest {
        name: stack_name(resource_id),
        template_body: render_template(&interfaces, instance_types),
        parameters,
        tags: clients.endpoint.stack_tags(),
    })
}

/// Delete the node stack and wait for it to go away; missing is success
pub(super) async fn delete(clients: &CloudClients, resource_id: &str) -> Result<()> {
    let name = stack_name(resource_id);
    let existing = clients
        .call("DescribeStacks", || clients.stacks.describe_stack(&name))
        .await?;
    match existing {
        None => {
            info!(stack = %name, "Unmanaged nodegroup stack does not exist");
            return Ok(());
        }
        Some(stack) if stack.status == StackStatus::DeleteComplete => return Ok(()),
        Some(_) => {}
    }

    info!(stack = %name, "Deleting unmanaged nodegroup stack");
    clients
        .call("DeleteStack", || clients.stacks.delete_stack(&name))
        .await?;
    wait_for_stack_deletion(clients, &name, STACK_DELETION_TIMEOUT).await?;
    info!(stack = %name, "Deleted unmanaged nodegroup stack");
    Ok(())
}
