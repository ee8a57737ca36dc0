//! Control-plane-owned node group

use std::time::Duration;

use tracing::info;

use super::{verify_group_ami, NodeOptions};
use crate::cloud::{wait_until, CloudClients, CreateNodegroupRequest, NodegroupStatus};
use crate::error::{Error, Result};
use crate::models::Infrastructure;

const NODEGROUP_DISK_GIB: u32 = 100;
const NODEGROUP_POLL_INTERVAL: Duration = Duration::from_secs(15);

pub(super) fn create_request(
    resource_id: &str,
    infra: &Infrastructure,
    opts: &NodeOptions,
    instance_types: &[String],
) -> CreateNodegroupRequest {
    CreateNodegroupRequest {
        cluster_name: resource_id.to_string(),
        name: resource_id.to_string(),
        node_role_arn: infra.node_role_arn.clone(),
        subnet_ids: infra.subnets(),
        disk_size_gib: NODEGROUP_DISK_GIB,
        capacity_type: "ON_DEMAND".to_string(),
        min_size: opts.nodes,
        max_size: opts.nodes,
        desired_size: opts.nodes,
        ami_type: opts.ami_type.clone().unwrap_or_default(),
        instance_types: instance_types.to_vec(),
    }
}

/// Create the node group, wait for Active and check the expected AMI
pub(super) async fn create(
    clients: &CloudClients,
    resource_id: &str,
    infra: &Infrastructure,
    opts: &NodeOptions,
    instance_types: &[String],
) -> Result<()> {
    let existing = clients
        .call("DescribeNodegroup", || {
            clients.eks.describe_nodegroup(resource_id, resource_id)
        })
        .await?;
    if existing.is_some() {
        info!(nodegroup = %resource_id, "Nodegroup already exists");
    } else {
        let request = create_request(resource_id, infra, opts, instance_types);
        info!(
            nodegroup = %resource_id,
            nodes = opts.nodes,
            ami_type = %request.ami_type,
            "Creating nodegroup"
        );
        clients
            .call("CreateNodegroup", || clients.eks.create_nodegroup(&request))
            .await?;
    }

    info!(nodegroup = %resource_id, "Waiting for nodegroup to be active");
    let nodegroup = wait_until(
        "nodegroup activation",
        resource_id,
        opts.node_creation_timeout,
        NODEGROUP_POLL_INTERVAL,
        || async {
            let nodegroup = clients
                .call("DescribeNodegroup", || {
                    clients.eks.describe_nodegroup(resource_id, resource_id)
                })
                .await?
                .ok_or_else(|| Error::not_found("nodegroup", resource_id))?;
            match nodegroup.status {
                NodegroupStatus::Active => Ok(Some(nodegroup)),
                NodegroupStatus::Creating | NodegroupStatus::Updating => Ok(None),
                other => Err(Error::cloud(
                    "nodegroup activation",
                    format!("nodegroup {} is {:?}", resource_id, other),
                )),
            }
        },
    )
    .await?;
    info!(nodegroup = %resource_id, "Nodegroup is active");

    if let Some(expected) = opts.expected_ami.as_deref() {
        let group = nodegroup.auto_scaling_groups.first().ok_or_else(|| {
            Error::cloud(
                "nodegroup activation",
                format!("nodegroup {} has no auto scaling group", resource_id),
            )
        })?;
        verify_group_ami(clients, group, expected).await?;
    }
    Ok(())
}

/// Delete the node group and wait for it to disappear; missing is success
pub(super) async fn delete(clients: &CloudClients, resource_id: &str, timeout: Duration) -> Result<()> {
    info!(nodegroup = %resource_id, "Deleting nodegroup");
    let result = clients
        .call("DeleteNodegroup", || {
            clients.eks.delete_nodegroup(resource_id, resource_id)
        })
        .await;
    match result {
        Err(e) if e.is_not_found() => {
            info!(nodegroup = %resource_id, "Nodegroup does not exist");
            return Ok(());
        }
        other => other?,
    }

    wait_until(
        "nodegroup deletion",
        resource_id,
        timeout,
        NODEGROUP_POLL_INTERVAL,
        || async {
            let nodegroup = clients
                .call("DescribeNodegroup", || {
                    clients.eks.describe_nodegroup(resource_id, resource_id)
                })
                .await?;
            match nodegroup {
                None => Ok(Some(())),
                Some(ng) if ng.status == NodegroupStatus::DeleteFailed => Err(Error::cloud(
                    "nodegroup deletion",
                    format!("nodegroup {} failed to delete", resource_id),
                )),
                Some(_) => Ok(None),
            }
        },
    )
    .await?;
    info!(nodegroup = %resource_id, "Nodegroup deleted");
    Ok(())
}
