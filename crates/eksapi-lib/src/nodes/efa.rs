//! Network interface schedule for unmanaged launch templates

use std::fmt::Write as _;

use tracing::info;

use crate::cloud::{CloudClients, InstanceTypeInfo};
use crate::error::{Error, Result};

/// One entry of a launch template's `NetworkInterfaces` list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterfaceSpec {
    pub description: &'static str,
    pub device_index: u32,
    pub network_card_index: u32,
    pub interface_type: &'static str,
    pub subnet_id: Option<String>,
    pub groups: Vec<String>,
    pub delete_on_termination: bool,
}

fn interface(
    efa: bool,
    network_card_index: u32,
    subnet_ids: &[String],
    security_groups: &[String],
) -> Result<NetworkInterfaceSpec> {
    // Only the primary card takes device index 0
    let device_index = if network_card_index > 0 { 1 } else { 0 };
    let (description, interface_type, subnet_id) = if efa {
        let subnet = subnet_ids.first().ok_or_else(|| {
            Error::invalid_config("EFA interfaces require a subnet but none were provided")
        })?;
        ("EFA-enabled network interface", "efa", Some(subnet.clone()))
    } else {
        ("Standard network interface", "interface", None)
    };
    Ok(NetworkInterfaceSpec {
        description,
        device_index,
        network_card_index,
        interface_type,
        subnet_id,
        groups: security_groups.to_vec(),
        delete_on_termination: true,
    })
}

/// Build the interface schedule
///
/// Without EFA this is a single standard interface. With EFA there is
/// one EFA interface per network card the instance type supports.
pub fn network_interfaces(
    efa_type: Option<&InstanceTypeInfo>,
    subnet_ids: &[String],
    security_groups: &[String],
) -> Result<Vec<NetworkInterfaceSpec>> {
    let Some(info) = efa_type else {
        return Ok(vec![interface(false, 0, subnet_ids, security_groups)?]);
    };
    if !info.efa_supported {
        return Err(Error::invalid_config(format!(
            "cannot generate EFA interfaces for instance type {} because it does not support EFA",
            info.instance_type
        )));
    }
    (0..info.maximum_network_cards)
        .map(|card| interface(true, card, subnet_ids, security_groups))
        .collect()
}

/// Describe the single EFA instance type and build its schedule
pub async fn resolve_network_interfaces(
    clients: &CloudClients,
    efa: bool,
    instance_types: &[String],
    subnet_ids: &[String],
    security_groups: &[String],
) -> Result<Vec<NetworkInterfaceSpec>> {
    if !efa {
        return network_interfaces(None, subnet_ids, security_groups);
    }
    let instance_type = instance_types
        .first()
        .ok_or_else(|| Error::invalid_config("EFA requires an instance type"))?;
    let info = clients
        .call("DescribeInstanceTypes", || {
            clients.compute.describe_instance_type(instance_type)
        })
        .await?
        .ok_or_else(|| Error::not_found("instance type", instance_type))?;
    let interfaces = network_interfaces(Some(&info), subnet_ids, security_groups)?;
    info!(
        instance_type = %instance_type,
        interfaces = interfaces.len(),
        "Generated EFA network interfaces"
    );
    Ok(interfaces)
}

/// Render the schedule as a YAML list indented by `indent` spaces
pub fn render_yaml(interfaces: &[NetworkInterfaceSpec], indent: usize) -> String {
    let pad = " ".repeat(indent);
    let mut out = String::new();
    for iface in interfaces {
        let _ = writeln!(out, "{}- DeviceIndex: {}", pad, iface.device_index);
        let _ = writeln!(out, "{}  NetworkCardIndex: {}", pad, iface.network_card_index);
        let _ = writeln!(out, "{}  InterfaceType: {}", pad, iface.interface_type);
        let _ = writeln!(out, "{}  Description: {}", pad, iface.description);
        if let Some(subnet) = &iface.subnet_id {
            let _ = writeln!(out, "{}  SubnetId: {}", pad, subnet);
        }
        if !iface.groups.is_empty() {
            let _ = writeln!(out, "{}  Groups:", pad);
            for group in &iface.groups {
                let _ = writeln!(out, "{}    - {}", pad, group);
            }
        }
        let _ = writeln!(
            out,
            "{}  DeleteOnTermination: {}",
            pad, iface.delete_on_termination
        );
    }
    out
}
