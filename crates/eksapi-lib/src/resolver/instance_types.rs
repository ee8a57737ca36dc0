//! Instance-type defaults and validation

use tracing::info;

use crate::cloud::CloudClients;
use crate::error::{Error, Result};
use crate::models::{Architecture, NodeStrategy};

const X86_64_DEFAULTS: &[&str] = &["m6i.xlarge", "m6i.large", "m5.large", "t3.large"];

const ARM64_DEFAULTS: &[&str] = &[
    "m7g.xlarge",
    "m7g.large",
    "m6g.xlarge",
    "m6g.large",
    "t4g.xlarge",
    "t4g.large",
];

/// Default instance types for an architecture
///
/// The service's own defaults are too small for conformance suites.
pub fn default_instance_types(arch: Architecture) -> Vec<String> {
    let table = match arch {
        Architecture::X86_64 => X86_64_DEFAULTS,
        Architecture::Arm64 => ARM64_DEFAULTS,
    };
    table.iter().map(|s| s.to_string()).collect()
}

/// Architecture implied by a managed AMI type
pub fn ami_type_architecture(ami_type: &str) -> Option<Architecture> {
    match ami_type {
        "AL2_x86_64" | "AL2023_x86_64_STANDARD" => Some(Architecture::X86_64),
        "AL2_ARM_64" | "AL2023_ARM_64_STANDARD" => Some(Architecture::Arm64),
        _ => None,
    }
}

/// What the resolver knows when no instance types were requested
#[derive(Debug, Clone, Default)]
pub struct InstanceTypeRequest {
    pub instance_types: Vec<String>,
    pub architectures: Vec<String>,
    pub strategy: NodeStrategy,
    pub ami: Option<String>,
    pub ami_type: Option<String>,
}

/// Pick and validate the instance types nodes will use
///
/// Explicit types win; otherwise defaults come from the requested
/// architectures, the unmanaged AMI's architecture, or the managed AMI
/// type, in that order. Types the region does not know are dropped.
pub async fn resolve_instance_types(
    clients: &CloudClients,
    request: &InstanceTypeRequest,
) -> Result<Vec<String>> {
    let candidates = if !request.instance_types.is_empty() {
        request.instance_types.clone()
    } else if !request.architectures.is_empty() {
        info!(archs = ?request.architectures, "Choosing instance types based on architecture");
        let mut types = Vec::new();
        for arch in &request.architectures {
            types.extend(default_instance_types(arch.parse()?));
        }
        types
    } else if request.strategy == NodeStrategy::Unmanaged {
        let ami = request
            .ami
            .as_deref()
            .ok_or_else(|| Error::invalid_config("unmanaged nodes require an AMI"))?;
        info!(ami = %ami, "Choosing instance types based on AMI architecture");
        let image = clients
            .call("DescribeImages", || clients.compute.describe_image(ami))
            .await?;
        default_instance_types(image.architecture)
    } else {
        let ami_type = request.ami_type.as_deref().unwrap_or_default();
        info!(ami_type = %ami_type, "Choosing instance types based on AMI type");
        let arch = ami_type_architecture(ami_type).ok_or_else(|| {
            Error::invalid_config(format!(
                "no default instance types known for AMI type: {}",
                ami_type
            ))
        })?;
        default_instance_types(arch)
    };

    let mut valid = Vec::with_capacity(candidates.len());
    for instance_type in &candidates {
        let info = clients
            .call("DescribeInstanceTypes", || {
                clients.compute.describe_instance_type(instance_type)
            })
            .await?;
        match info {
            Some(_) => valid.push(instance_type.clone()),
            None => info!(instance_type = %instance_type, "Eliminating invalid instance type"),
        }
    }

    if valid.is_empty() {
        return Err(Error::invalid_config(format!(
            "none of the instance types {:?} were valid",
            candidates
        )));
    }
    info!(instance_types = ?valid, "Using instance types");
    Ok(valid)
}
