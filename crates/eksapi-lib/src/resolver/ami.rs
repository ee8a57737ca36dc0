//! Machine image lookup from the public parameter store

use tracing::info;

use crate::cloud::CloudClients;
use crate::error::{Error, Result};
use crate::models::{Architecture, UserDataFormat};

/// Parameter holding the recommended image for a format, version and arch
pub fn recommended_ami_parameter(
    format: UserDataFormat,
    kubernetes_version: &str,
    arch: Architecture,
) -> String {
    match format {
        UserDataFormat::Nodeadm => format!(
            "/aws/service/eks/optimized-ami/{}/amazon-linux-2023/{}/standard/recommended/image_id",
            kubernetes_version, arch
        ),
        UserDataFormat::Bottlerocket => format!(
            "/aws/service/bottlerocket/aws-k8s-{}/{}/latest/image_id",
            kubernetes_version, arch
        ),
        UserDataFormat::BootstrapSh => match arch {
            Architecture::X86_64 => format!(
                "/aws/service/eks/optimized-ami/{}/amazon-linux-2/recommended/image_id",
                kubernetes_version
            ),
            Architecture::Arm64 => format!(
                "/aws/service/eks/optimized-ami/{}/amazon-linux-2-arm64/recommended/image_id",
                kubernetes_version
            ),
        },
    }
}

/// Resolve the recommended image id for unmanaged nodes
pub async fn resolve_ami(
    clients: &CloudClients,
    format: UserDataFormat,
    kubernetes_version: &str,
    arch: Architecture,
) -> Result<String> {
    let parameter = recommended_ami_parameter(format, kubernetes_version, arch);
    let ami = clients
        .call("GetParameter", || clients.parameters.get_parameter(&parameter))
        .await?;
    if ami.is_empty() {
        return Err(Error::invalid_config(format!(
            "parameter {} holds no image id",
            parameter
        )));
    }
    info!(ami = %ami, parameter = %parameter, "Resolved AMI");
    Ok(ami)
}
