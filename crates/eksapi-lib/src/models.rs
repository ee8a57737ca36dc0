//! Core data models shared by the lifecycle components

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Prefix shared by every resource one run creates
pub const RESOURCE_PREFIX: &str = "kubetest2-eksapi";

/// Build the identifier all resources of a run share
pub fn resource_id(run_id: &str) -> String {
    format!("{}-{}", RESOURCE_PREFIX, run_id)
}

/// IP family of the cluster network
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpFamily {
    #[default]
    Ipv4,
    Ipv6,
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpFamily::Ipv4 => write!(f, "ipv4"),
            IpFamily::Ipv6 => write!(f, "ipv6"),
        }
    }
}

/// How worker nodes are provisioned
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStrategy {
    /// Control-plane-owned node group
    #[default]
    Managed,
    /// Auto-scaling group owned by a stack this tester creates
    Unmanaged,
    /// NodeClass + NodePool consumed by the in-cluster autoscaler
    Auto,
}

impl fmt::Display for NodeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStrategy::Managed => write!(f, "managed"),
            NodeStrategy::Unmanaged => write!(f, "unmanaged"),
            NodeStrategy::Auto => write!(f, "auto"),
        }
    }
}

/// Format of the user data attached to unmanaged instances
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserDataFormat {
    /// Classic bootstrap script invocation
    #[default]
    #[serde(rename = "bootstrap.sh")]
    BootstrapSh,
    /// Declarative NodeConfig document
    #[serde(rename = "nodeadm")]
    Nodeadm,
    /// Immutable-OS settings document
    #[serde(rename = "bottlerocket")]
    Bottlerocket,
}

impl fmt::Display for UserDataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserDataFormat::BootstrapSh => write!(f, "bootstrap.sh"),
            UserDataFormat::Nodeadm => write!(f, "nodeadm"),
            UserDataFormat::Bottlerocket => write!(f, "bottlerocket"),
        }
    }
}

/// Username template nodes authenticate as in the auth map
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeNameStrategy {
    #[default]
    EC2PrivateDNSName,
    SessionName,
}

impl NodeNameStrategy {
    /// Placeholder substituted by the authenticator
    pub fn template_variable(&self) -> &'static str {
        match self {
            NodeNameStrategy::EC2PrivateDNSName => "{{EC2PrivateDNSName}}",
            NodeNameStrategy::SessionName => "{{SessionName}}",
        }
    }
}

/// CPU architecture of an instance type or image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    #[serde(rename = "x86_64")]
    X86_64,
    Arm64,
}

impl Architecture {
    /// Name used in parameter-store paths
    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::X86_64 => "x86_64",
            Architecture::Arm64 => "arm64",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Architecture {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "x86_64" | "amd64" => Ok(Architecture::X86_64),
            "aarch64" | "arm64" => Ok(Architecture::Arm64),
            other => Err(Error::invalid_config(format!(
                "unknown architecture: {}",
                other
            ))),
        }
    }
}

/// Outputs of the infrastructure stack
///
/// Created once per run and never mutated afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Infrastructure {
    pub vpc: String,
    pub subnets_public: Vec<String>,
    pub subnets_private: Vec<String>,
    pub cluster_role_arn: String,
    pub node_role_arn: String,
    pub node_role_name: String,
    pub availability_zones: Vec<String>,
}

impl Infrastructure {
    /// Public subnets followed by private subnets
    pub fn subnets(&self) -> Vec<String> {
        self.subnets_public
            .iter()
            .chain(self.subnets_private.iter())
            .cloned()
            .collect()
    }
}

/// Handle to the managed control plane
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub arn: String,
    pub name: String,
    pub endpoint: String,
    /// Base64 PEM bundle as returned by the control plane
    pub certificate_authority: String,
    pub service_cidr: String,
    pub security_group_id: String,
    #[serde(default)]
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_id() {
        assert_eq!(resource_id("abc123"), "kubetest2-eksapi-abc123");
    }

    #[test]
    fn test_architecture_aliases() {
        assert_eq!("amd64".parse::<Architecture>().unwrap(), Architecture::X86_64);
        assert_eq!("x86_64".parse::<Architecture>().unwrap(), Architecture::X86_64);
        assert_eq!("aarch64".parse::<Architecture>().unwrap(), Architecture::Arm64);
        assert_eq!("arm64".parse::<Architecture>().unwrap(), Architecture::Arm64);
        assert!("sparc".parse::<Architecture>().is_err());
    }

    #[test]
    fn test_infrastructure_subnet_order() {
        let infra = Infrastructure {
            subnets_public: vec!["pub-1".into(), "pub-2".into()],
            subnets_private: vec!["priv-1".into(), "priv-2".into()],
            ..Default::default()
        };
        assert_eq!(infra.subnets(), vec!["pub-1", "pub-2", "priv-1", "priv-2"]);
    }

    #[test]
    fn test_user_data_format_serde_names() {
        let f: UserDataFormat = serde_json::from_str("\"bootstrap.sh\"").unwrap();
        assert_eq!(f, UserDataFormat::BootstrapSh);
        let f: UserDataFormat = serde_json::from_str("\"nodeadm\"").unwrap();
        assert_eq!(f, UserDataFormat::Nodeadm);
        assert_eq!(UserDataFormat::Bottlerocket.to_string(), "bottlerocket");
    }
}
