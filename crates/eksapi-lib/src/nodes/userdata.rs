//! User data rendering for unmanaged nodes
//!
//! `bootstrap.sh` and `nodeadm` documents are MIME parts the stack
//! template merges into a multi-part message; bottlerocket settings are
//! passed through as-is.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::error::{Error, Result};
use crate::models::{Cluster, UserDataFormat};
use crate::resolver::nth_address;

/// Offset of the cluster DNS service inside the service CIDR
const CLUSTER_DNS_OFFSET: u32 = 10;

/// Everything a user data document binds
#[derive(Debug, Clone, Default)]
pub struct UserDataInput {
    pub name: String,
    pub endpoint: String,
    pub certificate_authority: String,
    pub cidr: String,
    pub kubernetes_version: String,
    /// Gates passed to nodeadm itself
    pub nodeadm_feature_gates: BTreeMap<String, bool>,
    pub set_cluster_dns_ip: bool,
}

impl UserDataInput {
    pub fn for_cluster(cluster: &Cluster, kubernetes_version: &str) -> Self {
        Self {
            name: cluster.name.clone(),
            endpoint: cluster.endpoint.clone(),
            certificate_authority: cluster.certificate_authority.clone(),
            cidr: cluster.service_cidr.clone(),
            kubernetes_version: kubernetes_version.to_string(),
            ..Default::default()
        }
    }
}

/// A rendered document and whether it must be wrapped as a MIME part
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserData {
    pub body: String,
    pub is_mime: bool,
}

/// Render user data in `format`
pub fn render(format: UserDataFormat, input: &UserDataInput) -> Result<UserData> {
    match format {
        UserDataFormat::BootstrapSh => Ok(UserData {
            body: render_bootstrap_sh(input),
            is_mime: true,
        }),
        UserDataFormat::Nodeadm => Ok(UserData {
            body: render_nodeadm(input),
            is_mime: true,
        }),
        UserDataFormat::Bottlerocket => Ok(UserData {
            body: render_bottlerocket(input)?,
            is_mime: false,
        }),
    }
}

fn render_bootstrap_sh(input: &UserDataInput) -> String {
    format!(
        "Content-Type: text/x-shellscript; charset=\"us-ascii\"
MIME-Version: 1.0

#!/usr/bin/env bash
/etc/eks/bootstrap.sh {name} \\
  --b64-cluster-ca {ca} \\
  --apiserver-endpoint {endpoint}
",
        name = input.name,
        ca = input.certificate_authority,
        endpoint = input.endpoint,
    )
}

/// Kubelet feature gates turned on by default for a Kubernetes version
fn kubelet_feature_gates(kubernetes_version: &str) -> BTreeMap<String, bool> {
    let mut gates = BTreeMap::new();
    if kubernetes_version == "1.33" {
        gates.insert("DynamicResourceAllocation".to_string(), true);
    }
    gates
}

fn render_nodeadm(input: &UserDataInput) -> String {
    let mut out = String::from(
        "Content-Type: application/node.eks.aws
MIME-Version: 1.0

---
apiVersion: node.eks.aws/v1alpha1
kind: NodeConfig
spec:
",
    );
    if !input.nodeadm_feature_gates.is_empty() {
        out.push_str("  featureGates:\n");
        for (gate, enabled) in &input.nodeadm_feature_gates {
            let _ = writeln!(out, "    {}: {}", gate, enabled);
        }
    }
    let _ = write!(
        out,
        "  cluster:
    name: {}
    apiServerEndpoint: {}
    certificateAuthority: {}
    cidr: {}
",
        input.name, input.endpoint, input.certificate_authority, input.cidr
    );
    let kubelet_gates = kubelet_feature_gates(&input.kubernetes_version);
    if !kubelet_gates.is_empty() {
        out.push_str("  kubelet:\n    config:\n      featureGates:\n");
        for (gate, enabled) in &kubelet_gates {
            let _ = writeln!(out, "        {}: {}", gate, enabled);
        }
    }
    out
}

fn render_bottlerocket(input: &UserDataInput) -> Result<String> {
    let mut out = String::from("[settings.kubernetes]\n");
    let _ = writeln!(out, "\"cluster-name\" = \"{}\"", input.name);
    let _ = writeln!(out, "\"api-server\" = \"{}\"", input.endpoint);
    let _ = writeln!(out, "\"cluster-certificate\" = \"{}\"", input.certificate_authority);
    if input.set_cluster_dns_ip {
        let dns_ip = derive_cluster_dns_ip(&input.cidr)?;
        let _ = writeln!(out, "\"cluster-dns-ip\" = \"{}\"", dns_ip);
    }
    out.push_str(
        "device-ownership-from-security-context = true

[settings.host-containers.admin]
\"enabled\" = true
",
    );
    Ok(out)
}

/// Parse operator `key=true|false` pairs into a feature-gate map
pub fn extract_feature_gates(pairs: &[String]) -> Result<BTreeMap<String, bool>> {
    let mut gates = BTreeMap::new();
    for pair in pairs {
        let (key, value) = pair.split_once('=').ok_or_else(|| {
            Error::invalid_config(format!("feature gate {:?} is not key=value", pair))
        })?;
        let enabled: bool = value.parse().map_err(|_| {
            Error::invalid_config(format!(
                "feature gate {:?} must be true or false, got {:?}",
                key, value
            ))
        })?;
        gates.insert(key.to_string(), enabled);
    }
    Ok(gates)
}

/// Cluster DNS address: the tenth address of the service CIDR
pub fn derive_cluster_dns_ip(service_cidr: &str) -> Result<String> {
    Ok(nth_address(service_cidr, CLUSTER_DNS_OFFSET)?.to_string())
}
