//! Kubeconfig and node auth-map rendering

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::Result;
use crate::models::{Cluster, NodeNameStrategy};

/// Exec credential API version the token helper speaks
pub const EXEC_API_VERSION: &str = "client.authentication.k8s.io/v1beta1";

pub const AUTH_MAP_NAME: &str = "aws-auth";
pub const AUTH_MAP_NAMESPACE: &str = "kube-system";
pub const AUTH_MAP_KEY: &str = "mapRoles";

const KUBECONFIG_MODE: u32 = 0o666;

/// Render a kubeconfig for the cluster
///
/// The output depends only on the ARN, endpoint, CA and name of the
/// cluster, so rendering twice yields identical bytes.
pub fn render(cluster: &Cluster) -> String {
    let arn = &cluster.arn;
    format!(
        "apiVersion: v1
clusters:
- cluster:
    certificate-authority-data: {ca}
    server: {endpoint}
  name: {arn}
contexts:
- context:
    cluster: {arn}
    user: {arn}
  name: {arn}
current-context: {arn}
kind: Config
preferences: {{}}
users:
- name: {arn}
  user:
    exec:
      apiVersion: {api}
      command: aws
      args:
        - eks
        - get-token
        - --cluster-name
        - {name}
",
        ca = cluster.certificate_authority,
        endpoint = cluster.endpoint,
        arn = arn,
        api = EXEC_API_VERSION,
        name = cluster.name,
    )
}

/// Default location of the run's kubeconfig
pub fn default_path(run_dir: &Path, resource_id: &str) -> PathBuf {
    run_dir.join(format!("{}.kubeconfig", resource_id))
}

/// Write the kubeconfig to `path` with mode 0666
pub fn write(path: &Path, cluster: &Cluster) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, render(cluster))?;
    set_mode(path)?;
    info!(path = %path.display(), cluster = %cluster.name, "Wrote kubeconfig");
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(KUBECONFIG_MODE))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path) -> Result<()> {
    Ok(())
}

/// `mapRoles` entry letting nodes with the node role join the cluster
pub fn render_map_roles(node_role_arn: &str, strategy: NodeNameStrategy) -> String {
    format!(
        "- rolearn: {}
  username: system:node:{}
  groups:
    - system:bootstrappers
    - system:nodes
",
        node_role_arn,
        strategy.template_variable()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cluster() -> Cluster {
        Cluster {
            arn: "arn:aws:eks:us-west-2:123:cluster/test".into(),
            name: "test".into(),
            endpoint: "https://example.com".into(),
            certificate_authority: "Y2E=".into(),
            service_cidr: "10.100.0.0/16".into(),
            security_group_id: "sg-1".into(),
            version: "1.30".into(),
        }
    }

    #[test]
    fn test_render_is_stable() {
        let first = render(&cluster());
        let second = render(&cluster());
        assert_eq!(first, second);
        assert!(first.contains("certificate-authority-data: Y2E=\n"));
        assert!(first.contains("current-context: arn:aws:eks:us-west-2:123:cluster/test\n"));
        assert!(first.contains("preferences: {}\n"));
        assert!(first.ends_with("        - --cluster-name\n        - test\n"));
    }

    #[test]
    fn test_render_ignores_unrelated_fields() {
        let mut other = cluster();
        other.service_cidr = "fd00::/108".into();
        other.version = "1.31".into();
        assert_eq!(render(&cluster()), render(&other));
    }

    #[test]
    fn test_render_parses_as_yaml() {
        let doc: serde_yaml::Value = serde_yaml::from_str(&render(&cluster())).unwrap();
        assert_eq!(doc["kind"].as_str(), Some("Config"));
        let exec = &doc["users"][0]["user"]["exec"];
        assert_eq!(exec["apiVersion"].as_str(), Some(EXEC_API_VERSION));
        assert_eq!(exec["args"][3].as_str(), Some("test"));
    }

    #[cfg(unix)]
    #[test]
    fn test_write_sets_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = default_path(dir.path(), "kubetest2-eksapi-x");
        write(&path, &cluster()).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o666);
        assert_eq!(fs::read_to_string(&path).unwrap(), render(&cluster()));
    }

    #[test]
    fn test_map_roles() {
        let rendered = render_map_roles("arn:aws:iam::1:role/node", NodeNameStrategy::SessionName);
        assert_eq!(
            rendered,
            "- rolearn: arn:aws:iam::1:role/node\n  username: system:node:{{SessionName}}\n  groups:\n    - system:bootstrappers\n    - system:nodes\n"
        );
        let parsed: serde_yaml::Value = serde_yaml::from_str(&render_map_roles(
            "arn",
            NodeNameStrategy::EC2PrivateDNSName,
        ))
        .unwrap();
        assert_eq!(
            parsed[0]["username"].as_str(),
            Some("system:node:{{EC2PrivateDNSName}}")
        );
    }
}
