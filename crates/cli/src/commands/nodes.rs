//! Node readiness on a live cluster

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use eksapi_lib::k8s::{count_ready, wait_for_ready_nodes, ClusterApi, KubeClusterApi, NodeInfo};
use serde::Serialize;
use tabled::Tabled;

use crate::output::{color_status, print_rows, print_success, print_warning, OutputFormat};

#[derive(Tabled)]
struct NodeRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Ready")]
    ready: String,
    #[tabled(rename = "Instance Type")]
    instance_type: String,
    #[tabled(rename = "Arch")]
    arch: String,
    #[tabled(rename = "OS Image")]
    os_image: String,
    #[tabled(rename = "Age")]
    age: String,
}

#[derive(Serialize)]
struct NodeJson<'a> {
    name: &'a str,
    ready: bool,
    instance_type: &'a str,
    arch: &'a str,
    os_image: &'a str,
    provider_id: Option<&'a str>,
}

fn format_age(node: &NodeInfo) -> String {
    let Some(created) = node.created else {
        return "-".to_string();
    };
    let age = Utc::now().signed_duration_since(created);
    if age.num_hours() > 0 {
        format!("{}h{}m", age.num_hours(), age.num_minutes() % 60)
    } else {
        format!("{}m", age.num_minutes().max(0))
    }
}

async fn connect(kubeconfig: Option<&Path>) -> Result<KubeClusterApi> {
    Ok(match kubeconfig {
        Some(path) => KubeClusterApi::from_kubeconfig(path).await?,
        None => KubeClusterApi::new(
            kube::Client::try_default()
                .await
                .context("building default Kubernetes client")?,
        ),
    })
}

/// List nodes; with `expected`, fail unless that many are Ready
///
/// With `wait_secs` the command polls until enough nodes are Ready.
pub async fn nodes(
    kubeconfig: Option<&Path>,
    expected: Option<usize>,
    wait_secs: Option<u64>,
    format: OutputFormat,
) -> Result<()> {
    let api = connect(kubeconfig).await?;
    let nodes = match (expected, wait_secs) {
        (Some(count), Some(secs)) => {
            wait_for_ready_nodes(&api, count, Duration::from_secs(secs)).await?;
            api.list_nodes().await?
        }
        _ => api.list_nodes().await?,
    };
    report(&nodes, expected, format)
}

fn report(nodes: &[NodeInfo], expected: Option<usize>, format: OutputFormat) -> Result<()> {
    let rows = nodes
        .iter()
        .map(|n| NodeRow {
            name: n.name.clone(),
            ready: color_status(if n.ready { "ready" } else { "not-ready" }),
            instance_type: n.instance_type.clone(),
            arch: n.arch.clone(),
            os_image: n.os_image.clone(),
            age: format_age(n),
        })
        .collect();
    let raw: Vec<NodeJson> = nodes
        .iter()
        .map(|n| NodeJson {
            name: &n.name,
            ready: n.ready,
            instance_type: &n.instance_type,
            arch: &n.arch,
            os_image: &n.os_image,
            provider_id: n.provider_id.as_deref(),
        })
        .collect();
    print_rows(rows, &raw, format)?;

    let ready = count_ready(nodes);
    match expected {
        Some(want) if ready < want => {
            print_warning(&format!("{} of {} expected nodes are ready", ready, want));
            anyhow::bail!("only {} of {} nodes are ready", ready, want)
        }
        Some(want) if format == OutputFormat::Table => {
            print_success(&format!("{} nodes ready (wanted {})", ready, want));
            Ok(())
        }
        _ => Ok(()),
    }
}
