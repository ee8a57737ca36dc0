//! Offline rendering from a run document

use std::path::Path;

use anyhow::{Context, Result};
use clap::ValueEnum;
use eksapi_lib::document::ConfigDocument;
use eksapi_lib::kubeconfig;
use eksapi_lib::models::{Cluster, UserDataFormat};
use eksapi_lib::nodes::userdata::{self, extract_feature_gates, UserDataInput};
use eksapi_lib::resolver::subnet_cidrs;
use tabled::Tabled;

use crate::output::{print_rows, print_success, OutputFormat};

/// User data flavours selectable on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum UserDataKind {
    #[value(name = "bootstrap.sh")]
    BootstrapSh,
    Nodeadm,
    Bottlerocket,
}

impl From<UserDataKind> for UserDataFormat {
    fn from(kind: UserDataKind) -> Self {
        match kind {
            UserDataKind::BootstrapSh => UserDataFormat::BootstrapSh,
            UserDataKind::Nodeadm => UserDataFormat::Nodeadm,
            UserDataKind::Bottlerocket => UserDataFormat::Bottlerocket,
        }
    }
}

fn load_cluster(document: &Path) -> Result<(ConfigDocument, Cluster)> {
    let doc = ConfigDocument::load(document)
        .with_context(|| format!("reading run document {}", document.display()))?;
    let cluster = doc
        .status
        .cluster
        .clone()
        .with_context(|| format!("run has no cluster yet (phase {})", doc.status.phase))?;
    Ok((doc, cluster))
}

/// Print the run's kubeconfig, or write it to `output`
pub fn kubeconfig(document: &Path, output: Option<&Path>) -> Result<()> {
    let (_, cluster) = load_cluster(document)?;
    match output {
        Some(path) => {
            kubeconfig::write(path, &cluster)?;
            print_success(&format!("Wrote kubeconfig to {}", path.display()));
        }
        None => print!("{}", kubeconfig::render(&cluster)),
    }
    Ok(())
}

/// Print the user data unmanaged nodes of the run would boot with
pub fn userdata(document: &Path, format: Option<UserDataKind>) -> Result<()> {
    let (doc, cluster) = load_cluster(document)?;
    let version = doc
        .status
        .kubernetes_version
        .clone()
        .or_else(|| doc.options.kubernetes_version.clone())
        .context("run document has no Kubernetes version")?;
    let format = format
        .map(UserDataFormat::from)
        .unwrap_or(doc.options.user_data_format);

    let mut input = UserDataInput::for_cluster(&cluster, &version);
    input.nodeadm_feature_gates = extract_feature_gates(&doc.options.nodeadm_feature_gates)?;
    input.set_cluster_dns_ip = doc.options.set_cluster_dns_ip;
    let rendered = userdata::render(format, &input)?;
    print!("{}", rendered.body);
    Ok(())
}

#[derive(Tabled)]
struct SubnetRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "CIDR")]
    cidr: String,
}

/// Print the CIDRs the VPC block splits into for `count` subnets
pub fn subnets(count: usize, format: OutputFormat) -> Result<()> {
    let rows: Vec<SubnetRow> = subnet_cidrs(count)?
        .into_iter()
        .enumerate()
        .map(|(index, cidr)| SubnetRow { index, cidr })
        .collect();
    let cidrs: Vec<&str> = rows.iter().map(|r| r.cidr.as_str()).collect();
    let raw = serde_json::to_value(&cidrs)?;
    print_rows(rows, &raw, format)
}
