//! Control-plane managed add-ons

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, info};

use super::{Addon, AddonContext};
use crate::cloud::{wait_until, AddonStatus};
use crate::error::{Error, Result};

pub const ADDON_ACTIVE_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const ADDON_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Version requested for one add-on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddonVersion {
    /// Newest version compatible with the cluster
    Latest,
    /// Version the control plane installs by default
    Default,
    Exact(String),
}

/// One `name:version` entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddonRequest {
    pub name: String,
    pub version: AddonVersion,
}

impl FromStr for AddonRequest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || {
            Error::invalid_config(format!(
                "add-on must be name:version, with version latest, default or exact: {:?}",
                s
            ))
        };
        let (name, version) = s.split_once(':').ok_or_else(invalid)?;
        let (name, version) = (name.trim(), version.trim());
        if name.is_empty() || version.is_empty() {
            return Err(invalid());
        }
        let version = match version {
            "latest" => AddonVersion::Latest,
            "default" => AddonVersion::Default,
            exact => AddonVersion::Exact(exact.to_string()),
        };
        Ok(Self {
            name: name.to_string(),
            version,
        })
    }
}

/// Installs control-plane add-ons and waits for them to become active
#[derive(Debug, Clone, Default)]
pub struct ManagedAddons {
    specs: Vec<String>,
    requests: Vec<AddonRequest>,
    timeout: Option<Duration>,
}

impl ManagedAddons {
    pub fn new(specs: Vec<String>) -> Self {
        Self {
            specs,
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn requests(&self) -> &[AddonRequest] {
        &self.requests
    }

    async fn install(&self, ctx: &AddonContext, request: &AddonRequest) -> Result<()> {
        let clients = &ctx.clients;
        let cluster = ctx.cluster.name.as_str();
        let name = request.name.as_str();
        let version = match &request.version {
            AddonVersion::Exact(v) => v.clone(),
            other => {
                let default_version = matches!(other, AddonVersion::Default);
                clients
                    .call("DescribeAddonVersions", || {
                        clients
                            .eks
                            .resolve_addon_version(name, &ctx.kubernetes_version, default_version)
                    })
                    .await?
            }
        };
        info!(addon = %name, version = %version, cluster = %cluster, "Creating add-on");
        match clients
            .call("CreateAddon", || clients.eks.create_addon(cluster, name, &version))
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_conflict() => debug!(addon = %name, "Add-on already exists, adopting"),
            Err(e) => return Err(e),
        }

        let timeout = self.timeout.unwrap_or(ADDON_ACTIVE_TIMEOUT);
        wait_until("add-on activation", name, timeout, ADDON_POLL_INTERVAL, || async {
            let addon = clients
                .eks
                .describe_addon(cluster, name)
                .await?
                .ok_or_else(|| Error::not_found("addon", name))?;
            match addon.status {
                AddonStatus::Active => Ok(Some(())),
                AddonStatus::CreateFailed | AddonStatus::Degraded => Err(Error::cloud(
                    "CreateAddon",
                    format!("add-on {} is {:?}", name, addon.status),
                )),
                _ => Ok(None),
            }
        })
        .await?;
        info!(addon = %name, version = %version, "Add-on is active");
        Ok(())
    }

    async fn remove(&self, ctx: &AddonContext, name: &str) -> Result<()> {
        let clients = &ctx.clients;
        let cluster = ctx.cluster.name.as_str();
        match clients
            .call("DeleteAddon", || clients.eks.delete_addon(cluster, name))
            .await
        {
            Ok(()) => {
                info!(addon = %name, "Deleted add-on");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Addon for ManagedAddons {
    fn name(&self) -> &str {
        "managed-addons"
    }

    fn is_enabled(&self) -> bool {
        !self.specs.is_empty()
    }

    fn validate(&self) -> Result<()> {
        self.specs
            .iter()
            .map(|s| s.parse::<AddonRequest>())
            .collect::<Result<Vec<_>>>()
            .map(|_| ())
    }

    fn apply_defaults(&mut self) {
        self.requests = self
            .specs
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect();
    }

    async fn apply(&self, ctx: &AddonContext) -> Result<()> {
        let results = join_all(self.requests.iter().map(|r| self.install(ctx, r))).await;
        Error::aggregate(results.into_iter().filter_map(Result::err).collect())
    }

    async fn finalize(&self, ctx: &AddonContext) -> Result<()> {
        let results = join_all(self.requests.iter().map(|r| self.remove(ctx, &r.name))).await;
        Error::aggregate(results.into_iter().filter_map(Result::err).collect())
    }
}
