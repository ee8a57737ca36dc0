//! Deployer options
//!
//! Options come from an optional YAML document overlaid by `EKSAPI_*`
//! environment variables (`__` separates nested keys). They are frozen
//! once the deployer is initialized.

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Deserializer, Serialize};

use crate::addons::{EchoJobConfig, ObjectWritesConfig};
use crate::cloud::CloudEndpoint;
use crate::cluster::ClusterOptions;
use crate::error::{Error, Result};
use crate::loadgen::LoadConfig;
use crate::logs::LogOptions;
use crate::models::{IpFamily, NodeNameStrategy, NodeStrategy, UserDataFormat};
use crate::nodes::NodeOptions;
use crate::resolver::zones::{hinted_order_from_env, ZoneRequest};
use crate::stack::InfraStackOptions;

pub const ENV_PREFIX: &str = "EKSAPI";

/// AMI type managed nodes get when nothing else picks one
pub const DEFAULT_MANAGED_AMI_TYPE: &str = "AL2023_x86_64_STANDARD";

/// Accept either a sequence or one comma-separated string
///
/// Environment values always arrive as strings.
pub(crate) fn string_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        List(Vec<String>),
        Joined(String),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::List(items) => items,
        Raw::Joined(joined) => joined
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
    })
}

fn default_nodes() -> i64 {
    3
}

fn default_zone_type() -> String {
    "availability-zone".to_string()
}

fn default_run_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_cluster_creation_timeout() -> u64 {
    15 * 60
}

fn default_cluster_deletion_timeout() -> u64 {
    15 * 60
}

fn default_node_creation_timeout() -> u64 {
    20 * 60
}

fn default_node_ready_timeout() -> u64 {
    5 * 60
}

fn default_node_deletion_timeout() -> u64 {
    20 * 60
}

/// Everything a run is configured with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployerOptions {
    /// Run identifier; a random one is generated when unset
    #[serde(default)]
    pub run_id: Option<String>,

    /// Kubernetes `major.minor`; the control plane default when unset
    #[serde(default)]
    pub kubernetes_version: Option<String>,

    #[serde(default)]
    pub ip_family: IpFamily,

    #[serde(default = "default_nodes")]
    pub nodes: i64,

    #[serde(default)]
    pub node_strategy: NodeStrategy,

    #[serde(default, deserialize_with = "string_list")]
    pub instance_types: Vec<String>,

    /// Architectures to pick default instance types for
    #[serde(default, deserialize_with = "string_list")]
    pub instance_type_archs: Vec<String>,

    #[serde(default)]
    pub ami: Option<String>,

    /// Managed AMI type, e.g. `AL2023_x86_64_STANDARD`
    #[serde(default)]
    pub ami_type: Option<String>,

    #[serde(default)]
    pub expected_ami: Option<String>,

    #[serde(default)]
    pub user_data_format: UserDataFormat,

    #[serde(default)]
    pub node_name_strategy: NodeNameStrategy,

    #[serde(default, deserialize_with = "string_list")]
    pub nodeadm_feature_gates: Vec<String>,

    #[serde(default)]
    pub set_cluster_dns_ip: bool,

    #[serde(default)]
    pub efa: bool,

    #[serde(default)]
    pub capacity_reservation: bool,

    #[serde(default)]
    pub capacity_reservation_id: Option<String>,

    #[serde(default, deserialize_with = "string_list")]
    pub availability_zones: Vec<String>,

    #[serde(default = "default_zone_type")]
    pub zone_type: String,

    /// Extra service principal trusted by the cluster role
    #[serde(default)]
    pub cluster_role_service_principal: Option<String>,

    /// Existing cluster to run against instead of creating one
    #[serde(default)]
    pub static_cluster_name: Option<String>,

    #[serde(default)]
    pub log_bucket: Option<String>,

    /// Managed add-ons as `name:version`
    #[serde(default, deserialize_with = "string_list")]
    pub addons: Vec<String>,

    /// Synthetic load run after nodes are ready
    #[serde(default)]
    pub load: Option<LoadConfig>,

    /// ConfigMap writes after nodes are ready
    #[serde(default)]
    pub configmaps: Option<ObjectWritesConfig>,

    /// Secret writes after nodes are ready
    #[serde(default)]
    pub secrets: Option<ObjectWritesConfig>,

    /// Echo Job after nodes are ready
    #[serde(default)]
    pub jobs_echo: Option<EchoJobConfig>,

    /// Echo CronJob after nodes are ready
    #[serde(default)]
    pub cron_jobs: Option<EchoJobConfig>,

    #[serde(default)]
    pub skip_node_readiness_wait: bool,

    #[serde(default)]
    pub emit_metrics: bool,

    #[serde(default)]
    pub region: Option<String>,

    #[serde(default)]
    pub endpoint_url: Option<String>,

    /// Directory the kubeconfig is written to
    #[serde(default = "default_run_dir")]
    pub run_dir: PathBuf,

    #[serde(default = "default_cluster_creation_timeout")]
    pub cluster_creation_timeout_secs: u64,

    #[serde(default = "default_cluster_deletion_timeout")]
    pub cluster_deletion_timeout_secs: u64,

    #[serde(default = "default_node_creation_timeout")]
    pub node_creation_timeout_secs: u64,

    #[serde(default = "default_node_ready_timeout")]
    pub node_ready_timeout_secs: u64,

    #[serde(default = "default_node_deletion_timeout")]
    pub node_deletion_timeout_secs: u64,
}

impl Default for DeployerOptions {
    fn default() -> Self {
        Self {
            run_id: None,
            kubernetes_version: None,
            ip_family: IpFamily::default(),
            nodes: default_nodes(),
            node_strategy: NodeStrategy::default(),
            instance_types: Vec::new(),
            instance_type_archs: Vec::new(),
            ami: None,
            ami_type: None,
            expected_ami: None,
            user_data_format: UserDataFormat::default(),
            node_name_strategy: NodeNameStrategy::default(),
            nodeadm_feature_gates: Vec::new(),
            set_cluster_dns_ip: false,
            efa: false,
            capacity_reservation: false,
            capacity_reservation_id: None,
            availability_zones: Vec::new(),
            zone_type: default_zone_type(),
            cluster_role_service_principal: None,
            static_cluster_name: None,
            log_bucket: None,
            addons: Vec::new(),
            load: None,
            configmaps: None,
            secrets: None,
            jobs_echo: None,
            cron_jobs: None,
            skip_node_readiness_wait: false,
            emit_metrics: false,
            region: None,
            endpoint_url: None,
            run_dir: default_run_dir(),
            cluster_creation_timeout_secs: default_cluster_creation_timeout(),
            cluster_deletion_timeout_secs: default_cluster_deletion_timeout(),
            node_creation_timeout_secs: default_node_creation_timeout(),
            node_ready_timeout_secs: default_node_ready_timeout(),
            node_deletion_timeout_secs: default_node_deletion_timeout(),
        }
    }
}

fn blank_to_none(value: &mut Option<String>) {
    if value.as_deref().is_some_and(|v| v.trim().is_empty()) {
        *value = None;
    }
}

impl DeployerOptions {
    /// Load from an optional YAML file and the `EKSAPI_*` environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml).required(false));
        }
        let env = Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__");
        let config = builder
            .add_source(env)
            .build()
            .map_err(|e| Error::invalid_config(format!("loading options: {}", e)))?;
        config
            .try_deserialize()
            .map_err(|e| Error::invalid_config(format!("parsing options: {}", e)))
    }

    /// Fill in options implied by others
    pub fn apply_defaults(&mut self) {
        blank_to_none(&mut self.log_bucket);
        blank_to_none(&mut self.ami);
        blank_to_none(&mut self.ami_type);
        blank_to_none(&mut self.capacity_reservation_id);
        blank_to_none(&mut self.static_cluster_name);
        blank_to_none(&mut self.kubernetes_version);
        if self.capacity_reservation_id.is_some() {
            self.capacity_reservation = true;
        }
        if self.node_strategy == NodeStrategy::Managed
            && self.ami_type.is_none()
            && self.ami.is_none()
            && self.instance_type_archs.is_empty()
        {
            self.ami_type = Some(DEFAULT_MANAGED_AMI_TYPE.to_string());
        }
    }

    /// Reject inconsistent combinations
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(Error::invalid_config(msg));
        if self.nodes < 0 {
            return Err(Error::invalid_config(format!(
                "node count must not be negative, got {}",
                self.nodes
            )));
        }
        if self.ami.is_some() && self.ami_type.is_some() {
            return invalid("ami and ami_type are mutually exclusive");
        }
        if !self.instance_types.is_empty() && !self.instance_type_archs.is_empty() {
            return invalid("instance_types and instance_type_archs are mutually exclusive");
        }
        for arch in &self.instance_type_archs {
            arch.parse::<crate::models::Architecture>()?;
        }
        match self.node_strategy {
            NodeStrategy::Unmanaged if self.ami_type.is_some() => {
                return invalid("unmanaged nodes take an ami, not an ami_type");
            }
            NodeStrategy::Managed if self.ami.is_some() => {
                return invalid("managed nodes take an ami_type, not an ami");
            }
            NodeStrategy::Auto
                if self.ami.is_some() || self.ami_type.is_some() || self.expected_ami.is_some() =>
            {
                return invalid("auto nodes do not take an ami or ami_type");
            }
            _ => {}
        }
        if self.node_name_strategy != NodeNameStrategy::default()
            && self.node_strategy != NodeStrategy::Unmanaged
        {
            return invalid("node_name_strategy only applies to unmanaged nodes");
        }
        if self.efa {
            if self.instance_types.len() != 1 {
                return invalid("efa requires exactly one instance type");
            }
            if self.node_strategy != NodeStrategy::Unmanaged {
                return invalid("efa requires unmanaged nodes");
            }
        }
        if self.capacity_reservation_id.is_some() && !self.capacity_reservation {
            return invalid("capacity_reservation_id implies capacity_reservation");
        }
        if self.static_cluster_name.is_some() && self.node_strategy == NodeStrategy::Unmanaged {
            return invalid("static clusters cannot use unmanaged nodes");
        }
        if let Some(load) = &self.load {
            load.validate()?;
        }
        for writes in [&self.configmaps, &self.secrets].into_iter().flatten() {
            writes.validate()?;
        }
        for jobs in [&self.jobs_echo, &self.cron_jobs].into_iter().flatten() {
            jobs.validate()?;
        }
        Ok(())
    }

    pub fn auto_mode(&self) -> bool {
        self.node_strategy == NodeStrategy::Auto
    }

    pub fn node_count(&self) -> u32 {
        u32::try_from(self.nodes).unwrap_or_default()
    }

    pub fn endpoint(&self) -> CloudEndpoint {
        CloudEndpoint {
            region: self.region.clone(),
            endpoint_url: self.endpoint_url.clone(),
        }
    }

    pub fn node_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.node_ready_timeout_secs)
    }

    pub fn node_deletion_timeout(&self) -> Duration {
        Duration::from_secs(self.node_deletion_timeout_secs)
    }

    pub fn cluster_deletion_timeout(&self) -> Duration {
        Duration::from_secs(self.cluster_deletion_timeout_secs)
    }

    pub fn infra_stack_options(&self) -> InfraStackOptions {
        InfraStackOptions {
            zones: ZoneRequest {
                instance_types: self.instance_types.clone(),
                availability_zones: self.availability_zones.clone(),
                capacity_reservation: self.capacity_reservation,
                capacity_reservation_id: self.capacity_reservation_id.clone(),
                node_count: self.node_count(),
                zone_type: self.zone_type.clone(),
                hinted_order: hinted_order_from_env(),
            },
            auto_mode: self.auto_mode(),
            cluster_role_service_principal: self.cluster_role_service_principal.clone(),
        }
    }

    pub fn cluster_options(&self, kubernetes_version: &str) -> ClusterOptions {
        ClusterOptions {
            kubernetes_version: kubernetes_version.to_string(),
            ip_family: self.ip_family,
            auto_mode: self.auto_mode(),
            cluster_role_arn_override: None,
            creation_timeout: Some(Duration::from_secs(self.cluster_creation_timeout_secs)),
            deletion_timeout: Some(self.cluster_deletion_timeout()),
        }
    }

    pub fn node_options(&self, kubernetes_version: &str) -> NodeOptions {
        NodeOptions {
            strategy: self.node_strategy,
            nodes: self.node_count(),
            instance_types: self.instance_types.clone(),
            instance_type_archs: self.instance_type_archs.clone(),
            ami: self.ami.clone(),
            ami_type: self.ami_type.clone(),
            user_data_format: self.user_data_format,
            kubernetes_version: kubernetes_version.to_string(),
            nodeadm_feature_gates: self.nodeadm_feature_gates.clone(),
            set_cluster_dns_ip: self.set_cluster_dns_ip,
            efa: self.efa,
            capacity_reservation: self.capacity_reservation,
            capacity_reservation_id: self.capacity_reservation_id.clone(),
            expected_ami: self.expected_ami.clone(),
            az_hints: hinted_order_from_env(),
            node_creation_timeout: Duration::from_secs(self.node_creation_timeout_secs),
            node_deletion_timeout: self.node_deletion_timeout(),
        }
    }

    pub fn log_options(&self) -> LogOptions {
        LogOptions {
            bucket: self.log_bucket.clone(),
            auto_mode: self.auto_mode(),
            strategy: self.node_strategy,
            user_data_format: self.user_data_format,
        }
    }
}
