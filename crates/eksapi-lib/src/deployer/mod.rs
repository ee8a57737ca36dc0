//! Deployer lifecycle engine
//!
//! [`Deployer`] drives one run through Up, IsUp, Down and Finish. Up
//! provisions infrastructure, then the cluster, then nodes, then load;
//! Down walks the same chain backwards and keeps going past failures so
//! as much as possible is removed. Progress is written back to the run
//! document after every phase.

mod teardown;


use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::addons::{registry, AddonContext, AddonPhase, Orchestrator};
use crate::cloud::{CloudClients, MetricUnit};
use crate::cluster::{describe_static_cluster, is_active, ClusterManager};
use crate::document::{ConfigDocument, DeployerStatus, LifecyclePhase};
use crate::error::{Error, Result};
use crate::k8s::{record_node_launch_metrics, wait_for_ready_nodes, ClusterApi, KubeClusterApi, NodeInfo};
use crate::kubeconfig::{self, AUTH_MAP_KEY, AUTH_MAP_NAME, AUTH_MAP_NAMESPACE};
use crate::loadgen::{KubeLoadTarget, LoadTarget, StopSignal};
use crate::logs::{LogManager, Phase};
use crate::metrics::{MetricRegistry, MetricSpec, MonitoringSink};
use crate::models::{Architecture, Cluster, Infrastructure, NodeStrategy};
use crate::nodes::{ensure_static_nodes, teardown_static_nodes, NodeManager};
use crate::observability::ProgressLogger;
use crate::options::DeployerOptions;
use crate::resolver::resolve_ami;
use crate::stack::InfrastructureManager;

pub use self::teardown::{teardown, TeardownOptions};

const RUN_ID_LENGTH: usize = 10;
const RUN_ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

fn total_runtime() -> MetricSpec {
    MetricSpec::deployer("", "TotalRuntimeSeconds", MetricUnit::Seconds)
}

/// Random lowercase identifier usable in stack and cluster names
pub fn generate_run_id() -> String {
    let mut rng = rand::thread_rng();
    (0..RUN_ID_LENGTH)
        .map(|_| RUN_ID_CHARSET[rng.gen_range(0..RUN_ID_CHARSET.len())] as char)
        .collect()
}

/// Clients bound to one cluster's API server
#[derive(Clone)]
pub struct ClusterHandles {
    pub api: Arc<dyn ClusterApi>,
    pub load_target: Arc<dyn LoadTarget>,
}

/// Opens cluster clients from a written kubeconfig
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    async fn connect(&self, kubeconfig: &Path, cluster: &Cluster) -> Result<ClusterHandles>;
}

/// Connector backed by kube-rs
#[derive(Debug, Clone, Copy, Default)]
pub struct KubeConnector;

#[async_trait]
impl ClusterConnector for KubeConnector {
    async fn connect(&self, kubeconfig: &Path, _cluster: &Cluster) -> Result<ClusterHandles> {
        let api = KubeClusterApi::from_kubeconfig(kubeconfig).await?;
        let load_target = KubeLoadTarget::new(api.client().clone());
        Ok(ClusterHandles {
            api: Arc::new(api),
            load_target: Arc::new(load_target),
        })
    }
}

pub struct Deployer {
    options: DeployerOptions,
    clients: CloudClients,
    connector: Arc<dyn ClusterConnector>,
    resource_id: String,
    metrics: MetricRegistry,
    progress: ProgressLogger,
    stop: StopSignal,
    addons: Orchestrator,
    document: Option<PathBuf>,
    status: DeployerStatus,
    handles: Option<ClusterHandles>,
    started: Instant,
}

impl Deployer {
    /// Validate options and reserve the run's identity
    pub fn new(
        options: DeployerOptions,
        clients: CloudClients,
        connector: Arc<dyn ClusterConnector>,
    ) -> Result<Self> {
        Self::init(options, DeployerStatus::default(), None, clients, connector)
    }

    /// Resume from a run document, keeping the identity it records
    pub fn from_document(
        path: &Path,
        clients: CloudClients,
        connector: Arc<dyn ClusterConnector>,
    ) -> Result<Self> {
        let doc = ConfigDocument::load(path)?;
        Self::init(
            doc.options,
            doc.status,
            Some(path.to_path_buf()),
            clients,
            connector,
        )
    }

    fn init(
        mut options: DeployerOptions,
        mut status: DeployerStatus,
        document: Option<PathBuf>,
        clients: CloudClients,
        connector: Arc<dyn ClusterConnector>,
    ) -> Result<Self> {
        options.apply_defaults();
        options.validate()?;

        let run_id = options.run_id.get_or_insert_with(generate_run_id).clone();
        let resource_id = status
            .resource_id
            .clone()
            .unwrap_or_else(|| crate::models::resource_id(&run_id));
        status.resource_id = Some(resource_id.clone());
        status.started_at.get_or_insert_with(Utc::now);

        let metrics = if options.emit_metrics {
            MetricRegistry::new(Arc::new(MonitoringSink::new(
                clients.monitoring.clone(),
                clients.retry.clone(),
            )))
        } else {
            MetricRegistry::noop()
        };

        let addons = Orchestrator::new(registry(&options))?;

        info!(resource_id = %resource_id, strategy = %options.node_strategy, "Initialized deployer");
        Ok(Self {
            progress: ProgressLogger::new(resource_id.clone()),
            addons,
            options,
            clients,
            connector,
            resource_id,
            metrics,
            stop: StopSignal::new(),
            document,
            status,
            handles: None,
            started: Instant::now(),
        })
    }

    /// Share a process-wide stop signal with Up and the add-ons
    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    pub fn options(&self) -> &DeployerOptions {
        &self.options
    }

    pub fn status(&self) -> &DeployerStatus {
        &self.status
    }

    pub fn metrics(&self) -> &MetricRegistry {
        &self.metrics
    }

    fn is_static(&self) -> bool {
        self.options.static_cluster_name.is_some()
    }

    fn save(&self) -> Result<()> {
        let Some(path) = &self.document else {
            return Ok(());
        };
        ConfigDocument {
            options: self.options.clone(),
            status: self.status.clone(),
        }
        .save(path)
    }

    fn advance(&mut self, phase: LifecyclePhase) -> Result<()> {
        self.status.advance(phase);
        info!(resource_id = %self.resource_id, phase = %phase, "Lifecycle phase reached");
        self.save()
    }

    fn record_failure(&mut self, err: &Error) {
        self.status.fail(err);
        if let Err(e) = self.save() {
            warn!(error = %e, "Failed to record failure in run document");
        }
    }

    /// Bring the whole run up
    ///
    /// A stop signal abandons whatever Up is waiting on and returns
    /// [`Error::Cancelled`]; the resources created so far stay recorded in
    /// the status so [`Deployer::down`] can remove them.
    pub async fn up(&mut self) -> Result<()> {
        let stop = self.stop.clone();
        let id = self.resource_id.clone();
        let result = tokio::select! {
            biased;
            reason = stop.stopped() => {
                warn!(resource_id = %id, reason = ?reason, "Stop signal received during up");
                Err(Error::cancelled("up"))
            }
            result = self.run_up() => result,
        };
        match result {
            Ok(()) => self.advance(LifecyclePhase::Up),
            Err(e) => {
                self.record_failure(&e);
                Err(e)
            }
        }
    }

    async fn run_up(&mut self) -> Result<()> {
        let id = self.resource_id.clone();
        let version = self.kubernetes_version().await?;

        let (infra, cluster) = match self.options.static_cluster_name.clone() {
            Some(name) => {
                let cluster = self
                    .progress
                    .step(
                        "describe static cluster",
                        &name,
                        describe_static_cluster(&self.clients, &name, self.options.ip_family),
                    )
                    .await?;
                (None, cluster)
            }
            None => {
                let manager =
                    InfrastructureManager::new(self.clients.clone(), &id, self.metrics.clone());
                let infra = self
                    .progress
                    .step(
                        "create infrastructure",
                        &id,
                        manager.create(&self.options.infra_stack_options()),
                    )
                    .await?;
                self.status.infrastructure = Some(infra.clone());
                self.advance(LifecyclePhase::InfraReady)?;

                let manager = ClusterManager::new(self.clients.clone(), &id);
                let cluster = self
                    .progress
                    .step(
                        "create cluster",
                        &id,
                        manager.create(&infra, &self.options.cluster_options(&version)),
                    )
                    .await?;
                (Some(infra), cluster)
            }
        };
        self.status.cluster = Some(cluster.clone());

        let kubeconfig = self.write_kubeconfig(&cluster)?;
        self.advance(LifecyclePhase::ClusterReady)?;

        let handles = self
            .progress
            .step(
                "connect to cluster",
                &cluster.name,
                self.connector.connect(&kubeconfig, &cluster),
            )
            .await?;
        self.handles = Some(handles.clone());
        let api = handles.api.as_ref();

        if let (NodeStrategy::Unmanaged, Some(infra)) = (self.options.node_strategy, &infra) {
            let data = [(
                AUTH_MAP_KEY.to_string(),
                kubeconfig::render_map_roles(&infra.node_role_arn, self.options.node_name_strategy),
            )]
            .into_iter()
            .collect();
            self.progress
                .step(
                    "apply node auth map",
                    AUTH_MAP_NAME,
                    api.apply_config_map(AUTH_MAP_NAMESPACE, AUTH_MAP_NAME, data),
                )
                .await?;
        }

        let ctx = self.addon_context(&cluster, infra.clone(), Some(&handles), &version);
        self.progress
            .step("apply add-ons", &id, self.addons.up(AddonPhase::Cluster, &ctx))
            .await?;

        let count = self.options.node_count();
        match &infra {
            _ if count == 0 => info!(resource_id = %id, "No nodes requested"),
            None => {
                self.progress
                    .step("scale static cluster", &cluster.name, ensure_static_nodes(api, count))
                    .await?;
            }
            Some(infra) => {
                let mut node_opts = self.options.node_options(&version);
                if node_opts.strategy == NodeStrategy::Unmanaged && node_opts.ami.is_none() {
                    let ami = self
                        .progress
                        .step("resolve AMI", &id, self.resolve_node_ami(&version))
                        .await?;
                    node_opts.ami = Some(ami);
                }
                let manager = NodeManager::new(self.clients.clone(), &id);
                let instance_types = self
                    .progress
                    .step(
                        "create nodes",
                        &id,
                        manager.create(infra, &cluster, &node_opts, Some(api)),
                    )
                    .await?;
                self.status.instance_types = instance_types;
            }
        }

        let mut ready: Vec<NodeInfo> = Vec::new();
        if self.options.skip_node_readiness_wait {
            info!(resource_id = %id, "Skipping node readiness wait");
        } else if count > 0 {
            ready = self
                .progress
                .step(
                    "wait for nodes",
                    &cluster.name,
                    wait_for_ready_nodes(api, count as usize, self.options.node_ready_timeout()),
                )
                .await?;
        }
        self.advance(LifecyclePhase::NodesReady)?;

        if self.options.emit_metrics && !ready.is_empty() {
            self.progress
                .advisory(
                    "record node launch metrics",
                    &id,
                    record_node_launch_metrics(&self.clients, &ready, &self.metrics),
                )
                .await;
        }

        let logs = LogManager::new(self.clients.clone(), &id);
        self.progress
            .advisory(
                "gather node logs",
                &id,
                logs.gather(Some(api), &self.options.log_options(), Phase::Up),
            )
            .await;

        self.progress
            .step("run workloads", &id, self.addons.up(AddonPhase::Workloads, &ctx))
            .await
    }

    /// Whether the run's cluster is Active
    pub async fn is_up(&self) -> Result<bool> {
        match &self.options.static_cluster_name {
            Some(name) => {
                let description = self
                    .clients
                    .call("DescribeCluster", || self.clients.eks.describe_cluster(name))
                    .await?
                    .ok_or_else(|| Error::not_found("cluster", name))?;
                is_active(&description)
            }
            None => {
                ClusterManager::new(self.clients.clone(), &self.resource_id)
                    .is_up()
                    .await
            }
        }
    }

    /// Tear the run down, attempting every step even after failures
    pub async fn down(&mut self) -> Result<()> {
        if let Err(e) = self.advance(LifecyclePhase::TearingDown) {
            warn!(error = %e, "Failed to record teardown in run document");
        }
        let id = self.resource_id.clone();
        let handles = self.handles_for_down().await;
        let api = handles.as_ref().map(|h| h.api.as_ref());

        // logs have to be collected before anything is deleted
        let logs = LogManager::new(self.clients.clone(), &id);
        self.progress
            .advisory(
                "gather node logs",
                &id,
                logs.gather(api, &self.options.log_options(), Phase::Down),
            )
            .await;

        let version = self
            .status
            .kubernetes_version
            .clone()
            .or_else(|| self.options.kubernetes_version.clone())
            .unwrap_or_default();
        let cluster = self.status.cluster.clone().unwrap_or_else(|| Cluster {
            name: id.clone(),
            ..Default::default()
        });
        let ctx = self.addon_context(
            &cluster,
            self.status.infrastructure.clone(),
            handles.as_ref(),
            &version,
        );
        self.progress
            .advisory("finalize add-ons", &id, self.addons.down(&ctx))
            .await;

        let result = if self.is_static() {
            match api {
                Some(api) => {
                    self.progress
                        .step("remove static nodes", &cluster.name, teardown_static_nodes(api))
                        .await
                }
                None => Err(Error::invalid_config(
                    "cannot reach the static cluster to remove its nodes",
                )),
            }
        } else {
            let opts = TeardownOptions {
                auto_mode: self.options.auto_mode(),
                node_deletion_timeout: self.options.node_deletion_timeout(),
                cluster_deletion_timeout: Some(self.options.cluster_deletion_timeout()),
            };
            teardown(&self.clients, &id, api, &opts, &self.metrics, &self.progress).await
        };

        match result {
            Ok(()) => {
                self.handles = None;
                self.advance(LifecyclePhase::Down)
            }
            Err(e) => {
                self.record_failure(&e);
                Err(e)
            }
        }
    }

    /// Record the total runtime and flush buffered metrics
    pub async fn finish(&mut self) -> Result<()> {
        let elapsed = self.started.elapsed().as_secs_f64();
        self.metrics.record(&total_runtime(), elapsed, Default::default());
        info!(resource_id = %self.resource_id, total_runtime_secs = elapsed, "Run finished");
        self.progress
            .advisory("emit metrics", &self.resource_id, self.metrics.emit())
            .await;
        Ok(())
    }

    /// Path of the run's kubeconfig, writing it first if needed
    pub async fn kubeconfig(&mut self) -> Result<PathBuf> {
        if let Some(path) = self.status.kubeconfig_path.clone().filter(|p| p.exists()) {
            return Ok(path);
        }
        let cluster = match self.status.cluster.clone() {
            Some(cluster) => cluster,
            None => self
                .current_cluster()
                .await?
                .ok_or_else(|| Error::not_found("cluster", &self.resource_id))?,
        };
        let path = self.write_kubeconfig(&cluster)?;
        self.save()?;
        Ok(path)
    }

    fn write_kubeconfig(&mut self, cluster: &Cluster) -> Result<PathBuf> {
        let path = kubeconfig::default_path(&self.options.run_dir, &self.resource_id);
        kubeconfig::write(&path, cluster)?;
        self.status.kubeconfig_path = Some(path.clone());
        Ok(path)
    }

    async fn current_cluster(&self) -> Result<Option<Cluster>> {
        match &self.options.static_cluster_name {
            Some(name) => {
                describe_static_cluster(&self.clients, name, self.options.ip_family)
                    .await
                    .map(Some)
            }
            None => {
                ClusterManager::new(self.clients.clone(), &self.resource_id)
                    .get(self.options.ip_family)
                    .await
            }
        }
    }

    /// Cluster clients for teardown; `None` if the cluster is unreachable
    async fn handles_for_down(&mut self) -> Option<ClusterHandles> {
        if let Some(handles) = &self.handles {
            return Some(handles.clone());
        }
        let cluster = match self.current_cluster().await {
            Ok(Some(cluster)) => cluster,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "Cluster is not reachable, tearing down without it");
                return None;
            }
        };
        let path = match self.write_kubeconfig(&cluster) {
            Ok(path) => path,
            Err(e) => {
                warn!(error = %e, "Failed to write kubeconfig for teardown");
                return None;
            }
        };
        match self.connector.connect(&path, &cluster).await {
            Ok(handles) => {
                self.status.cluster = Some(cluster);
                self.handles = Some(handles.clone());
                Some(handles)
            }
            Err(e) => {
                warn!(error = %e, "Failed to connect to cluster for teardown");
                None
            }
        }
    }

    async fn kubernetes_version(&mut self) -> Result<String> {
        let known = self
            .options
            .kubernetes_version
            .clone()
            .or_else(|| self.status.kubernetes_version.clone());
        let version = match known {
            Some(version) => version,
            None => {
                let version = self
                    .clients
                    .call("DescribeClusterVersions", || {
                        self.clients.eks.default_kubernetes_version()
                    })
                    .await?;
                info!(version = %version, "Using default Kubernetes version");
                version
            }
        };
        self.status.kubernetes_version = Some(version.clone());
        Ok(version)
    }

    /// Image for unmanaged nodes when none was given
    async fn resolve_node_ami(&self, version: &str) -> Result<String> {
        let arch = self.node_architecture().await?;
        resolve_ami(&self.clients, self.options.user_data_format, version, arch).await
    }

    async fn node_architecture(&self) -> Result<Architecture> {
        if let Some(arch) = self.options.instance_type_archs.first() {
            return arch.parse();
        }
        let Some(instance_type) = self.options.instance_types.first() else {
            return Ok(Architecture::X86_64);
        };
        let info = self
            .clients
            .call("DescribeInstanceTypes", || {
                self.clients.compute.describe_instance_type(instance_type)
            })
            .await?
            .ok_or_else(|| {
                Error::invalid_config(format!("unknown instance type {}", instance_type))
            })?;
        info.architectures.first().copied().ok_or_else(|| {
            Error::invalid_config(format!("instance type {} reports no architecture", instance_type))
        })
    }

    fn addon_context(
        &self,
        cluster: &Cluster,
        infra: Option<Infrastructure>,
        handles: Option<&ClusterHandles>,
        version: &str,
    ) -> AddonContext {
        AddonContext {
            clients: self.clients.clone(),
            resource_id: self.resource_id.clone(),
            cluster: cluster.clone(),
            infra,
            k8s: handles.map(|h| h.api.clone()),
            load_target: handles.map(|h| h.load_target.clone()),
            kubernetes_version: version.to_string(),
            stop: self.stop.clone(),
        }
    }
}
