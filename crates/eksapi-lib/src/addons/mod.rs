//! Add-on orchestration
//!
//! Add-ons are grouped into ordered stages, each bound to the lifecycle
//! phase it runs in. Enabled add-ons within a stage run concurrently and
//! the stage waits for all of them. On the way up the first failing stage
//! stops the rest of its phase; on the way down every stage runs, in
//! reverse, and all errors are reported together.

mod jobs;
mod loadgen;
mod managed;
mod objects;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cloud::CloudClients;
use crate::error::{Error, Result};
use crate::k8s::ClusterApi;
use crate::loadgen::{LoadTarget, StopSignal};
use crate::models::{Cluster, Infrastructure};
use crate::options::DeployerOptions;

pub use self::jobs::{echo_cron_job, echo_job, EchoJobAddon, EchoJobConfig, JOB_NAME};
pub use self::loadgen::LoadGeneratorAddon;
pub use self::managed::{AddonVersion, ManagedAddons, ADDON_ACTIVE_TIMEOUT};
pub use self::objects::{ObjectWritesAddon, ObjectWritesConfig};

/// Everything an add-on may touch
#[derive(Clone)]
pub struct AddonContext {
    pub clients: CloudClients,
    pub resource_id: String,
    pub cluster: Cluster,
    /// Absent for static clusters
    pub infra: Option<Infrastructure>,
    pub k8s: Option<Arc<dyn ClusterApi>>,
    pub load_target: Option<Arc<dyn LoadTarget>>,
    pub kubernetes_version: String,
    /// Process-wide stop signal
    pub stop: StopSignal,
}

#[async_trait]
pub trait Addon: Send + Sync {
    fn name(&self) -> &str;

    fn is_enabled(&self) -> bool;

    /// Fill in unset options; called before [`Addon::validate`]
    fn apply_defaults(&mut self) {}

    fn validate(&self) -> Result<()> {
        Ok(())
    }

    async fn apply(&self, ctx: &AddonContext) -> Result<()>;

    /// Undo [`Addon::apply`]; missing resources are success
    async fn finalize(&self, ctx: &AddonContext) -> Result<()>;
}

/// Point in Up at which a stage runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddonPhase {
    /// Control plane is Active, nodes not yet requested
    Cluster,
    /// Nodes are Ready
    Workloads,
}

/// Add-ons that run together
pub struct Stage {
    pub phase: AddonPhase,
    pub addons: Vec<Box<dyn Addon>>,
}

impl Stage {
    pub fn new(phase: AddonPhase, addons: Vec<Box<dyn Addon>>) -> Self {
        Self { phase, addons }
    }
}

/// Every add-on the deployer knows, in the order they run
pub fn registry(options: &DeployerOptions) -> Vec<Stage> {
    vec![
        Stage::new(
            AddonPhase::Cluster,
            vec![Box::new(ManagedAddons::new(options.addons.clone()))],
        ),
        Stage::new(
            AddonPhase::Workloads,
            vec![
                Box::new(ObjectWritesAddon::config_maps(options.configmaps.clone())),
                Box::new(ObjectWritesAddon::secrets(options.secrets.clone())),
            ],
        ),
        Stage::new(
            AddonPhase::Workloads,
            vec![
                Box::new(EchoJobAddon::job(options.jobs_echo.clone())),
                Box::new(EchoJobAddon::cron_job(options.cron_jobs.clone())),
            ],
        ),
        Stage::new(
            AddonPhase::Workloads,
            vec![Box::new(LoadGeneratorAddon::new(options.load.clone()))],
        ),
    ]
}

#[derive(Clone, Copy)]
enum Direction {
    Apply,
    Finalize,
}

struct EnabledStage {
    phase: AddonPhase,
    addons: Vec<Arc<dyn Addon>>,
}

/// Ordered stages of enabled add-ons
#[derive(Default)]
pub struct Orchestrator {
    stages: Vec<EnabledStage>,
}

impl Orchestrator {
    /// Default and validate every enabled add-on; disabled ones and
    /// stages left empty are dropped
    pub fn new(stages: Vec<Stage>) -> Result<Self> {
        let mut kept = Vec::with_capacity(stages.len());
        for stage in stages {
            let mut enabled: Vec<Arc<dyn Addon>> = Vec::new();
            for mut addon in stage.addons {
                if !addon.is_enabled() {
                    debug!(addon = %addon.name(), "Add-on disabled");
                    continue;
                }
                addon.apply_defaults();
                addon.validate()?;
                enabled.push(Arc::from(addon));
            }
            if !enabled.is_empty() {
                kept.push(EnabledStage {
                    phase: stage.phase,
                    addons: enabled,
                });
            }
        }
        Ok(Self { stages: kept })
    }

    /// Names of enabled add-ons in `phase`, stage by stage
    pub fn enabled(&self, phase: AddonPhase) -> Vec<Vec<String>> {
        self.stages
            .iter()
            .filter(|stage| stage.phase == phase)
            .map(|stage| stage.addons.iter().map(|a| a.name().to_string()).collect())
            .collect()
    }

    /// Apply the stages of `phase` in order, stopping after the first
    /// stage with errors
    pub async fn up(&self, phase: AddonPhase, ctx: &AddonContext) -> Result<()> {
        let ctx = Arc::new(ctx.clone());
        for (i, stage) in self.stages.iter().filter(|s| s.phase == phase).enumerate() {
            let errors = run_stage(&stage.addons, &ctx, Direction::Apply).await;
            if !errors.is_empty() {
                warn!(phase = ?phase, stage = i, failed = errors.len(), "Add-on stage failed, skipping remaining stages");
                return Error::aggregate(errors);
            }
        }
        Ok(())
    }

    /// Finalize every stage of every phase in reverse, collecting all errors
    pub async fn down(&self, ctx: &AddonContext) -> Result<()> {
        let ctx = Arc::new(ctx.clone());
        let mut errors = Vec::new();
        for stage in self.stages.iter().rev() {
            errors.extend(run_stage(&stage.addons, &ctx, Direction::Finalize).await);
        }
        Error::aggregate(errors)
    }
}

async fn run_stage(
    stage: &[Arc<dyn Addon>],
    ctx: &Arc<AddonContext>,
    direction: Direction,
) -> Vec<Error> {
    let mut tasks = JoinSet::new();
    for addon in stage {
        let addon = addon.clone();
        let ctx = ctx.clone();
        tasks.spawn(async move {
            let name = addon.name().to_string();
            let result = match direction {
                Direction::Apply => addon.apply(&ctx).await,
                Direction::Finalize => addon.finalize(&ctx).await,
            };
            (name, result)
        });
    }

    let mut errors = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((name, Ok(()))) => info!(addon = %name, "Add-on done"),
            Ok((name, Err(e))) => {
                warn!(addon = %name, error = %e, "Add-on failed");
                errors.push(e);
            }
            Err(e) => errors.push(Error::cancelled(format!("add-on task: {}", e))),
        }
    }
    errors
}
