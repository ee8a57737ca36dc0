//! Synthetic load against the new cluster's API server

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::{info, warn};

use super::{Addon, AddonContext};
use crate::error::{Error, Result};
use crate::loadgen::{LoadConfig, LoadMetrics, LoadRun, RunOutcome, StopSignal};

/// Runs one load run during Up and writes its outputs
#[derive(Default)]
pub struct LoadGeneratorAddon {
    config: Option<LoadConfig>,
    run: Mutex<Option<Arc<LoadRun>>>,
    outcome: Mutex<Option<RunOutcome>>,
}

impl LoadGeneratorAddon {
    pub fn new(config: Option<LoadConfig>) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    fn run_slot(&self) -> MutexGuard<'_, Option<Arc<LoadRun>>> {
        self.run.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Outcome of the last completed run
    pub fn outcome(&self) -> Option<RunOutcome> {
        self.outcome
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl Addon for LoadGeneratorAddon {
    fn name(&self) -> &str {
        "load-generator"
    }

    fn is_enabled(&self) -> bool {
        self.config.is_some()
    }

    fn apply_defaults(&mut self) {
        if let Some(config) = self.config.as_mut() {
            if config.prefix.is_empty() {
                config.prefix = LoadConfig::default().prefix;
            }
        }
    }

    fn validate(&self) -> Result<()> {
        match &self.config {
            Some(config) => config.validate(),
            None => Ok(()),
        }
    }

    async fn apply(&self, ctx: &AddonContext) -> Result<()> {
        let Some(config) = self.config.clone() else {
            return Ok(());
        };
        let target = ctx.load_target.clone().ok_or_else(|| {
            Error::invalid_config("load generator needs a cluster client")
        })?;

        // the run's deadline must not stop the whole process
        let stop = StopSignal::new();
        let forward = {
            let parent = ctx.stop.clone();
            let child = stop.clone();
            tokio::spawn(async move {
                let reason = parent.stopped().await;
                child.trigger(reason);
            })
        };

        let paths = config.output_paths();
        let run = Arc::new(LoadRun::new(
            config,
            target,
            LoadMetrics::unregistered()?,
            stop,
        )?);
        *self.run_slot() = Some(run.clone());

        let outcome = run.run().await;
        forward.abort();
        let outcome = outcome?;
        info!(
            writes = outcome.summary.writes.count,
            reads = outcome.summary.reads.count,
            "Load run complete\n{}",
            outcome.summary.writes
        );
        run.persist(
            &outcome.summary,
            &paths,
            Some(ctx.clients.object_store.as_ref()),
        )
        .await?;
        *self.outcome.lock().unwrap_or_else(|e| e.into_inner()) = Some(outcome);
        Ok(())
    }

    /// Best-effort removal of anything the run left behind
    async fn finalize(&self, _ctx: &AddonContext) -> Result<()> {
        let run = self.run_slot().take();
        if let Some(run) = run {
            let deleted = run.cleanup().await;
            if deleted > 0 {
                info!(deleted, "Removed load generator objects");
            }
        } else {
            warn!("Load generator never ran, nothing to clean up");
        }
        Ok(())
    }
}
