//! Out-of-band sweep of leaked runs
//!
//! Every infrastructure stack whose name carries the resource prefix and
//! is older than the configured age is torn down with the same chain Down
//! uses, against the endpoint recorded in the stack's tags.
//! [`Janitor::sweep`] runs once; [`Janitor::run`] repeats it on an
//! interval until stopped.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::cloud::{CloudClientFactory, CloudClients, CloudEndpoint, StackStatus, StackSummary};
use crate::deployer::{teardown, TeardownOptions};
use crate::error::{Error, Result};
use crate::loadgen::{StopReason, StopSignal};
use crate::metrics::MetricRegistry;
use crate::models::RESOURCE_PREFIX;
use crate::nodes::unmanaged;
use crate::observability::ProgressLogger;

pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(3 * 60 * 60);

/// Outcome of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    /// Torn down, or would have been in a dry run
    pub swept: Vec<String>,
    pub failed: Vec<(String, String)>,
}

pub struct Janitor {
    clients: CloudClients,
    factory: Arc<dyn CloudClientFactory>,
    max_age: Duration,
    dry_run: bool,
}

impl Janitor {
    pub fn new(clients: CloudClients, factory: Arc<dyn CloudClientFactory>) -> Self {
        Self {
            clients,
            factory,
            max_age: DEFAULT_MAX_AGE,
            dry_run: false,
        }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Page through every stack and tear down the stale ones
    pub async fn sweep(&self) -> Result<SweepReport> {
        let stale = self.stale_stacks().await?;
        let mut report = SweepReport {
            examined: stale.len(),
            ..Default::default()
        };
        for name in stale {
            if self.dry_run {
                info!(stack = %name, "Would tear down stale run");
                report.swept.push(name);
                continue;
            }
            match self.sweep_one(&name).await {
                Ok(()) => report.swept.push(name),
                Err(e) => {
                    warn!(stack = %name, error = %e, "Failed to tear down stale run");
                    report.failed.push((name, e.to_string()));
                }
            }
        }
        info!(
            examined = report.examined,
            swept = report.swept.len(),
            failed = report.failed.len(),
            dry_run = self.dry_run,
            "Sweep complete"
        );
        Ok(report)
    }

    /// Sweep now and then every `interval` until `stop` fires
    ///
    /// A failed sweep is logged and retried on the next tick. A sweep in
    /// progress when the signal fires runs to completion first.
    pub async fn run(&self, interval: Duration, stop: &StopSignal) -> Result<StopReason> {
        if interval.is_zero() {
            return Err(Error::invalid_config("sweep interval must be positive"));
        }
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                reason = stop.stopped() => {
                    info!(reason = ?reason, "Janitor stopped");
                    return Ok(reason);
                }
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.sweep().await {
                warn!(error = %e, "Sweep failed, retrying next interval");
            }
        }
    }

    /// Listing finishes before anything is deleted so paging stays stable
    async fn stale_stacks(&self) -> Result<Vec<String>> {
        let mut stale = Vec::new();
        let mut next_token = None;
        loop {
            let page = self
                .clients
                .call("ListStacks", || {
                    self.clients.stacks.list_stacks(next_token.clone())
                })
                .await?;
            stale.extend(
                page.stacks
                    .into_iter()
                    .filter(|s| self.is_candidate(s))
                    .map(|s| s.name),
            );
            next_token = page.next_token;
            if next_token.is_none() {
                return Ok(stale);
            }
        }
    }

    fn is_candidate(&self, stack: &StackSummary) -> bool {
        if !stack.name.starts_with(RESOURCE_PREFIX) {
            return false;
        }
        // node stacks are removed by their run's teardown
        if stack.name.ends_with(unmanaged::STACK_SUFFIX) {
            return false;
        }
        if stack.status == StackStatus::DeleteComplete {
            return false;
        }
        let age = Utc::now().signed_duration_since(stack.creation_time);
        match age.to_std() {
            Ok(age) => age >= self.max_age,
            Err(_) => false,
        }
    }

    async fn sweep_one(&self, resource_id: &str) -> Result<()> {
        let stack = self
            .clients
            .call("DescribeStacks", || self.clients.stacks.describe_stack(resource_id))
            .await?
            .ok_or_else(|| Error::not_found("stack", resource_id))?;
        let endpoint =
            CloudEndpoint::from_stack_tags(self.clients.endpoint.region.clone(), &stack.tags);
        let clients = self.factory.clients_for(&endpoint)?;
        info!(
            stack = %resource_id,
            endpoint = ?endpoint.endpoint_url,
            "Tearing down stale run"
        );
        teardown(
            &clients,
            resource_id,
            None,
            &TeardownOptions::default(),
            &MetricRegistry::noop(),
            &ProgressLogger::new(resource_id),
        )
        .await
    }
}
