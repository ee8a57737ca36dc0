//! Progress reporting for lifecycle runs
//!
//! Every major step logs one line when it starts and one when it ends,
//! naming the operation and the id it targets. Failures carry the
//! operation, the id, the timeout when one applies, and the error.

use std::future::Future;
use std::time::Instant;

use tracing::{error, info, warn};

use crate::error::{Error, Result};

/// Structured progress logger for one run
#[derive(Clone, Debug)]
pub struct ProgressLogger {
    resource_id: String,
}

impl ProgressLogger {
    pub fn new(resource_id: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
        }
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    pub fn step_started(&self, operation: &str, target: &str) {
        info!(
            event = "step_started",
            resource_id = %self.resource_id,
            operation = %operation,
            target = %target,
            "Starting {}", operation
        );
    }

    pub fn step_finished(&self, operation: &str, target: &str, elapsed_secs: f64) {
        info!(
            event = "step_finished",
            resource_id = %self.resource_id,
            operation = %operation,
            target = %target,
            elapsed_secs = elapsed_secs,
            "Finished {}", operation
        );
    }

    pub fn step_failed(&self, operation: &str, target: &str, err: &Error) {
        match err {
            Error::Timeout { timeout, .. } => error!(
                event = "step_failed",
                resource_id = %self.resource_id,
                operation = %operation,
                target = %target,
                timeout_secs = timeout.as_secs(),
                error = %err,
                "{} timed out", operation
            ),
            _ => error!(
                event = "step_failed",
                resource_id = %self.resource_id,
                operation = %operation,
                target = %target,
                error = %err,
                "{} failed", operation
            ),
        }
    }

    /// A step whose failure does not fail the run
    pub fn advisory_failure(&self, operation: &str, target: &str, err: &Error) {
        warn!(
            event = "advisory_failure",
            resource_id = %self.resource_id,
            operation = %operation,
            target = %target,
            error = %err,
            "{} failed, continuing", operation
        );
    }

    /// Run `step` between a started and a finished/failed line
    pub async fn step<T, Fut>(&self, operation: &str, target: &str, step: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        self.step_started(operation, target);
        let started = Instant::now();
        match step.await {
            Ok(value) => {
                self.step_finished(operation, target, started.elapsed().as_secs_f64());
                Ok(value)
            }
            Err(e) => {
                self.step_failed(operation, target, &e);
                Err(e)
            }
        }
    }

    /// Like [`Self::step`] but failures are only logged
    pub async fn advisory<Fut>(&self, operation: &str, target: &str, step: Fut) -> bool
    where
        Fut: Future<Output = Result<()>>,
    {
        self.step_started(operation, target);
        let started = Instant::now();
        match step.await {
            Ok(()) => {
                self.step_finished(operation, target, started.elapsed().as_secs_f64());
                true
            }
            Err(e) => {
                self.advisory_failure(operation, target, &e);
                false
            }
        }
    }
}
