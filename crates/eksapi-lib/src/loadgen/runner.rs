//! Worker pool driving a load run
//!
//! Every client gets its own token bucket and up to two tasks: a writer
//! creating objects in the write namespace, and a reader cycling through
//! get, list and update-with-retry against the read namespaces. All loops
//! watch one [`StopSignal`]; the run's deadline is just another trigger of
//! that signal.

use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::config::{object_key, LoadConfig, OutputPaths};
use super::journal::{write_ndjson, Journal, RequestKind, RequestRecord, RequestStatus};
use super::limiter::RateLimiter;
use super::metrics::LoadMetrics;
use super::signal::{StopReason, StopSignal};
use super::summary::{RequestSummary, RunSummary};
use super::target::LoadTarget;
use crate::cloud::{retry_if, ObjectStoreApi, RetryConfig};
use crate::error::{Error, Result};

/// Time allowed for deleting created objects once the run has stopped
pub const CLEANUP_GRACE: Duration = Duration::from_secs(30);

const UPDATE_ATTEMPTS: u32 = 5;

/// What a finished run produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub summary: RunSummary,
    /// Objects created and not yet deleted when the workers stopped
    pub created: usize,
    /// Objects removed during cleanup
    pub deleted: usize,
    #[serde(skip)]
    pub reason: Option<StopReason>,
}

struct Shared {
    config: LoadConfig,
    target: Arc<dyn LoadTarget>,
    metrics: LoadMetrics,
    journal: Journal,
    stop: StopSignal,
    created: Mutex<Vec<String>>,
}

impl Shared {
    fn created(&self) -> MutexGuard<'_, Vec<String>> {
        self.created.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Issue one request under the per-request timeout
    ///
    /// Returns the result with the wall-clock start and the elapsed time.
    async fn issue<T, Fut>(&self, fut: Fut) -> (Result<T>, chrono::DateTime<Utc>, Duration)
    where
        Fut: Future<Output = Result<T>>,
    {
        let start = Utc::now();
        let began = Instant::now();
        let timeout = self.config.request_timeout();
        let result = match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout("load request", "", timeout)),
        };
        (result, start, began.elapsed())
    }

    fn record<T>(
        &self,
        kind: RequestKind,
        start: chrono::DateTime<Utc>,
        took: Duration,
        result: &Result<T>,
    ) {
        let status = match result {
            Ok(_) => RequestStatus::Ok,
            Err(Error::Timeout { .. }) => RequestStatus::Error("timeout".to_string()),
            Err(e) => RequestStatus::Error(e.to_string()),
        };
        let record = RequestRecord::timed(kind, start, took, status);
        self.metrics.observe(&record);
        self.journal.append(record);
    }

    fn recent_name(&self) -> Option<String> {
        let created = self.created();
        if created.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..created.len());
        Some(created[idx].clone())
    }

    fn pick_read_namespace(&self) -> String {
        let namespaces = &self.config.namespaces_read;
        let idx = rand::thread_rng().gen_range(0..namespaces.len());
        namespaces[idx].clone()
    }
}

fn random_payload(size: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(size)
        .map(char::from)
        .collect()
}

/// One configured load run
pub struct LoadRun {
    shared: Arc<Shared>,
}

impl LoadRun {
    pub fn new(
        config: LoadConfig,
        target: Arc<dyn LoadTarget>,
        metrics: LoadMetrics,
        stop: StopSignal,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                target,
                metrics,
                journal: Journal::new(),
                stop,
                created: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn config(&self) -> &LoadConfig {
        &self.shared.config
    }

    pub fn journal(&self) -> &Journal {
        &self.shared.journal
    }

    pub fn stop_signal(&self) -> &StopSignal {
        &self.shared.stop
    }

    /// Drive the workers until the stop signal fires, then clean up
    pub async fn run(&self) -> Result<RunOutcome> {
        let config = &self.shared.config;
        let (qps, burst) = config.per_client_rate();
        info!(
            clients = config.clients,
            qps = config.qps,
            burst = config.burst,
            deadline_secs = config.deadline_secs,
            writers = config.object_size > 0,
            readers = !config.namespaces_read.is_empty(),
            "Starting load run"
        );

        let deadline = self.shared.stop.trigger_after(config.deadline());
        let mut workers = JoinSet::new();
        for client in 0..config.clients {
            let limiter = Arc::new(RateLimiter::new(qps, burst));
            if config.object_size > 0 {
                workers.spawn(write_loop(self.shared.clone(), client, limiter.clone()));
            }
            if !config.namespaces_read.is_empty() {
                workers.spawn(read_loop(self.shared.clone(), limiter));
            }
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Load worker panicked");
            }
        }
        deadline.abort();

        let summary = RunSummary {
            writes: RequestSummary::from_records(&self.shared.journal.writes()),
            reads: RequestSummary::from_records(&self.shared.journal.reads()),
        };
        let created = self.shared.created().len();
        let deleted = if config.cleanup { self.cleanup().await } else { 0 };
        let reason = self.shared.stop.reason();
        info!(
            reason = ?reason,
            writes = summary.writes.count,
            reads = summary.reads.count,
            created,
            deleted,
            "Load run finished"
        );
        Ok(RunOutcome {
            summary,
            created,
            deleted,
            reason,
        })
    }

    /// Best-effort deletion of every created object within [`CLEANUP_GRACE`]
    pub async fn cleanup(&self) -> usize {
        let names = std::mem::take(&mut *self.shared.created());
        let total = names.len();
        let namespace = self.shared.config.namespace_write.clone();
        let mut deleted = 0usize;
        let work = async {
            for name in &names {
                match self.shared.target.delete(&namespace, name).await {
                    Ok(()) => deleted += 1,
                    Err(e) => debug!(name = %name, error = %e, "Cleanup delete failed"),
                }
            }
        };
        if tokio::time::timeout(CLEANUP_GRACE, work).await.is_err() {
            warn!(
                remaining = total - deleted,
                grace_secs = CLEANUP_GRACE.as_secs(),
                "Cleanup did not finish in time"
            );
        }
        deleted
    }

    /// Write the journals and the summary under `paths`, then upload all
    /// three when a bucket is configured
    pub async fn persist(
        &self,
        summary: &RunSummary,
        paths: &OutputPaths,
        object_store: Option<&dyn ObjectStoreApi>,
    ) -> Result<()> {
        let writes = write_ndjson(&paths.writes, &self.shared.journal.writes())?;
        let reads = write_ndjson(&paths.reads, &self.shared.journal.reads())?;
        let encoded = serde_json::to_vec_pretty(summary)
            .map_err(|e| Error::serialization(format!("encoding run summary: {}", e)))?;
        tokio::fs::write(&paths.summary, encoded).await?;
        info!(
            writes,
            reads,
            summary = %paths.summary.display(),
            "Wrote load run outputs"
        );

        let (Some(bucket), Some(store)) = (self.shared.config.bucket.as_deref(), object_store)
        else {
            return Ok(());
        };
        for path in paths.all() {
            upload(store, bucket, &self.shared.config.bucket_prefix, path).await?;
        }
        Ok(())
    }
}

async fn upload(store: &dyn ObjectStoreApi, bucket: &str, prefix: &str, path: &Path) -> Result<()> {
    let body = tokio::fs::read(path).await?;
    let key = object_key(prefix, path);
    store.put_object(bucket, &key, body).await?;
    info!(bucket = %bucket, key = %key, "Uploaded load run output");
    Ok(())
}

async fn write_loop(shared: Arc<Shared>, client: u32, limiter: Arc<RateLimiter>) {
    let payload = random_payload(shared.config.object_size);
    let namespace = shared.config.namespace_write.clone();
    let mut next_id = 0u64;
    loop {
        tokio::select! {
            biased;
            _ = shared.stop.stopped() => break,
            _ = limiter.acquire() => {}
        }
        next_id += 1;
        let name = format!("{}-{}-{}", shared.config.prefix, client, next_id);
        let (result, start, took) = shared
            .issue(shared.target.create(&namespace, &name, &payload))
            .await;
        match &result {
            Ok(()) => shared.created().push(name),
            Err(e) if e.is_conflict() => debug!(name = %name, "Object already exists"),
            Err(_) => {}
        }
        shared.record(RequestKind::Write, start, took, &result);
    }
    debug!(client, "Writer stopped");
}

async fn read_loop(shared: Arc<Shared>, limiter: Arc<RateLimiter>) {
    let payload = random_payload(shared.config.object_size.max(1));
    let update_retry = RetryConfig {
        max_attempts: UPDATE_ATTEMPTS,
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_secs(1),
        backoff_multiplier: 2.0,
    };
    let mut iteration = 0u64;
    loop {
        tokio::select! {
            biased;
            _ = shared.stop.stopped() => break,
            _ = limiter.acquire() => {}
        }
        iteration += 1;

        let namespace = shared.pick_read_namespace();
        let recent = if namespace == shared.config.namespace_write {
            shared.recent_name()
        } else {
            None
        };
        match (iteration % 3, recent) {
            (0, Some(name)) => {
                let (result, start, took) = shared.issue(shared.target.get(&namespace, &name)).await;
                shared.record(RequestKind::Read, start, took, &result);
            }
            (2, Some(name)) => {
                let target = shared.target.clone();
                let update = retry_if(&update_retry, "update", Error::is_conflict, || {
                    target.update(&namespace, &name, &payload)
                });
                let (result, start, took) = shared.issue(update).await;
                shared.record(RequestKind::Update, start, took, &result);
            }
            _ => {
                let limit = shared.config.list_limit;
                let (result, start, took) =
                    shared.issue(shared.target.list(&namespace, limit)).await;
                shared.record(RequestKind::List, start, took, &result);
            }
        }
    }
    debug!("Reader stopped");
}
