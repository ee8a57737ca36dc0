//! Metric registry
//!
//! Buffers dimensioned samples in memory for the whole run and flushes
//! them to a monitoring sink in batches at Finish. This is the only
//! process-wide mutable store; `record` is serialised behind a mutex and
//! `emit` drains the buffer atomically.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cloud::{MetricDatum, MetricUnit, MonitoringApi, RetryConfig};
use crate::error::{Error, Result};

/// Root namespace of everything the deployer records
pub const DEPLOYER_METRIC_NAMESPACE: &str = "kubetest2/eksapi";

/// Upper bound on samples per publish call
pub const MAX_BATCH_SIZE: usize = 1000;

/// Static description of a metric
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricSpec {
    pub namespace: String,
    pub metric: String,
    pub unit: MetricUnit,
}

impl MetricSpec {
    /// Spec under `kubetest2/eksapi/<sub_namespace>`
    pub fn deployer(sub_namespace: &str, metric: &str, unit: MetricUnit) -> Self {
        let namespace = if sub_namespace.is_empty() {
            DEPLOYER_METRIC_NAMESPACE.to_string()
        } else {
            format!("{}/{}", DEPLOYER_METRIC_NAMESPACE, sub_namespace)
        };
        Self {
            namespace,
            metric: metric.to_string(),
            unit,
        }
    }
}

/// One recorded sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub namespace: String,
    pub metric: String,
    pub value: f64,
    pub unit: MetricUnit,
    pub dimensions: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl MetricSample {
    fn into_datum(self) -> MetricDatum {
        MetricDatum {
            metric_name: self.metric,
            value: self.value,
            unit: self.unit,
            dimensions: self.dimensions,
            timestamp: self.timestamp,
        }
    }
}

/// Destination for emitted batches
#[async_trait]
pub trait MetricSink: Send + Sync {
    async fn publish(&self, namespace: &str, batch: Vec<MetricDatum>) -> Result<()>;
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

#[async_trait]
impl MetricSink for NoopSink {
    async fn publish(&self, namespace: &str, batch: Vec<MetricDatum>) -> Result<()> {
        debug!(namespace = %namespace, samples = batch.len(), "Discarding metric batch");
        Ok(())
    }
}

/// Sink that forwards batches to the monitoring service
pub struct MonitoringSink {
    api: Arc<dyn MonitoringApi>,
    retry: RetryConfig,
}

impl MonitoringSink {
    pub fn new(api: Arc<dyn MonitoringApi>, retry: RetryConfig) -> Self {
        Self { api, retry }
    }
}

#[async_trait]
impl MetricSink for MonitoringSink {
    async fn publish(&self, namespace: &str, batch: Vec<MetricDatum>) -> Result<()> {
        crate::cloud::call(
            &self.retry,
            "PutMetricData",
            crate::cloud::DESCRIBE_DEADLINE,
            || self.api.put_metric_data(namespace, batch.clone()),
        )
        .await
    }
}

/// Shared, cloneable handle to the run's metric buffer
#[derive(Clone)]
pub struct MetricRegistry {
    samples: Arc<Mutex<Vec<MetricSample>>>,
    sink: Arc<dyn MetricSink>,
}

impl std::fmt::Debug for MetricRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricRegistry")
            .field("buffered", &self.len())
            .finish()
    }
}

impl MetricRegistry {
    pub fn new(sink: Arc<dyn MetricSink>) -> Self {
        Self {
            samples: Arc::new(Mutex::new(Vec::new())),
            sink,
        }
    }

    /// Registry whose emit discards all samples
    pub fn noop() -> Self {
        Self::new(Arc::new(NoopSink))
    }

    fn lock(&self) -> MutexGuard<'_, Vec<MetricSample>> {
        // A panic while holding the lock cannot leave the Vec half-written
        self.samples.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Buffer a sample stamped with the current time
    pub fn record(&self, spec: &MetricSpec, value: f64, dimensions: BTreeMap<String, String>) {
        let sample = MetricSample {
            namespace: spec.namespace.clone(),
            metric: spec.metric.clone(),
            value,
            unit: spec.unit,
            dimensions,
            timestamp: Utc::now(),
        };
        self.lock().push(sample);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the buffered samples in record order
    pub fn snapshot(&self) -> Vec<MetricSample> {
        self.lock().clone()
    }

    /// Drain the buffer and publish it in per-namespace batches
    ///
    /// Samples keep their record order within a namespace. A failed batch
    /// does not stop the remaining ones; failures are aggregated.
    pub async fn emit(&self) -> Result<()> {
        let drained = std::mem::take(&mut *self.lock());
        if drained.is_empty() {
            return Ok(());
        }

        let total = drained.len();
        let mut errors = Vec::new();
        let mut batches = 0usize;
        for (namespace, samples) in group_by_namespace(drained) {
            let data: Vec<MetricDatum> = samples.into_iter().map(MetricSample::into_datum).collect();
            for chunk in data.chunks(MAX_BATCH_SIZE) {
                batches += 1;
                if let Err(e) = self.sink.publish(&namespace, chunk.to_vec()).await {
                    warn!(namespace = %namespace, error = %e, "Failed to publish metric batch");
                    errors.push(e);
                }
            }
        }
        info!(samples = total, batches = batches, "Emitted metrics");
        Error::aggregate(errors)
    }
}

/// Group samples by namespace, namespaces in order of first appearance
fn group_by_namespace(samples: Vec<MetricSample>) -> Vec<(String, Vec<MetricSample>)> {
    let mut groups: Vec<(String, Vec<MetricSample>)> = Vec::new();
    for sample in samples {
        match groups.iter_mut().find(|(ns, _)| *ns == sample.namespace) {
            Some((_, group)) => group.push(sample),
            None => groups.push((sample.namespace.clone(), vec![sample])),
        }
    }
    groups
}

/// Build a dimension map from pairs
pub fn dimensions<const N: usize>(pairs: [(&str, &str); N]) -> BTreeMap<String, String> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Default)]
    struct CapturingSink {
        batches: AsyncMutex<Vec<(String, Vec<MetricDatum>)>>,
    }

    #[async_trait]
    impl MetricSink for CapturingSink {
        async fn publish(&self, namespace: &str, batch: Vec<MetricDatum>) -> Result<()> {
            self.batches.lock().await.push((namespace.to_string(), batch));
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl MetricSink for FailingSink {
        async fn publish(&self, _namespace: &str, _batch: Vec<MetricDatum>) -> Result<()> {
            Err(Error::cloud("PutMetricData", "access denied"))
        }
    }

    fn spec(sub: &str, name: &str) -> MetricSpec {
        MetricSpec::deployer(sub, name, MetricUnit::Count)
    }

    #[test]
    fn test_spec_namespace() {
        assert_eq!(spec("", "x").namespace, "kubetest2/eksapi");
        assert_eq!(spec("infrastructure", "x").namespace, "kubetest2/eksapi/infrastructure");
    }

    #[tokio::test]
    async fn test_emit_preserves_multiset_and_order() {
        let sink = Arc::new(CapturingSink::default());
        let registry = MetricRegistry::new(sink.clone());

        registry.record(&spec("a", "m1"), 1.0, BTreeMap::new());
        registry.record(&spec("b", "m2"), 2.0, BTreeMap::new());
        registry.record(&spec("a", "m1"), 1.0, BTreeMap::new());
        registry.record(&spec("a", "m3"), 3.0, dimensions([("arch", "arm64")]));

        registry.emit().await.unwrap();
        assert!(registry.is_empty());

        let batches = sink.batches.lock().await;
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].0, "kubetest2/eksapi/a");
        let values: Vec<f64> = batches[0].1.iter().map(|d| d.value).collect();
        assert_eq!(values, vec![1.0, 1.0, 3.0]);
        assert_eq!(batches[0].1[2].dimensions["arch"], "arm64");
        assert_eq!(batches[1].0, "kubetest2/eksapi/b");
        assert_eq!(batches[1].1.len(), 1);
    }

    #[tokio::test]
    async fn test_emit_chunks_large_namespaces() {
        let sink = Arc::new(CapturingSink::default());
        let registry = MetricRegistry::new(sink.clone());

        for i in 0..(MAX_BATCH_SIZE * 2 + 5) {
            registry.record(&spec("nodes", "TimeToReady"), i as f64, BTreeMap::new());
        }
        registry.emit().await.unwrap();

        let batches = sink.batches.lock().await;
        let sizes: Vec<usize> = batches.iter().map(|(_, b)| b.len()).collect();
        assert_eq!(sizes, vec![MAX_BATCH_SIZE, MAX_BATCH_SIZE, 5]);
        assert_eq!(batches[2].1[4].value, (MAX_BATCH_SIZE * 2 + 4) as f64);
    }

    #[tokio::test]
    async fn test_emit_empty_is_noop() {
        let registry = MetricRegistry::new(Arc::new(FailingSink));
        registry.emit().await.unwrap();
    }

    #[tokio::test]
    async fn test_emit_failure_still_drains() {
        let registry = MetricRegistry::new(Arc::new(FailingSink));
        registry.record(&spec("a", "m"), 1.0, BTreeMap::new());

        assert!(registry.emit().await.is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_record() {
        let registry = MetricRegistry::noop();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let r = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        r.record(&spec("x", "y"), 1.0, BTreeMap::new());
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(registry.len(), 800);
    }
}
