//! Prometheus collectors for a load run

use prometheus::{exponential_buckets, Histogram, HistogramOpts, IntCounter, Opts, Registry};

use super::journal::RequestRecord;
use crate::error::{Error, Result};

const NAMESPACE: &str = "stresser";
const SUBSYSTEM: &str = "client";

/// Request counters and latency histograms, split into write and read
/// streams
#[derive(Clone)]
pub struct LoadMetrics {
    write_success: IntCounter,
    write_failure: IntCounter,
    write_latency_ms: Histogram,
    read_success: IntCounter,
    read_failure: IntCounter,
    read_latency_ms: Histogram,
}

fn counter(name: &str, help: &str) -> Result<IntCounter> {
    IntCounter::with_opts(Opts::new(name, help).namespace(NAMESPACE).subsystem(SUBSYSTEM))
        .map_err(prometheus_error)
}

fn latency_histogram(name: &str, help: &str) -> Result<Histogram> {
    // 0.5ms up to 0.5ms * 2^13
    let buckets = exponential_buckets(0.5, 2.0, 14).map_err(prometheus_error)?;
    Histogram::with_opts(
        HistogramOpts::new(name, help)
            .namespace(NAMESPACE)
            .subsystem(SUBSYSTEM)
            .buckets(buckets),
    )
    .map_err(prometheus_error)
}

fn prometheus_error(e: prometheus::Error) -> Error {
    Error::invalid_config(format!("prometheus: {}", e))
}

impl LoadMetrics {
    /// Create the collectors and register them into `registry`
    pub fn new(registry: &Registry) -> Result<Self> {
        let metrics = Self {
            write_success: counter(
                "write_requests_success_total",
                "Total number of successful write requests.",
            )?,
            write_failure: counter(
                "write_requests_failure_total",
                "Total number of failed write requests.",
            )?,
            write_latency_ms: latency_histogram(
                "write_request_latency_milliseconds",
                "Bucketed histogram of client-side write request and response latency.",
            )?,
            read_success: counter(
                "read_requests_success_total",
                "Total number of successful read requests.",
            )?,
            read_failure: counter(
                "read_requests_failure_total",
                "Total number of failed read requests.",
            )?,
            read_latency_ms: latency_histogram(
                "read_request_latency_milliseconds",
                "Bucketed histogram of client-side read request and response latency.",
            )?,
        };
        for collector in [
            Box::new(metrics.write_success.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(metrics.write_failure.clone()),
            Box::new(metrics.write_latency_ms.clone()),
            Box::new(metrics.read_success.clone()),
            Box::new(metrics.read_failure.clone()),
            Box::new(metrics.read_latency_ms.clone()),
        ] {
            registry.register(collector).map_err(prometheus_error)?;
        }
        Ok(metrics)
    }

    /// Collectors bound to a private registry
    pub fn unregistered() -> Result<Self> {
        Self::new(&Registry::new())
    }

    pub fn observe(&self, record: &RequestRecord) {
        let latency_ms = record.duration().as_secs_f64() * 1000.0;
        let (success, failure, histogram) = if record.kind.is_write() {
            (&self.write_success, &self.write_failure, &self.write_latency_ms)
        } else {
            (&self.read_success, &self.read_failure, &self.read_latency_ms)
        };
        histogram.observe(latency_ms);
        if record.status.is_ok() {
            success.inc();
        } else {
            failure.inc();
        }
    }

    pub fn write_totals(&self) -> (u64, u64) {
        (self.write_success.get(), self.write_failure.get())
    }

    pub fn read_totals(&self) -> (u64, u64) {
        (self.read_success.get(), self.read_failure.get())
    }
}
