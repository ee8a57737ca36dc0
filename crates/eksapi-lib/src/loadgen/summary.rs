//! Latency summaries

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::journal::RequestRecord;

/// Aggregate statistics over one request stream
///
/// Latencies are in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestSummary {
    pub count: usize,
    pub success: usize,
    pub failure: usize,
    pub min_ms: f64,
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p99_ms: f64,
    #[serde(rename = "p99.9_ms")]
    pub p999_ms: f64,
    #[serde(rename = "p99.99_ms")]
    pub p9999_ms: f64,
    pub max_ms: f64,
    /// Requests per second over the span from first start to last end
    pub throughput: f64,
}

/// Pick the latency at `numerator / denominator` of an ascending slice
///
/// The index is `n * numerator / denominator`, clamped to the last element.
pub fn pick_percentile(sorted: &[Duration], numerator: usize, denominator: usize) -> Duration {
    match sorted.len() {
        0 => Duration::ZERO,
        n => sorted[(n * numerator / denominator).min(n - 1)],
    }
}

fn ms(d: Duration) -> f64 {
    d.as_nanos() as f64 / 1_000_000.0
}

impl RequestSummary {
    pub fn from_records(records: &[RequestRecord]) -> Self {
        if records.is_empty() {
            return Self::default();
        }
        let mut latencies: Vec<Duration> = records.iter().map(RequestRecord::duration).collect();
        latencies.sort_unstable();

        let count = records.len();
        let success = records.iter().filter(|r| r.status.is_ok()).count();
        let total: Duration = latencies.iter().sum();

        let first_start = records.iter().map(|r| r.start).min();
        let last_end = records.iter().map(|r| r.end).max();
        let span = match (first_start, last_end) {
            (Some(start), Some(end)) => (end - start).to_std().unwrap_or_default(),
            _ => Duration::ZERO,
        };
        let throughput = if span.is_zero() {
            0.0
        } else {
            count as f64 / span.as_secs_f64()
        };

        Self {
            count,
            success,
            failure: count - success,
            min_ms: ms(latencies[0]),
            avg_ms: ms(total) / count as f64,
            p50_ms: ms(pick_percentile(&latencies, 50, 100)),
            p90_ms: ms(pick_percentile(&latencies, 90, 100)),
            p99_ms: ms(pick_percentile(&latencies, 99, 100)),
            p999_ms: ms(pick_percentile(&latencies, 999, 1000)),
            p9999_ms: ms(pick_percentile(&latencies, 9999, 10000)),
            max_ms: ms(latencies[count - 1]),
            throughput,
        }
    }

    /// Fraction of requests that succeeded; 1.0 for an empty stream
    pub fn success_rate(&self) -> f64 {
        if self.count == 0 {
            1.0
        } else {
            self.success as f64 / self.count as f64
        }
    }
}

impl fmt::Display for RequestSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "        TOTAL: {}", self.count)?;
        writeln!(f, "SUCCESS TOTAL: {}", self.success)?;
        writeln!(f, "FAILURE TOTAL: {}", self.failure)?;
        writeln!(f, "   THROUGHPUT: {:.2} req/s", self.throughput)?;
        writeln!(f)?;
        writeln!(f, "          min: {:.3} ms", self.min_ms)?;
        writeln!(f, "          avg: {:.3} ms", self.avg_ms)?;
        writeln!(f, "          p50: {:.3} ms", self.p50_ms)?;
        writeln!(f, "          p90: {:.3} ms", self.p90_ms)?;
        writeln!(f, "          p99: {:.3} ms", self.p99_ms)?;
        writeln!(f, "        p99.9: {:.3} ms", self.p999_ms)?;
        writeln!(f, "       p99.99: {:.3} ms", self.p9999_ms)?;
        write!(f, "          max: {:.3} ms", self.max_ms)
    }
}

/// Summaries of both streams of a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub writes: RequestSummary,
    pub reads: RequestSummary,
}
