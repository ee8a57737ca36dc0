//! Synthetic API-server load generator
//!
//! Drives rate-limited create/get/list/update traffic against ConfigMaps,
//! journals every request, and summarizes latencies per stream.

mod config;
mod journal;
mod limiter;
mod metrics;
mod runner;
mod signal;
mod summary;
mod target;

pub use config::{object_key, LoadConfig, OutputPaths};
pub use journal::{read_ndjson, write_ndjson, Journal, RequestKind, RequestRecord, RequestStatus};
pub use limiter::RateLimiter;
pub use metrics::LoadMetrics;
pub use runner::{LoadRun, RunOutcome, CLEANUP_GRACE};
pub use signal::{StopReason, StopSignal};
pub use summary::{pick_percentile, RequestSummary, RunSummary};
pub use target::{KubeLoadTarget, LoadTarget};

#[cfg(test)]
pub use target::memory::MemoryTarget;
