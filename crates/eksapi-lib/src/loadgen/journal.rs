//! Per-request records and the in-memory journal

use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Write,
    Update,
    Read,
    List,
}

impl RequestKind {
    /// Writes and updates go to the write stream
    pub fn is_write(&self) -> bool {
        matches!(self, RequestKind::Write | RequestKind::Update)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Ok,
    Error(String),
}

impl RequestStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, RequestStatus::Ok)
    }
}

/// Outcome of one request
///
/// Built only through [`RequestRecord::new`], so `end >= start` and
/// `duration_ns` is exactly `end - start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration_ns: u64,
    pub kind: RequestKind,
    pub status: RequestStatus,
}

impl RequestRecord {
    pub fn new(
        kind: RequestKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        status: RequestStatus,
    ) -> Self {
        let end = end.max(start);
        let duration_ns = (end - start)
            .num_nanoseconds()
            .and_then(|n| u64::try_from(n).ok())
            .unwrap_or(u64::MAX);
        Self {
            start,
            end,
            duration_ns,
            kind,
            status,
        }
    }

    /// Record a request that started at `start` and took `took`
    pub fn timed(kind: RequestKind, start: DateTime<Utc>, took: Duration, status: RequestStatus) -> Self {
        let took = chrono::Duration::from_std(took).unwrap_or_else(|_| chrono::Duration::zero());
        Self::new(kind, start, start + took, status)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_nanos(self.duration_ns)
    }
}

/// Append-only journal shared by all workers of a run
#[derive(Clone, Default)]
pub struct Journal {
    records: Arc<Mutex<Vec<RequestRecord>>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<RequestRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn append(&self, record: RequestRecord) {
        self.lock().push(record);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<RequestRecord> {
        self.lock().clone()
    }

    /// Records of the write stream, in append order
    pub fn writes(&self) -> Vec<RequestRecord> {
        self.lock()
            .iter()
            .filter(|r| r.kind.is_write())
            .cloned()
            .collect()
    }

    /// Records of the read stream, in append order
    pub fn reads(&self) -> Vec<RequestRecord> {
        self.lock()
            .iter()
            .filter(|r| !r.kind.is_write())
            .cloned()
            .collect()
    }
}

/// Write records as newline-delimited JSON and return how many were written
pub fn write_ndjson(path: &Path, records: &[RequestRecord]) -> Result<usize> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(path)?;
    let mut out = std::io::BufWriter::new(file);
    for record in records {
        serde_json::to_writer(&mut out, record)
            .map_err(|e| Error::serialization(format!("encoding request record: {}", e)))?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(records.len())
}

/// Parse a journal written by [`write_ndjson`]
pub fn read_ndjson(content: &str) -> Result<Vec<RequestRecord>> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(i, line)| {
            serde_json::from_str(line).map_err(|e| {
                Error::serialization(format!("request record on line {}: {}", i + 1, e))
            })
        })
        .collect()
}
