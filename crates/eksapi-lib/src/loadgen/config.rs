//! Load run configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Parameters of one load run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    /// Parallel client instances, each with its own rate limiter
    pub clients: u32,
    /// Queries per second across all clients
    pub qps: f64,
    /// Token-bucket burst across all clients
    pub burst: u32,
    /// Length of the run
    pub deadline_secs: u64,
    /// Per-request timeout
    pub request_timeout_secs: u64,
    /// Payload bytes per written object; 0 disables writers
    pub object_size: usize,
    /// Page size for list requests
    pub list_limit: u32,
    pub namespace_write: String,
    /// Namespaces readers pick from; empty disables readers
    #[serde(deserialize_with = "crate::options::string_list")]
    pub namespaces_read: Vec<String>,
    /// Prefix of object names and output files
    pub prefix: String,
    pub output_dir: PathBuf,
    /// Bucket the journals are uploaded to, if any
    pub bucket: Option<String>,
    /// Key prefix inside `bucket`
    pub bucket_prefix: String,
    /// Delete created objects after the run
    pub cleanup: bool,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            clients: 1,
            qps: 10.0,
            burst: 20,
            deadline_secs: 60,
            request_timeout_secs: 10,
            object_size: 8,
            list_limit: 50,
            namespace_write: "default".to_string(),
            namespaces_read: Vec::new(),
            prefix: "stresser".to_string(),
            output_dir: PathBuf::from("/var/log"),
            bucket: None,
            bucket_prefix: String::new(),
            cleanup: true,
        }
    }
}

impl LoadConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Rate and burst each client's limiter gets
    pub fn per_client_rate(&self) -> (f64, u32) {
        let clients = self.clients.max(1);
        let qps = self.qps / clients as f64;
        let burst = (self.burst / clients).max(1);
        (qps, burst)
    }

    pub fn validate(&self) -> Result<()> {
        if self.clients == 0 {
            return Err(Error::invalid_config("load run needs at least one client"));
        }
        if !(self.qps > 0.0) {
            return Err(Error::invalid_config(format!(
                "load run qps must be positive, got {}",
                self.qps
            )));
        }
        if self.deadline_secs == 0 {
            return Err(Error::invalid_config("load run deadline must be positive"));
        }
        if self.object_size > 0 && self.namespace_write.is_empty() {
            return Err(Error::invalid_config(
                "writes need a namespace to write to",
            ));
        }
        if self.object_size == 0 && self.namespaces_read.is_empty() {
            return Err(Error::invalid_config(
                "load run has neither writers nor readers",
            ));
        }
        if self.prefix.is_empty() {
            return Err(Error::invalid_config("load run prefix must not be empty"));
        }
        Ok(())
    }

    /// Output locations with a fresh random infix
    pub fn output_paths(&self) -> OutputPaths {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(7)
            .map(|c| char::from(c).to_ascii_lowercase())
            .collect();
        OutputPaths::new(&self.output_dir, &format!("{}-{}", self.prefix, suffix))
    }
}

/// Files one run produces
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPaths {
    pub writes: PathBuf,
    pub reads: PathBuf,
    pub summary: PathBuf,
}

impl OutputPaths {
    pub fn new(dir: &Path, stem: &str) -> Self {
        Self {
            writes: dir.join(format!("{}-writes.json", stem)),
            reads: dir.join(format!("{}-reads.json", stem)),
            summary: dir.join(format!("{}-summary.json", stem)),
        }
    }

    pub fn all(&self) -> [&Path; 3] {
        [&self.writes, &self.reads, &self.summary]
    }
}

/// Object-store key for a local output file
pub fn object_key(bucket_prefix: &str, path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let prefix = bucket_prefix.trim_end_matches('/');
    if prefix.is_empty() {
        name
    } else {
        format!("{}/{}", prefix, name)
    }
}
