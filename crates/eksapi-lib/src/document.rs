//! On-disk run document
//!
//! A run is described by one YAML document holding the options under
//! `options`-level keys and the lifecycle status under `status`. The
//! status sub-tree is rewritten after every phase so an interrupted run
//! can be inspected or torn down later.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::{Cluster, Infrastructure};
use crate::options::DeployerOptions;

/// Last lifecycle phase a run completed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LifecyclePhase {
    #[default]
    Initialized,
    InfraReady,
    ClusterReady,
    NodesReady,
    Up,
    TearingDown,
    Down,
    Failed,
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecyclePhase::Initialized => "initialized",
            LifecyclePhase::InfraReady => "infra-ready",
            LifecyclePhase::ClusterReady => "cluster-ready",
            LifecyclePhase::NodesReady => "nodes-ready",
            LifecyclePhase::Up => "up",
            LifecyclePhase::TearingDown => "tearing-down",
            LifecyclePhase::Down => "down",
            LifecyclePhase::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Progress of one run, written back after each phase
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployerStatus {
    pub phase: LifecyclePhase,
    pub resource_id: Option<String>,
    pub kubernetes_version: Option<String>,
    pub infrastructure: Option<Infrastructure>,
    pub cluster: Option<Cluster>,
    pub kubeconfig_path: Option<PathBuf>,
    pub instance_types: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl DeployerStatus {
    /// Move to `phase` and stamp the update time
    pub fn advance(&mut self, phase: LifecyclePhase) {
        self.phase = phase;
        self.updated_at = Some(Utc::now());
        if phase != LifecyclePhase::Failed {
            self.last_error = None;
        }
    }

    pub fn fail(&mut self, err: &Error) {
        self.phase = LifecyclePhase::Failed;
        self.updated_at = Some(Utc::now());
        self.last_error = Some(err.to_string());
    }
}

#[derive(Debug, Default, Deserialize)]
struct StatusOnly {
    #[serde(default)]
    status: DeployerStatus,
}

/// Options plus status, as stored in the run document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigDocument {
    #[serde(flatten)]
    pub options: DeployerOptions,
    #[serde(default)]
    pub status: DeployerStatus,
}

impl ConfigDocument {
    /// Load options through the layered loader and the status verbatim
    pub fn load(path: &Path) -> Result<Self> {
        let options = DeployerOptions::load(Some(path))?;
        let status = Self::read_status(path)?;
        Ok(Self { options, status })
    }

    /// Read only the status sub-tree; a missing file is an empty status
    pub fn read_status(path: &Path) -> Result<DeployerStatus> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(DeployerStatus::default())
            }
            Err(e) => return Err(e.into()),
        };
        if raw.trim().is_empty() {
            return Ok(DeployerStatus::default());
        }
        let parsed: StatusOnly = serde_yaml::from_str(&raw).map_err(|e| {
            Error::serialization(format!("reading status from {}: {}", path.display(), e))
        })?;
        Ok(parsed.status)
    }

    /// Replace `path` with this document via a sibling temp file
    pub fn save(&self, path: &Path) -> Result<()> {
        let rendered = serde_yaml::to_string(self)
            .map_err(|e| Error::serialization(format!("rendering run document: {}", e)))?;
        write_atomic(path, rendered.as_bytes())?;
        debug!(path = %path.display(), phase = %self.status.phase, "Saved run document");
        Ok(())
    }
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)?;
    let file_name = path
        .file_name()
        .ok_or_else(|| Error::invalid_config(format!("not a file path: {}", path.display())))?;
    let tmp = dir.join(format!(".{}.tmp", file_name.to_string_lossy()));
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
