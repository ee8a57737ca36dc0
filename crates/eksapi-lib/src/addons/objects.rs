//! ConfigMap and Secret write workloads
//!
//! Each add-on owns one namespace, writes numbered objects of a fixed
//! payload size into it, and keeps a latency summary of the writes.
//! Finalize deletes the namespace with everything in it.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{Addon, AddonContext};
use crate::error::{Error, Result};
use crate::k8s::ClusterApi;
use crate::loadgen::{RequestKind, RequestRecord, RequestStatus, RequestSummary};

/// Key the payload is stored under
pub const PAYLOAD_KEY: &str = "payload";

/// API server limit on one ConfigMap or Secret, less room for metadata
pub const MAX_OBJECT_SIZE: usize = 900 * 1024;

/// Options shared by the object write workloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectWritesConfig {
    /// Defaults to `<resource id>-<add-on name>`
    pub namespace: Option<String>,
    pub objects: u32,
    /// Payload bytes per object
    pub object_size: usize,
    /// Consecutive failed writes that abort the add-on
    pub fail_threshold: u32,
}

impl Default for ObjectWritesConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            objects: 10,
            object_size: 10 * 1024,
            fail_threshold: 20,
        }
    }
}

impl ObjectWritesConfig {
    pub fn validate(&self) -> Result<()> {
        if self.objects == 0 {
            return Err(Error::invalid_config("objects must be positive"));
        }
        if self.object_size == 0 || self.object_size > MAX_OBJECT_SIZE {
            return Err(Error::invalid_config(format!(
                "object_size must be between 1 and {} bytes",
                MAX_OBJECT_SIZE
            )));
        }
        if self.fail_threshold == 0 {
            return Err(Error::invalid_config("fail_threshold must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    ConfigMap,
    Secret,
}

impl ObjectKind {
    fn addon_name(self) -> &'static str {
        match self {
            ObjectKind::ConfigMap => "configmaps",
            ObjectKind::Secret => "secrets",
        }
    }

    fn object_name(self, index: u32) -> String {
        match self {
            ObjectKind::ConfigMap => format!("configmap{:06}", index),
            ObjectKind::Secret => format!("secret{:06}", index),
        }
    }

    async fn write(
        self,
        api: &dyn ClusterApi,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<()> {
        match self {
            ObjectKind::ConfigMap => api.apply_config_map(namespace, name, data).await,
            ObjectKind::Secret => api.create_secret(namespace, name, data).await,
        }
    }
}

/// Writes ConfigMaps or Secrets once nodes are ready
pub struct ObjectWritesAddon {
    kind: ObjectKind,
    config: Option<ObjectWritesConfig>,
    summary: Mutex<Option<RequestSummary>>,
}

impl ObjectWritesAddon {
    pub fn config_maps(config: Option<ObjectWritesConfig>) -> Self {
        Self::new(ObjectKind::ConfigMap, config)
    }

    pub fn secrets(config: Option<ObjectWritesConfig>) -> Self {
        Self::new(ObjectKind::Secret, config)
    }

    fn new(kind: ObjectKind, config: Option<ObjectWritesConfig>) -> Self {
        Self {
            kind,
            config,
            summary: Mutex::new(None),
        }
    }

    pub fn namespace(&self, ctx: &AddonContext) -> String {
        self.config
            .as_ref()
            .and_then(|c| c.namespace.clone())
            .unwrap_or_else(|| format!("{}-{}", ctx.resource_id, self.kind.addon_name()))
    }

    /// Latency summary of the last apply
    pub fn summary(&self) -> Option<RequestSummary> {
        self.summary
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

fn random_payload(size: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(size)
        .map(char::from)
        .collect()
}

#[async_trait]
impl Addon for ObjectWritesAddon {
    fn name(&self) -> &str {
        self.kind.addon_name()
    }

    fn is_enabled(&self) -> bool {
        self.config.is_some()
    }

    fn apply_defaults(&mut self) {
        if let Some(config) = self.config.as_mut() {
            if config.namespace.as_deref().is_some_and(|n| n.trim().is_empty()) {
                config.namespace = None;
            }
        }
    }

    fn validate(&self) -> Result<()> {
        match &self.config {
            Some(config) => config.validate(),
            None => Ok(()),
        }
    }

    async fn apply(&self, ctx: &AddonContext) -> Result<()> {
        let Some(config) = &self.config else {
            return Ok(());
        };
        let api = ctx.k8s.clone().ok_or_else(|| {
            Error::invalid_config(format!("{} add-on needs a cluster client", self.name()))
        })?;
        let namespace = self.namespace(ctx);
        api.create_namespace(&namespace).await?;

        let payload = random_payload(config.object_size);
        let mut records = Vec::with_capacity(config.objects as usize);
        let mut consecutive_failures = 0;
        for index in 0..config.objects {
            if ctx.stop.is_stopped() {
                return Err(Error::cancelled(format!("{} writes", self.name())));
            }
            let name = self.kind.object_name(index);
            let data = BTreeMap::from([(PAYLOAD_KEY.to_string(), payload.clone())]);

            let start = Utc::now();
            let began = Instant::now();
            let result = self.kind.write(api.as_ref(), &namespace, &name, data).await;
            let status = match &result {
                Ok(()) => {
                    consecutive_failures = 0;
                    RequestStatus::Ok
                }
                Err(e) => {
                    consecutive_failures += 1;
                    warn!(addon = %self.name(), name = %name, error = %e, "Write failed");
                    RequestStatus::Error(e.to_string())
                }
            };
            records.push(RequestRecord::timed(RequestKind::Write, start, began.elapsed(), status));
            if consecutive_failures >= config.fail_threshold {
                return Err(Error::transient(
                    format!("{} writes", self.name()),
                    format!("{} consecutive failures", consecutive_failures),
                ));
            }
        }

        let summary = RequestSummary::from_records(&records);
        info!(
            addon = %self.name(),
            namespace = %namespace,
            written = summary.success,
            "Object writes complete\n{}",
            summary
        );
        *self.summary.lock().unwrap_or_else(|e| e.into_inner()) = Some(summary);
        Ok(())
    }

    async fn finalize(&self, ctx: &AddonContext) -> Result<()> {
        let Some(api) = &ctx.k8s else {
            debug!(addon = %self.name(), "No cluster client, nothing to finalize");
            return Ok(());
        };
        let namespace = self.namespace(ctx);
        api.delete_namespace(&namespace).await?;
        info!(addon = %self.name(), namespace = %namespace, "Deleted namespace");
        Ok(())
    }
}
