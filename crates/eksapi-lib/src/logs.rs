//! Node log gathering
//!
//! Logs are collected either by a remote command that tars and uploads
//! them from each instance, or, in auto mode, by NodeDiagnostic objects
//! that upload to a presigned URL. Both land under
//! `node-logs/<resource-id>/<phase>/` in the log bucket.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::cloud::{wait_until, CloudClients, InvocationStatus, SendCommandRequest};
use crate::error::{Error, Result};
use crate::k8s::{parse_provider_id, ClusterApi, NodeInfo, NODE_DIAGNOSTIC};
use crate::models::{NodeStrategy, UserDataFormat};

const LOG_COLLECTOR_DOCUMENT: &str = include_str!("templates/log-collector.json");

pub const LOG_COLLECTION_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const DIAGNOSTIC_POLL_INTERVAL: Duration = Duration::from_secs(5);
const INVOCATION_POLL_INTERVAL: Duration = Duration::from_secs(5);
const PRESIGN_EXPIRY: Duration = Duration::from_secs(60 * 60);

/// Diagnostic outcomes that count as a successful capture
const DIAGNOSTIC_PASS_REASONS: [&str; 2] = ["Success", "SuccessWithErrors"];

/// Lifecycle phase the logs are gathered in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Up,
    Down,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Up => write!(f, "up"),
            Phase::Down => write!(f, "down"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub bucket: Option<String>,
    pub auto_mode: bool,
    pub strategy: NodeStrategy,
    pub user_data_format: UserDataFormat,
}

pub struct LogManager {
    clients: CloudClients,
    resource_id: String,
}

impl LogManager {
    pub fn new(clients: CloudClients, resource_id: impl Into<String>) -> Self {
        Self {
            clients,
            resource_id: resource_id.into(),
        }
    }

    pub fn document_name(&self) -> String {
        format!("{}-log-collector", self.resource_id)
    }

    /// Key prefix inside the bucket for one phase
    pub fn key_prefix(&self, phase: Phase) -> String {
        format!("node-logs/{}/{}/", self.resource_id, phase)
    }

    /// Gather logs from every node of the run
    ///
    /// Without a bucket or a cluster client there is nothing to do.
    pub async fn gather(
        &self,
        k8s: Option<&dyn ClusterApi>,
        opts: &LogOptions,
        phase: Phase,
    ) -> Result<()> {
        let Some(bucket) = opts.bucket.as_deref().filter(|b| !b.is_empty()) else {
            info!("No log bucket configured, skipping log gathering");
            return Ok(());
        };
        let Some(k8s) = k8s else {
            info!("No cluster client available, skipping log gathering");
            return Ok(());
        };
        if opts.auto_mode {
            return self.gather_with_diagnostics(k8s, bucket, phase).await;
        }
        match opts.user_data_format {
            UserDataFormat::BootstrapSh | UserDataFormat::Nodeadm => {
                self.gather_with_command(k8s, opts, bucket, phase).await
            }
            other => {
                warn!(user_data_format = %other, "Log gathering is not supported for this user data format");
                Ok(())
            }
        }
    }

    async fn gather_with_command(
        &self,
        k8s: &dyn ClusterApi,
        opts: &LogOptions,
        bucket: &str,
        phase: Phase,
    ) -> Result<()> {
        info!(phase = %phase, "Gathering node logs with remote command");
        let nodes = k8s.list_nodes().await?;
        let mut instance_ids = instance_ids(&nodes)?;
        if instance_ids.is_empty() && opts.strategy == NodeStrategy::Unmanaged {
            // unmanaged instances can be found even if they never joined
            let tag = format!("{}-Node", self.resource_id);
            match self
                .clients
                .call("DescribeInstances", || self.clients.compute.find_instances_by_name(&tag))
                .await
            {
                Ok(ids) => instance_ids = ids,
                Err(e) => {
                    warn!(error = %e, "Failed to find unmanaged instances");
                    return Ok(());
                }
            }
        }
        if instance_ids.is_empty() {
            warn!("No nodes to gather logs from");
            return Ok(());
        }

        let document = self.document_name();
        let created = self
            .clients
            .call("CreateDocument", || {
                self.clients
                    .remote_command
                    .create_document(&document, LOG_COLLECTOR_DOCUMENT)
            })
            .await;
        match created {
            Ok(()) => {}
            Err(e) if e.is_conflict() => debug!(document = %document, "Reusing existing document"),
            Err(e) => return Err(e),
        }

        let result = self.run_command(&document, bucket, phase, &instance_ids).await;

        if let Err(e) = self
            .clients
            .call("DeleteDocument", || self.clients.remote_command.delete_document(&document))
            .await
        {
            warn!(document = %document, error = %e, "Failed to delete log collector document");
        }
        if result.is_ok() {
            info!(instances = ?instance_ids, "Gathered logs from nodes");
        }
        result
    }

    async fn run_command(
        &self,
        document: &str,
        bucket: &str,
        phase: Phase,
        instance_ids: &[String],
    ) -> Result<()> {
        let request = SendCommandRequest {
            document_name: document.to_string(),
            instance_ids: instance_ids.to_vec(),
            output_bucket: bucket.to_string(),
            output_key_prefix: self.key_prefix(phase),
        };
        let command_id = self
            .clients
            .call("SendCommand", || self.clients.remote_command.send_command(&request))
            .await?;

        let mut errors = Vec::new();
        for instance_id in instance_ids {
            let status = wait_until(
                "log collection command",
                instance_id,
                LOG_COLLECTION_TIMEOUT,
                INVOCATION_POLL_INTERVAL,
                || async {
                    let status = self
                        .clients
                        .remote_command
                        .get_command_invocation(&command_id, instance_id)
                        .await?;
                    Ok(status.is_terminal().then_some(status))
                },
            )
            .await;
            match status {
                Ok(InvocationStatus::Success) => {
                    info!(instance_id = %instance_id, "Log collection command succeeded")
                }
                Ok(other) => errors.push(Error::cloud(
                    "log collection command",
                    format!("instance {} finished with {:?}", instance_id, other),
                )),
                Err(e) => errors.push(e),
            }
        }
        Error::aggregate(errors)
    }

    async fn gather_with_diagnostics(
        &self,
        k8s: &dyn ClusterApi,
        bucket: &str,
        phase: Phase,
    ) -> Result<()> {
        info!(phase = %phase, "Gathering node logs with NodeDiagnostic");
        let nodes = k8s.list_nodes().await?;
        if nodes.is_empty() {
            warn!("No nodes to gather logs from");
            return Ok(());
        }
        let instance_ids = instance_ids(&nodes)?;

        let mut errors = Vec::new();
        let mut diagnostics = Vec::new();
        for instance_id in &instance_ids {
            let key = format!("{}{}.tar.gz", self.key_prefix(phase), instance_id);
            let url = match self
                .clients
                .call("PresignPutObject", || {
                    self.clients.object_store.presign_put(bucket, &key, PRESIGN_EXPIRY)
                })
                .await
            {
                Ok(url) => url,
                Err(e) => {
                    errors.push(e);
                    continue;
                }
            };
            match k8s
                .create_object(NODE_DIAGNOSTIC, node_diagnostic(instance_id, &url))
                .await
            {
                Ok(()) => diagnostics.push(instance_id.clone()),
                Err(e) => errors.push(e),
            }
        }

        let mut outcomes: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let poll = async {
            loop {
                for name in &diagnostics {
                    if outcomes.contains_key(name) {
                        continue;
                    }
                    let object = k8s
                        .get_object(NODE_DIAGNOSTIC, name)
                        .await?
                        .ok_or_else(|| Error::not_found(NODE_DIAGNOSTIC.kind, name))?;
                    if let Some(reasons) = completion_reasons(&object) {
                        outcomes.insert(name.clone(), reasons);
                    }
                }
                if outcomes.len() == diagnostics.len() {
                    return Ok::<(), Error>(());
                }
                tokio::time::sleep(DIAGNOSTIC_POLL_INTERVAL).await;
            }
        };
        match tokio::time::timeout(LOG_COLLECTION_TIMEOUT, poll).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => errors.push(e),
            Err(_) => errors.push(Error::timeout(
                "node diagnostics",
                &self.resource_id,
                LOG_COLLECTION_TIMEOUT,
            )),
        }

        for (instance_id, reasons) in &outcomes {
            for reason in reasons {
                if !DIAGNOSTIC_PASS_REASONS.contains(&reason.as_str()) {
                    errors.push(Error::cloud(
                        "node diagnostic",
                        format!("outcome for {}: {}", instance_id, reason),
                    ));
                }
            }
        }
        for name in &diagnostics {
            if let Err(e) = k8s.delete_object(NODE_DIAGNOSTIC, name).await {
                errors.push(e);
            }
        }
        if errors.is_empty() {
            info!(instances = ?instance_ids, "Gathered logs from nodes");
        }
        Error::aggregate(errors)
    }
}

/// Instance ids behind the nodes' provider IDs
fn instance_ids(nodes: &[NodeInfo]) -> Result<Vec<String>> {
    nodes
        .iter()
        .filter_map(|n| n.provider_id.as_deref())
        .map(|p| parse_provider_id(p).map(|id| id.instance_id))
        .collect()
}

fn node_diagnostic(instance_id: &str, destination: &str) -> Value {
    json!({
        "apiVersion": NODE_DIAGNOSTIC.api_version(),
        "kind": NODE_DIAGNOSTIC.kind,
        "metadata": { "name": instance_id },
        "spec": { "logCapture": { "destination": destination } }
    })
}

/// Completion reasons of every capture, or `None` while any is pending
fn completion_reasons(object: &Value) -> Option<Vec<String>> {
    let statuses = object.pointer("/status/captureStatuses")?.as_array()?;
    statuses
        .iter()
        .map(|s| {
            s.pointer("/state/completed/reason")
                .and_then(Value::as_str)
                .map(String::from)
        })
        .collect()
}
