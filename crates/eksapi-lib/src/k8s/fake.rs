//! In-memory cluster used by lifecycle tests

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use serde_json::{json, Value};

use super::{
    ClusterApi, DynamicResource, JobKind, NodeEvent, NodeEventStream, NodeInfo, NODE_CLASS, NODE_DIAGNOSTIC,
};
use crate::error::{Error, Result};

#[derive(Default)]
struct State {
    nodes: Vec<NodeInfo>,
    version: String,
    namespaces: BTreeSet<String>,
    config_maps: BTreeMap<(String, String), BTreeMap<String, String>>,
    secrets: BTreeMap<(String, String), BTreeMap<String, String>>,
    /// Succeeded pods per (namespace, kind, name)
    jobs: BTreeMap<(String, JobKind, String), i32>,
    deployments: BTreeMap<(String, String), Deployment>,
    objects: BTreeMap<(String, String), Value>,
    placeholder_scales_nodes: bool,
    diagnostic_reason: Option<String>,
    calls: Vec<String>,
    watchers: Vec<UnboundedSender<Result<NodeEvent>>>,
}

impl State {
    /// Fan a node change out to open watches
    fn publish(&mut self, event: NodeEvent) {
        self.watchers
            .retain(|tx| tx.unbounded_send(Ok(event.clone())).is_ok());
    }

    fn push_node(&mut self, node: NodeInfo) {
        self.nodes.retain(|n| n.name != node.name);
        self.nodes.push(node.clone());
        self.publish(NodeEvent::Applied(node));
    }

    fn remove_all_nodes(&mut self) {
        let names: Vec<String> = self.nodes.drain(..).map(|n| n.name).collect();
        for name in names {
            self.publish(NodeEvent::Deleted(name));
        }
    }
}

#[derive(Clone)]
pub struct FakeCluster {
    state: Arc<Mutex<State>>,
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCluster {
    pub fn new() -> Self {
        let state = State {
            version: "1.31".to_string(),
            diagnostic_reason: Some("Success".to_string()),
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn called(&self, call: impl Into<String>) {
        self.lock().calls.push(call.into());
    }

    pub fn ready_node(name: &str, provider_id: Option<String>) -> NodeInfo {
        NodeInfo {
            name: name.to_string(),
            provider_id,
            instance_type: "m6i.xlarge".to_string(),
            os: "linux".to_string(),
            os_image: "Amazon Linux 2023.6.20241010".to_string(),
            arch: "amd64".to_string(),
            created: Some(Utc::now()),
            ready: true,
            ready_since: Some(Utc::now()),
        }
    }

    pub fn add_node(&self, node: NodeInfo) {
        self.lock().push_node(node);
    }

    pub fn add_ready_nodes(&self, count: usize) {
        for i in 0..count {
            self.add_node(Self::ready_node(&format!("node-{}", i), None));
        }
    }

    pub fn clear_nodes(&self) {
        self.lock().remove_all_nodes();
    }

    pub fn node_count(&self) -> usize {
        self.lock().nodes.len()
    }

    /// Placeholder deployments add one Ready node per replica, and
    /// deleting them removes every node
    pub fn scale_nodes_with_placeholder(&self) {
        self.lock().placeholder_scales_nodes = true;
    }

    /// Seed the NodeClass auto mode ships with
    pub fn with_default_node_class(self) -> Self {
        self.lock().objects.insert(
            (NODE_CLASS.kind.to_string(), "default".to_string()),
            json!({
                "apiVersion": NODE_CLASS.api_version(),
                "kind": NODE_CLASS.kind,
                "metadata": {
                    "name": "default",
                    "uid": "1234",
                    "resourceVersion": "42",
                    "generation": 1
                },
                "spec": {
                    "role": "kubetest2-node",
                    "ephemeralStorage": { "size": "80Gi", "iops": 3000 }
                },
                "status": { "conditions": [] }
            }),
        );
        self
    }

    /// Completion reason diagnostics report; `None` leaves them pending
    pub fn set_diagnostic_reason(&self, reason: Option<&str>) {
        self.lock().diagnostic_reason = reason.map(String::from);
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn config_map(&self, namespace: &str, name: &str) -> Option<BTreeMap<String, String>> {
        self.lock()
            .config_maps
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn has_namespace(&self, name: &str) -> bool {
        self.lock().namespaces.contains(name)
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<BTreeMap<String, String>> {
        self.lock()
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Succeeded pods of a job; created jobs complete immediately
    pub fn job(&self, namespace: &str, kind: JobKind, name: &str) -> Option<i32> {
        self.lock()
            .jobs
            .get(&(namespace.to_string(), kind, name.to_string()))
            .copied()
    }

    pub fn deployment(&self, namespace: &str, name: &str) -> Option<Deployment> {
        self.lock()
            .deployments
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn object(&self, resource: DynamicResource, name: &str) -> Option<Value> {
        self.lock()
            .objects
            .get(&(resource.kind.to_string(), name.to_string()))
            .cloned()
    }

    pub fn objects_of(&self, resource: DynamicResource) -> Vec<String> {
        self.lock()
            .objects
            .keys()
            .filter(|(kind, _)| kind == resource.kind)
            .map(|(_, name)| name.clone())
            .collect()
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        Ok(self.lock().nodes.clone())
    }

    fn watch_nodes(&self) -> NodeEventStream {
        let (tx, rx) = unbounded();
        let mut state = self.lock();
        let _ = tx.unbounded_send(Ok(NodeEvent::Restarted(state.nodes.clone())));
        state.watchers.push(tx);
        rx.boxed()
    }

    async fn server_version(&self) -> Result<String> {
        Ok(self.lock().version.clone())
    }

    async fn apply_config_map(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<()> {
        self.called(format!("apply configmap {}/{}", namespace, name));
        self.lock()
            .config_maps
            .insert((namespace.to_string(), name.to_string()), data);
        Ok(())
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()> {
        self.called(format!("delete configmap {}/{}", namespace, name));
        self.lock()
            .config_maps
            .remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }

    async fn create_namespace(&self, name: &str) -> Result<()> {
        self.called(format!("create namespace {}", name));
        self.lock().namespaces.insert(name.to_string());
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        self.called(format!("delete namespace {}", name));
        let mut state = self.lock();
        state.namespaces.remove(name);
        state.config_maps.retain(|(ns, _), _| ns != name);
        state.secrets.retain(|(ns, _), _| ns != name);
        state.jobs.retain(|(ns, _, _), _| ns != name);
        Ok(())
    }

    async fn namespace_exists(&self, name: &str) -> Result<bool> {
        Ok(self.lock().namespaces.contains(name))
    }

    async fn create_secret(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<()> {
        self.called(format!("create secret {}/{}", namespace, name));
        let mut state = self.lock();
        let key = (namespace.to_string(), name.to_string());
        if state.secrets.contains_key(&key) {
            return Err(Error::conflict("secret", name, "already exists"));
        }
        state.secrets.insert(key, data);
        Ok(())
    }

    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>> {
        Ok(self.secret(namespace, name))
    }

    async fn create_job(&self, namespace: &str, job: Job) -> Result<()> {
        let name = job.metadata.name.clone().unwrap_or_default();
        self.called(format!("create job {}/{}", namespace, name));
        let completions = job.spec.and_then(|s| s.completions).unwrap_or(1);
        self.lock()
            .jobs
            .entry((namespace.to_string(), JobKind::Job, name))
            .or_insert(completions);
        Ok(())
    }

    async fn create_cron_job(&self, namespace: &str, cron_job: CronJob) -> Result<()> {
        let name = cron_job.metadata.name.clone().unwrap_or_default();
        self.called(format!("create cronjob {}/{}", namespace, name));
        let completions = cron_job
            .spec
            .and_then(|s| s.job_template.spec)
            .and_then(|s| s.completions)
            .unwrap_or(1);
        self.lock()
            .jobs
            .entry((namespace.to_string(), JobKind::CronJob, name))
            .or_insert(completions);
        Ok(())
    }

    async fn succeeded_pods(&self, namespace: &str, kind: JobKind, name: &str) -> Result<i32> {
        Ok(self.job(namespace, kind, name).unwrap_or(0))
    }

    async fn delete_job(&self, namespace: &str, kind: JobKind, name: &str) -> Result<()> {
        self.called(format!("delete {} {}/{}", kind, namespace, name));
        self.lock()
            .jobs
            .remove(&(namespace.to_string(), kind, name.to_string()));
        Ok(())
    }

    async fn create_deployment(&self, namespace: &str, deployment: Deployment) -> Result<()> {
        let name = deployment.metadata.name.clone().unwrap_or_default();
        self.called(format!("create deployment {}/{}", namespace, name));
        let mut state = self.lock();
        let key = (namespace.to_string(), name.clone());
        if state.deployments.contains_key(&key) {
            return Err(Error::conflict("deployment", name, "already exists"));
        }
        if state.placeholder_scales_nodes {
            let replicas = deployment
                .spec
                .as_ref()
                .and_then(|s| s.replicas)
                .unwrap_or_default();
            for i in 0..replicas {
                state.push_node(Self::ready_node(&format!("{}-{}", name, i), None));
            }
        }
        state.deployments.insert(key, deployment);
        Ok(())
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()> {
        self.called(format!("delete deployment {}/{}", namespace, name));
        let mut state = self.lock();
        let removed = state
            .deployments
            .remove(&(namespace.to_string(), name.to_string()));
        if removed.is_some() && state.placeholder_scales_nodes {
            state.remove_all_nodes();
        }
        Ok(())
    }

    async fn get_object(&self, resource: DynamicResource, name: &str) -> Result<Option<Value>> {
        let mut state = self.lock();
        let reason = state.diagnostic_reason.clone();
        let key = (resource.kind.to_string(), name.to_string());
        let Some(object) = state.objects.get_mut(&key) else {
            return Ok(None);
        };
        if resource == NODE_DIAGNOSTIC {
            if let Some(reason) = reason {
                object["status"] = json!({
                    "captureStatuses": [
                        { "state": { "completed": { "reason": reason } } }
                    ]
                });
            }
        }
        Ok(Some(object.clone()))
    }

    async fn create_object(&self, resource: DynamicResource, object: Value) -> Result<()> {
        let name = object["metadata"]["name"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        self.called(format!("create {} {}", resource.kind, name));
        let mut state = self.lock();
        let key = (resource.kind.to_string(), name.clone());
        if state.objects.contains_key(&key) {
            return Err(Error::conflict(resource.kind, name, "already exists"));
        }
        state.objects.insert(key, object);
        Ok(())
    }

    async fn delete_object(&self, resource: DynamicResource, name: &str) -> Result<()> {
        self.called(format!("delete {} {}", resource.kind, name));
        self.lock()
            .objects
            .remove(&(resource.kind.to_string(), name.to_string()));
        Ok(())
    }
}
