//! kube-rs implementation of the cluster seam

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Node, Secret};
use kube::api::{
    Api, DeleteParams, DynamicObject, ListParams, ObjectMeta, Patch, PatchParams, PostParams,
    PropagationPolicy,
};
use kube::discovery::ApiResource;
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use tracing::debug;

use super::{ClusterApi, DynamicResource, JobKind, NodeEvent, NodeEventStream, NodeInfo};
use crate::error::{Error, Result};

const INSTANCE_TYPE_LABEL: &str = "node.kubernetes.io/instance-type";
const ARCH_LABEL: &str = "kubernetes.io/arch";

/// Cluster seam backed by a live API server
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from a kubeconfig file on disk
    pub async fn from_kubeconfig(path: &std::path::Path) -> Result<Self> {
        let kubeconfig = kube::config::Kubeconfig::read_from(path)
            .map_err(|e| Error::invalid_config(format!("reading {}: {}", path.display(), e)))?;
        let config = kube::Config::from_custom_kubeconfig(
            kubeconfig,
            &kube::config::KubeConfigOptions::default(),
        )
        .await
        .map_err(|e| Error::invalid_config(format!("loading {}: {}", path.display(), e)))?;
        let client = Client::try_from(config)?;
        Ok(Self::new(client))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn dynamic(&self, resource: DynamicResource) -> Api<DynamicObject> {
        let ar = ApiResource {
            group: resource.group.to_string(),
            version: resource.version.to_string(),
            api_version: resource.api_version(),
            kind: resource.kind.to_string(),
            plural: resource.plural.to_string(),
        };
        Api::all_with(self.client.clone(), &ar)
    }
}

/// Project a Node object onto the fields the tester reads
pub fn node_info(node: &Node) -> NodeInfo {
    let labels = node.metadata.labels.clone().unwrap_or_default();
    let status = node.status.as_ref();
    let node_info = status.and_then(|s| s.node_info.as_ref());
    let ready_condition = status
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| conditions.iter().find(|c| c.type_ == "Ready"));
    let ready = ready_condition.map_or(false, |c| c.status == "True");

    NodeInfo {
        name: node.metadata.name.clone().unwrap_or_default(),
        provider_id: node.spec.as_ref().and_then(|s| s.provider_id.clone()),
        instance_type: labels.get(INSTANCE_TYPE_LABEL).cloned().unwrap_or_default(),
        os: node_info
            .map(|i| i.operating_system.clone())
            .unwrap_or_default(),
        os_image: node_info.map(|i| i.os_image.clone()).unwrap_or_default(),
        arch: node_info
            .map(|i| i.architecture.clone())
            .or_else(|| labels.get(ARCH_LABEL).cloned())
            .unwrap_or_default(),
        created: node.metadata.creation_timestamp.as_ref().map(|t| t.0),
        ready,
        ready_since: ready_condition
            .filter(|_| ready)
            .and_then(|c| c.last_transition_time.as_ref())
            .map(|t| t.0),
    }
}

fn absorb_not_found(result: std::result::Result<(), kube::Error>) -> Result<()> {
    match result.map_err(Error::from) {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

fn absorb_conflict(
    kind: &str,
    name: &str,
    result: std::result::Result<(), kube::Error>,
) -> Result<()> {
    match result.map_err(Error::from) {
        Err(e) if e.is_conflict() => {
            debug!(kind = %kind, name = %name, "Already exists");
            Ok(())
        }
        other => other,
    }
}

fn foreground_now() -> DeleteParams {
    DeleteParams {
        grace_period_seconds: Some(0),
        propagation_policy: Some(PropagationPolicy::Foreground),
        ..Default::default()
    }
}

/// Whether `job` was spawned by the named CronJob
fn owned_by_cron_job(job: &Job, cron_job: &str) -> bool {
    job.metadata.owner_references.as_ref().map_or(false, |refs| {
        refs.iter().any(|r| r.kind == "CronJob" && r.name == cron_job)
    })
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api.list(&Default::default()).await?;
        Ok(nodes.items.iter().map(node_info).collect())
    }

    fn watch_nodes(&self) -> NodeEventStream {
        let api: Api<Node> = Api::all(self.client.clone());
        watcher(api, watcher::Config::default())
            .default_backoff()
            .map(|event| match event {
                Ok(watcher::Event::Applied(node)) => Ok(NodeEvent::Applied(node_info(&node))),
                Ok(watcher::Event::Deleted(node)) => {
                    Ok(NodeEvent::Deleted(node.metadata.name.unwrap_or_default()))
                }
                Ok(watcher::Event::Restarted(nodes)) => {
                    Ok(NodeEvent::Restarted(nodes.iter().map(node_info).collect()))
                }
                Err(e) => Err(Error::transient("watch nodes", e.to_string())),
            })
            .boxed()
    }

    async fn server_version(&self) -> Result<String> {
        let info = self.client.apiserver_version().await?;
        // GKE/EKS report minors like "30+"
        let minor = info.minor.trim_end_matches('+');
        Ok(format!("{}.{}", info.major, minor))
    }

    async fn apply_config_map(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        };
        match api.create(&PostParams::default(), &config_map).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let e = Error::from(e);
                if !e.is_conflict() {
                    return Err(e);
                }
                debug!(namespace = %namespace, name = %name, "Configmap exists, patching");
                api.patch(name, &PatchParams::default(), &Patch::Merge(&config_map))
                    .await?;
                Ok(())
            }
        }
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        absorb_not_found(api.delete(name, &DeleteParams::default()).await.map(|_| ()))
    }

    async fn create_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        absorb_conflict(
            "namespace",
            name,
            api.create(&PostParams::default(), &namespace).await.map(|_| ()),
        )
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        absorb_not_found(api.delete(name, &DeleteParams::foreground()).await.map(|_| ()))
    }

    async fn namespace_exists(&self, name: &str) -> Result<bool> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?.is_some())
    }

    async fn create_secret(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            type_: Some("Opaque".to_string()),
            string_data: Some(data),
            ..Default::default()
        };
        api.create(&PostParams::default(), &secret).await?;
        Ok(())
    }

    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api.get_opt(name).await?;
        Ok(secret.map(|s| {
            s.data
                .unwrap_or_default()
                .into_iter()
                .map(|(k, v)| (k, String::from_utf8_lossy(&v.0).into_owned()))
                .collect()
        }))
    }

    async fn create_job(&self, namespace: &str, job: Job) -> Result<()> {
        let name = job.metadata.name.clone().unwrap_or_default();
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        absorb_conflict(
            "job",
            &name,
            api.create(&PostParams::default(), &job).await.map(|_| ()),
        )
    }

    async fn create_cron_job(&self, namespace: &str, cron_job: CronJob) -> Result<()> {
        let name = cron_job.metadata.name.clone().unwrap_or_default();
        let api: Api<CronJob> = Api::namespaced(self.client.clone(), namespace);
        absorb_conflict(
            "cronjob",
            &name,
            api.create(&PostParams::default(), &cron_job).await.map(|_| ()),
        )
    }

    async fn succeeded_pods(&self, namespace: &str, kind: JobKind, name: &str) -> Result<i32> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let succeeded = |job: &Job| job.status.as_ref().and_then(|s| s.succeeded).unwrap_or(0);
        match kind {
            JobKind::Job => Ok(jobs.get_opt(name).await?.map_or(0, |j| succeeded(&j))),
            JobKind::CronJob => {
                let list = jobs.list(&ListParams::default()).await?;
                Ok(list
                    .items
                    .iter()
                    .filter(|j| owned_by_cron_job(j, name))
                    .map(succeeded)
                    .sum())
            }
        }
    }

    async fn delete_job(&self, namespace: &str, kind: JobKind, name: &str) -> Result<()> {
        let result = match kind {
            JobKind::Job => Api::<Job>::namespaced(self.client.clone(), namespace)
                .delete(name, &foreground_now())
                .await
                .map(|_| ()),
            JobKind::CronJob => Api::<CronJob>::namespaced(self.client.clone(), namespace)
                .delete(name, &foreground_now())
                .await
                .map(|_| ()),
        };
        absorb_not_found(result)
    }

    async fn create_deployment(&self, namespace: &str, deployment: Deployment) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), &deployment).await?;
        Ok(())
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            ..Default::default()
        };
        absorb_not_found(api.delete(name, &params).await.map(|_| ()))
    }

    async fn get_object(
        &self,
        resource: DynamicResource,
        name: &str,
    ) -> Result<Option<serde_json::Value>> {
        let object = self.dynamic(resource).get_opt(name).await?;
        object
            .map(|o| serde_json::to_value(o).map_err(Error::from))
            .transpose()
    }

    async fn create_object(&self, resource: DynamicResource, object: serde_json::Value) -> Result<()> {
        let object: DynamicObject = serde_json::from_value(object)?;
        self.dynamic(resource)
            .create(&PostParams::default(), &object)
            .await?;
        Ok(())
    }

    async fn delete_object(&self, resource: DynamicResource, name: &str) -> Result<()> {
        absorb_not_found(
            self.dynamic(resource)
                .delete(name, &DeleteParams::default())
                .await
                .map(|_| ()),
        )
    }
}
