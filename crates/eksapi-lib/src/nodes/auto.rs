//! Autoscaled nodes: NodeClass, NodePool and the placeholder workload

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Affinity, Container, PodAffinityTerm, PodAntiAffinity, PodSpec, PodTemplateSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use serde_json::{json, Value};
use tracing::info;

use crate::error::{Error, Result};
use crate::k8s::{ClusterApi, NODE_CLASS, NODE_POOL};

pub const PLACEHOLDER_NAMESPACE: &str = "default";
pub const PLACEHOLDER_IMAGE: &str = "public.ecr.aws/amazonlinux/amazonlinux:2023";
const DEFAULT_NODE_CLASS: &str = "default";
const EPHEMERAL_STORAGE_SIZE: &str = "500Gi";

/// Copy the cluster's default NodeClass under `name` with larger disks
pub fn node_class_from_default(default: &Value, name: &str) -> Value {
    let mut node_class = default.clone();
    if let Some(object) = node_class.as_object_mut() {
        object.remove("status");
        object.insert("metadata".to_string(), json!({ "name": name }));
    }
    if let Some(storage) = node_class
        .pointer_mut("/spec/ephemeralStorage")
        .and_then(Value::as_object_mut)
    {
        storage.insert("size".to_string(), json!(EPHEMERAL_STORAGE_SIZE));
    }
    node_class
}

/// NodePool bound to the run's NodeClass
pub fn node_pool(name: &str, instance_types: &[String]) -> Value {
    json!({
        "apiVersion": NODE_POOL.api_version(),
        "kind": NODE_POOL.kind,
        "metadata": { "name": name },
        "spec": {
            "weight": 100,
            "disruption": {
                "budgets": [{ "nodes": "10%" }],
                "consolidationPolicy": "WhenEmpty",
                "consolidateAfter": "600s"
            },
            "template": {
                "spec": {
                    "expireAfter": "24h",
                    "nodeClassRef": {
                        "group": NODE_CLASS.group,
                        "kind": NODE_CLASS.kind,
                        "name": name
                    },
                    "requirements": [
                        {
                            "key": "kubernetes.io/os",
                            "operator": "In",
                            "values": ["linux"]
                        },
                        {
                            "key": "karpenter.sh/capacity-type",
                            "operator": "In",
                            "values": ["on-demand"]
                        },
                        {
                            "key": "node.kubernetes.io/instance-type",
                            "operator": "In",
                            "values": instance_types
                        }
                    ]
                }
            }
        }
    })
}

/// Deployment whose replicas each need a node of their own
pub fn placeholder_deployment(name: &str, replicas: u32) -> Deployment {
    let labels: BTreeMap<String, String> =
        [("app".to_string(), name.to_string())].into_iter().collect();
    let selector = LabelSelector {
        match_labels: Some(labels.clone()),
        ..Default::default()
    };
    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(PLACEHOLDER_NAMESPACE.to_string()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(replicas as i32),
            selector: selector.clone(),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    affinity: Some(Affinity {
                        pod_anti_affinity: Some(PodAntiAffinity {
                            required_during_scheduling_ignored_during_execution: Some(vec![
                                PodAffinityTerm {
                                    label_selector: Some(selector),
                                    topology_key: "kubernetes.io/hostname".to_string(),
                                    ..Default::default()
                                },
                            ]),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    containers: vec![Container {
                        name: "main".to_string(),
                        image: Some(PLACEHOLDER_IMAGE.to_string()),
                        command: Some(vec!["sleep".to_string(), "infinity".to_string()]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn ignore_conflict(kind: &str, name: &str, result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_conflict() => {
            info!(kind = %kind, name = %name, "Already exists");
            Ok(())
        }
        other => other,
    }
}

/// Create NodeClass, NodePool and the placeholder deployment
pub(super) async fn create(
    api: &dyn ClusterApi,
    resource_id: &str,
    nodes: u32,
    instance_types: &[String],
) -> Result<()> {
    let default = api
        .get_object(NODE_CLASS, DEFAULT_NODE_CLASS)
        .await?
        .ok_or_else(|| Error::not_found("NodeClass", DEFAULT_NODE_CLASS))?;
    info!(node_class = %resource_id, "Creating node class from default");
    let result = api
        .create_object(NODE_CLASS, node_class_from_default(&default, resource_id))
        .await;
    ignore_conflict(NODE_CLASS.kind, resource_id, result)?;

    info!(node_pool = %resource_id, "Creating node pool");
    let result = api
        .create_object(NODE_POOL, node_pool(resource_id, instance_types))
        .await;
    ignore_conflict(NODE_POOL.kind, resource_id, result)?;

    if nodes == 0 {
        info!("Not creating placeholder deployment");
        return Ok(());
    }
    info!(deployment = %resource_id, replicas = nodes, "Creating placeholder deployment");
    let result = api
        .create_deployment(
            PLACEHOLDER_NAMESPACE,
            placeholder_deployment(resource_id, nodes),
        )
        .await;
    ignore_conflict("Deployment", resource_id, result)
}

/// Delete the placeholder first so the pool can consolidate, then the
/// NodeClass and NodePool
pub(super) async fn delete(api: &dyn ClusterApi, resource_id: &str) -> Result<()> {
    info!(deployment = %resource_id, "Deleting placeholder deployment");
    api.delete_deployment(PLACEHOLDER_NAMESPACE, resource_id)
        .await?;
    info!(node_class = %resource_id, "Deleting node class");
    api.delete_object(NODE_CLASS, resource_id).await?;
    info!(node_pool = %resource_id, "Deleting node pool");
    api.delete_object(NODE_POOL, resource_id).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::fake::FakeCluster;

    #[test]
    fn test_node_class_copy() {
        let default = json!({
            "apiVersion": "eks.amazonaws.com/v1",
            "kind": "NodeClass",
            "metadata": { "name": "default", "uid": "1", "resourceVersion": "9" },
            "spec": { "role": "r", "ephemeralStorage": { "size": "80Gi", "iops": 3000 } },
            "status": { "conditions": [] }
        });
        let copy = node_class_from_default(&default, "kubetest2-eksapi-x");
        assert_eq!(copy["metadata"], json!({ "name": "kubetest2-eksapi-x" }));
        assert!(copy.get("status").is_none());
        assert_eq!(copy["spec"]["ephemeralStorage"]["size"], "500Gi");
        assert_eq!(copy["spec"]["ephemeralStorage"]["iops"], 3000);
        assert_eq!(copy["spec"]["role"], "r");
    }

    #[test]
    fn test_node_pool_shape() {
        let pool = node_pool("np", &["m6i.large".into()]);
        assert_eq!(pool["spec"]["weight"], 100);
        assert_eq!(pool["spec"]["disruption"]["budgets"][0]["nodes"], "10%");
        assert_eq!(pool["spec"]["disruption"]["consolidateAfter"], "600s");
        assert_eq!(pool["spec"]["template"]["spec"]["expireAfter"], "24h");
        assert_eq!(pool["spec"]["template"]["spec"]["nodeClassRef"]["name"], "np");
        let reqs = pool["spec"]["template"]["spec"]["requirements"]
            .as_array()
            .unwrap();
        assert_eq!(reqs[2]["values"], json!(["m6i.large"]));
    }

    #[test]
    fn test_placeholder_anti_affinity() {
        let d = placeholder_deployment("ph", 4);
        let spec = d.spec.unwrap();
        assert_eq!(spec.replicas, Some(4));
        let pod = spec.template.spec.unwrap();
        let terms = pod
            .affinity
            .unwrap()
            .pod_anti_affinity
            .unwrap()
            .required_during_scheduling_ignored_during_execution
            .unwrap();
        assert_eq!(terms[0].topology_key, "kubernetes.io/hostname");
        assert_eq!(pod.containers[0].name, "main");
        assert_eq!(
            pod.containers[0].command,
            Some(vec!["sleep".to_string(), "infinity".to_string()])
        );
    }

    #[tokio::test]
    async fn test_create_and_delete_order() {
        let cluster = FakeCluster::new().with_default_node_class();
        create(&cluster, "kubetest2-eksapi-x", 4, &["m6i.large".into()])
            .await
            .unwrap();
        assert!(cluster.object(NODE_CLASS, "kubetest2-eksapi-x").is_some());
        assert!(cluster.object(NODE_POOL, "kubetest2-eksapi-x").is_some());
        assert!(cluster
            .deployment(PLACEHOLDER_NAMESPACE, "kubetest2-eksapi-x")
            .is_some());

        // a second create adopts everything
        create(&cluster, "kubetest2-eksapi-x", 4, &["m6i.large".into()])
            .await
            .unwrap();

        delete(&cluster, "kubetest2-eksapi-x").await.unwrap();
        let deletes: Vec<String> = cluster
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("delete"))
            .collect();
        assert_eq!(
            deletes,
            vec![
                "delete deployment default/kubetest2-eksapi-x",
                "delete NodeClass kubetest2-eksapi-x",
                "delete NodePool kubetest2-eksapi-x",
            ]
        );
    }

    #[tokio::test]
    async fn test_zero_nodes_skips_placeholder() {
        let cluster = FakeCluster::new().with_default_node_class();
        create(&cluster, "np", 0, &["m6i.large".into()]).await.unwrap();
        assert!(cluster.deployment(PLACEHOLDER_NAMESPACE, "np").is_none());
    }

    #[tokio::test]
    async fn test_missing_default_node_class() {
        let cluster = FakeCluster::new();
        let err = create(&cluster, "np", 1, &[]).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
