//! Objects the load generator writes and reads

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, PostParams};
use kube::Client;

#[cfg(test)]
use mockall::automock;

use crate::error::{Error, Result};

/// CRUD surface the workers exercise
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LoadTarget: Send + Sync {
    async fn create(&self, namespace: &str, name: &str, payload: &str) -> Result<()>;

    async fn get(&self, namespace: &str, name: &str) -> Result<()>;

    /// List one page and return how many objects it held
    async fn list(&self, namespace: &str, limit: u32) -> Result<usize>;

    /// Read-modify-write; a concurrent change surfaces as a conflict
    async fn update(&self, namespace: &str, name: &str, payload: &str) -> Result<()>;

    /// Missing objects are success
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;
}

/// ConfigMaps on a live API server
#[derive(Clone)]
pub struct KubeLoadTarget {
    client: Client,
}

impl KubeLoadTarget {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn config_map(namespace: &str, name: &str, payload: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([("name".to_string(), name.to_string())])),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(name.to_string(), payload.to_string())])),
        ..Default::default()
    }
}

#[async_trait]
impl LoadTarget for KubeLoadTarget {
    async fn create(&self, namespace: &str, name: &str, payload: &str) -> Result<()> {
        self.api(namespace)
            .create(&PostParams::default(), &config_map(namespace, name, payload))
            .await?;
        Ok(())
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<()> {
        self.api(namespace).get(name).await?;
        Ok(())
    }

    async fn list(&self, namespace: &str, limit: u32) -> Result<usize> {
        let page = self
            .api(namespace)
            .list(&ListParams::default().limit(limit))
            .await?;
        Ok(page.items.len())
    }

    async fn update(&self, namespace: &str, name: &str, payload: &str) -> Result<()> {
        let api = self.api(namespace);
        let mut current = api.get(name).await?;
        current
            .data
            .get_or_insert_with(BTreeMap::new)
            .insert(name.to_string(), payload.to_string());
        api.replace(name, &PostParams::default(), &current).await?;
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .api(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                let err = Error::from(e);
                if err.is_not_found() {
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }
}
