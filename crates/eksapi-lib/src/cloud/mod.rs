//! Cloud client façade
//!
//! Every cloud service the tester talks to is reached through one of the
//! traits re-exported here. Concrete SDK bindings implement the traits;
//! the rest of the crate only sees [`CloudClients`].
//!
//! Retries and per-call deadlines are applied by [`call`], which every
//! component uses instead of awaiting a trait method directly.

mod compute;
mod eks;
mod retry;
mod services;
mod stacks;
mod waiter;

#[cfg(test)]
pub mod fake;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use compute::*;
pub use eks::*;
pub use retry::{retry_if, retry_with_backoff, RetryConfig};
pub use services::*;
pub use stacks::*;
pub use waiter::{wait_until, with_deadline};

use crate::error::Result;

/// Tag carrying a non-default endpoint so the janitor can find its way back
pub const ENDPOINT_URL_TAG: &str = "endpoint-url";

/// Deadline for a single describe/list style call
pub const DESCRIBE_DEADLINE: Duration = Duration::from_secs(15);

/// Region and optional endpoint override shared by all handles
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudEndpoint {
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
}

impl CloudEndpoint {
    /// Tags every stack created against this endpoint carries
    pub fn stack_tags(&self) -> BTreeMap<String, String> {
        let mut tags = BTreeMap::new();
        if let Some(url) = self.endpoint_url.as_deref().filter(|u| !u.is_empty()) {
            tags.insert(ENDPOINT_URL_TAG.to_string(), url.to_string());
        }
        tags
    }

    /// Rebuild an endpoint from the tags written by [`Self::stack_tags`]
    pub fn from_stack_tags(region: Option<String>, tags: &BTreeMap<String, String>) -> Self {
        Self {
            region,
            endpoint_url: tags.get(ENDPOINT_URL_TAG).cloned(),
        }
    }
}

/// Typed handles for every service, sharing one endpoint
#[derive(Clone)]
pub struct CloudClients {
    pub endpoint: CloudEndpoint,
    pub compute: Arc<dyn ComputeApi>,
    pub stacks: Arc<dyn StackApi>,
    pub autoscaling: Arc<dyn AutoScalingApi>,
    pub eks: Arc<dyn ClusterControlApi>,
    pub identity: Arc<dyn IdentityApi>,
    pub object_store: Arc<dyn ObjectStoreApi>,
    pub parameters: Arc<dyn ParameterStoreApi>,
    pub monitoring: Arc<dyn MonitoringApi>,
    pub remote_command: Arc<dyn RemoteCommandApi>,
    pub retry: RetryConfig,
}

impl std::fmt::Debug for CloudClients {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudClients")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

/// Builds clients for an arbitrary endpoint
///
/// The janitor uses this to reach stacks created against a non-default
/// endpoint.
pub trait CloudClientFactory: Send + Sync {
    fn clients_for(&self, endpoint: &CloudEndpoint) -> Result<CloudClients>;
}

impl CloudClients {
    /// Run one remote call with the façade's retry policy and the default
    /// per-call deadline
    pub async fn call<F, Fut, T>(&self, operation: &str, f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        call(&self.retry, operation, DESCRIBE_DEADLINE, f).await
    }
}

/// Retry `f` with backoff, bounding every attempt by `deadline`
pub async fn call<F, Fut, T>(
    retry: &RetryConfig,
    operation: &str,
    deadline: Duration,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_with_backoff(retry, operation, || with_deadline(operation, deadline, f())).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_tags_only_for_custom_endpoint() {
        let default = CloudEndpoint::default();
        assert!(default.stack_tags().is_empty());

        let custom = CloudEndpoint {
            region: Some("us-west-2".into()),
            endpoint_url: Some("https://eks.beta.example.com".into()),
        };
        let tags = custom.stack_tags();
        assert_eq!(
            tags.get(ENDPOINT_URL_TAG).map(String::as_str),
            Some("https://eks.beta.example.com")
        );

        let rebuilt = CloudEndpoint::from_stack_tags(Some("us-west-2".into()), &tags);
        assert_eq!(rebuilt, custom);
    }
}
