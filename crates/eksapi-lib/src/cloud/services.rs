//! Smaller service seams: auto-scaling, identity, object storage,
//! parameter store, monitoring and remote command

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoScalingGroup {
    pub name: String,
    pub instance_ids: Vec<String>,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait AutoScalingApi: Send + Sync {
    async fn describe_auto_scaling_group(&self, name: &str) -> Result<Option<AutoScalingGroup>>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait IdentityApi: Send + Sync {
    /// Names of instance profiles the role is attached to
    async fn list_instance_profiles_for_role(&self, role_name: &str) -> Result<Vec<String>>;

    async fn remove_role_from_instance_profile(&self, profile: &str, role_name: &str)
        -> Result<()>;

    /// Returns `Error::NotFound` when the profile is already gone
    async fn delete_instance_profile(&self, profile: &str) -> Result<()>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStoreApi: Send + Sync {
    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<()>;

    /// Presigned URL allowing a single PUT of `key`
    async fn presign_put(&self, bucket: &str, key: &str, expires_in: Duration) -> Result<String>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ParameterStoreApi: Send + Sync {
    async fn get_parameter(&self, name: &str) -> Result<String>;
}

/// Unit attached to a monitoring datum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricUnit {
    Seconds,
    Count,
    Milliseconds,
}

impl fmt::Display for MetricUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MetricUnit::Seconds => "Seconds",
            MetricUnit::Count => "Count",
            MetricUnit::Milliseconds => "Milliseconds",
        };
        f.write_str(s)
    }
}

/// A single monitoring data point as sent on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDatum {
    pub metric_name: String,
    pub value: f64,
    pub unit: MetricUnit,
    pub dimensions: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait MonitoringApi: Send + Sync {
    async fn put_metric_data(&self, namespace: &str, data: Vec<MetricDatum>) -> Result<()>;
}

/// Status of one remote-command invocation on one instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationStatus {
    Pending,
    InProgress,
    Delayed,
    Success,
    Cancelled,
    TimedOut,
    Failed,
    Cancelling,
}

impl InvocationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InvocationStatus::Success
                | InvocationStatus::Cancelled
                | InvocationStatus::TimedOut
                | InvocationStatus::Failed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendCommandRequest {
    pub document_name: String,
    pub instance_ids: Vec<String>,
    pub output_bucket: String,
    pub output_key_prefix: String,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteCommandApi: Send + Sync {
    /// Register a command document with JSON `content`
    async fn create_document(&self, name: &str, content: &str) -> Result<()>;

    async fn delete_document(&self, name: &str) -> Result<()>;

    /// Returns the command id
    async fn send_command(&self, request: &SendCommandRequest) -> Result<String>;

    async fn get_command_invocation(
        &self,
        command_id: &str,
        instance_id: &str,
    ) -> Result<InvocationStatus>;
}
