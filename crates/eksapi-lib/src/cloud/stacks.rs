//! Declarative stack service seam

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;

use crate::error::{Error, Result};

/// Lifecycle status of a stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackStatus {
    CreateInProgress,
    CreateComplete,
    CreateFailed,
    RollbackInProgress,
    RollbackComplete,
    RollbackFailed,
    DeleteInProgress,
    DeleteComplete,
    DeleteFailed,
    UpdateComplete,
    Other(String),
}

impl StackStatus {
    pub fn as_str(&self) -> &str {
        match self {
            StackStatus::CreateInProgress => "CREATE_IN_PROGRESS",
            StackStatus::CreateComplete => "CREATE_COMPLETE",
            StackStatus::CreateFailed => "CREATE_FAILED",
            StackStatus::RollbackInProgress => "ROLLBACK_IN_PROGRESS",
            StackStatus::RollbackComplete => "ROLLBACK_COMPLETE",
            StackStatus::RollbackFailed => "ROLLBACK_FAILED",
            StackStatus::DeleteInProgress => "DELETE_IN_PROGRESS",
            StackStatus::DeleteComplete => "DELETE_COMPLETE",
            StackStatus::DeleteFailed => "DELETE_FAILED",
            StackStatus::UpdateComplete => "UPDATE_COMPLETE",
            StackStatus::Other(s) => s,
        }
    }

    /// Creation finished one way or the other
    pub fn is_create_terminal(&self) -> bool {
        !matches!(
            self,
            StackStatus::CreateInProgress | StackStatus::RollbackInProgress
        )
    }

    /// Statuses that mean the stack is usable
    pub fn is_create_success(&self) -> bool {
        matches!(self, StackStatus::CreateComplete | StackStatus::UpdateComplete)
    }
}

impl fmt::Display for StackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StackStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "CREATE_IN_PROGRESS" => StackStatus::CreateInProgress,
            "CREATE_COMPLETE" => StackStatus::CreateComplete,
            "CREATE_FAILED" => StackStatus::CreateFailed,
            "ROLLBACK_IN_PROGRESS" => StackStatus::RollbackInProgress,
            "ROLLBACK_COMPLETE" => StackStatus::RollbackComplete,
            "ROLLBACK_FAILED" => StackStatus::RollbackFailed,
            "DELETE_IN_PROGRESS" => StackStatus::DeleteInProgress,
            "DELETE_COMPLETE" => StackStatus::DeleteComplete,
            "DELETE_FAILED" => StackStatus::DeleteFailed,
            "UPDATE_COMPLETE" => StackStatus::UpdateComplete,
            other => StackStatus::Other(other.to_string()),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateStackRequest {
    pub name: String,
    pub template_body: String,
    pub parameters: BTreeMap<String, String>,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stack {
    pub name: String,
    pub id: String,
    pub status: StackStatus,
    pub status_reason: Option<String>,
    pub outputs: BTreeMap<String, String>,
    pub tags: BTreeMap<String, String>,
    pub creation_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackSummary {
    pub name: String,
    pub id: String,
    pub status: StackStatus,
    pub creation_time: DateTime<Utc>,
}

/// One page of a stack listing
#[derive(Debug, Clone, Default)]
pub struct StackPage {
    pub stacks: Vec<StackSummary>,
    pub next_token: Option<String>,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait StackApi: Send + Sync {
    /// Create a stack and return its id
    async fn create_stack(&self, request: &CreateStackRequest) -> Result<String>;

    /// Describe a stack by name or id; `None` if it does not exist
    async fn describe_stack(&self, name: &str) -> Result<Option<Stack>>;

    async fn delete_stack(&self, name: &str) -> Result<()>;

    async fn list_stacks(&self, next_token: Option<String>) -> Result<StackPage>;
}
