//! Error types for the cluster tester
//!
//! Variants follow the failure taxonomy the lifecycle engine acts on:
//! invalid configuration is never retried, transient remote failures are
//! retried by the cloud façade, not-found during deletion is absorbed,
//! and waiter timeouts are fatal for the phase that issued them.

use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the library
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Main error type for tester operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Operator-supplied options are inconsistent or incomplete
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Description of what's invalid
        message: String,
    },

    /// Remote call failed in a way that may succeed on retry
    #[error("transient failure in {operation}: {message}")]
    Transient {
        /// Remote operation that failed
        operation: String,
        /// Underlying failure
        message: String,
    },

    /// A waiter gave up before the resource reached the desired state
    #[error("timed out after {timeout:?} waiting for {operation} on {id}")]
    Timeout {
        /// What was being waited for
        operation: String,
        /// Identifier of the resource
        id: String,
        /// Bound that was exceeded
        timeout: Duration,
    },

    /// Resource does not exist
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Resource kind (stack, cluster, nodegroup, ...)
        kind: String,
        /// Identifier that was looked up
        id: String,
    },

    /// Resource already exists or was modified concurrently
    #[error("conflict on {kind} {id}: {message}")]
    Conflict {
        kind: String,
        id: String,
        message: String,
    },

    /// Non-retryable remote failure
    #[error("{operation} failed: {message}")]
    Cloud {
        /// Remote operation that failed
        operation: String,
        /// Underlying failure
        message: String,
    },

    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    /// Local filesystem error
    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Errors collected from parallel work
    #[error("{} errors: {}", .0.len(), join_errors(.0))]
    Aggregate(Vec<Error>),

    /// Operation abandoned because the stop signal fired
    #[error("cancelled: {operation}")]
    Cancelled { operation: String },
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Create an invalid configuration error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: msg.into(),
        }
    }

    /// Create a transient failure for the given operation
    pub fn transient(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Transient {
            operation: operation.into(),
            message: msg.into(),
        }
    }

    /// Create a non-retryable remote failure
    pub fn cloud(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Cloud {
            operation: operation.into(),
            message: msg.into(),
        }
    }

    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    pub fn conflict(
        kind: impl Into<String>,
        id: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            kind: kind.into(),
            id: id.into(),
            message: msg.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, id: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            id: id.into(),
            timeout,
        }
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Collapse a list of errors: none is `Ok`, one is returned as-is
    pub fn aggregate(mut errors: Vec<Error>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Aggregate(errors)),
        }
    }

    /// True when the resource is absent, including a 404 from the API server
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube {
                source: kube::Error::Api(resp),
            } => resp.code == 404,
            _ => false,
        }
    }

    /// True when the resource already exists or was updated concurrently
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube {
                source: kube::Error::Api(resp),
            } => resp.code == 409,
            _ => false,
        }
    }

    /// True for failures the cloud façade should retry
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transient { .. } => true,
            Error::Kube {
                source: kube::Error::Api(resp),
            } => resp.code == 429 || resp.code >= 500,
            Error::Kube { .. } => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::invalid_config(e.to_string())
    }
}
