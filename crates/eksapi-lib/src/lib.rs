//! Control plane for standing up and tearing down throwaway EKS-style
//! clusters for conformance and scale testing.
//!
//! The [`deployer::Deployer`] drives one run through infrastructure,
//! cluster, nodes, add-ons and load; the [`janitor::Janitor`] sweeps runs
//! that were never torn down. Every cloud service is reached through the
//! trait seams in [`cloud`].

pub mod addons;
pub mod cloud;
pub mod cluster;
pub mod deployer;
pub mod document;
pub mod error;
pub mod health;
pub mod janitor;
pub mod k8s;
pub mod kubeconfig;
pub mod loadgen;
pub mod logs;
pub mod metrics;
pub mod models;
pub mod nodes;
pub mod observability;
pub mod options;
pub mod resolver;
pub mod stack;

pub use deployer::{ClusterConnector, Deployer, KubeConnector};
pub use document::{ConfigDocument, DeployerStatus, LifecyclePhase};
pub use error::{Error, Result};
pub use health::{ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse};
pub use janitor::{Janitor, SweepReport};
pub use models::*;
pub use observability::ProgressLogger;
pub use options::DeployerOptions;
