//! Echo Job and CronJob workloads
//!
//! The pods append a random string of `echo_size` bytes to a scratch
//! volume and exit. Apply waits until `completions` pods have succeeded,
//! summed over every Job a CronJob spawned.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{CronJob, CronJobSpec, Job, JobSpec, JobTemplateSpec};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, PodSpec, PodTemplateSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{Addon, AddonContext};
use crate::cloud::wait_until;
use crate::error::{Error, Result};
use crate::k8s::JobKind;

pub const JOB_NAME: &str = "job-echo";
pub const ECHO_IMAGE: &str = "public.ecr.aws/docker/library/busybox:latest";
const JOB_POLL_INTERVAL: Duration = Duration::from_secs(10);
/// Shell argument limits keep the echoed string well below this
const MAX_ECHO_SIZE: u32 = 100 * 1024;

/// Options of one echo workload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EchoJobConfig {
    /// Defaults to `<resource id>-<add-on name>`
    pub namespace: Option<String>,
    pub image: String,
    /// Succeeded pods to wait for
    pub completions: i32,
    pub parallelism: i32,
    pub echo_size: u32,
    /// CronJob schedule; ignored for plain Jobs
    pub schedule: String,
    pub successful_jobs_history_limit: i32,
    pub failed_jobs_history_limit: i32,
    pub timeout_secs: u64,
}

impl Default for EchoJobConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            image: ECHO_IMAGE.to_string(),
            completions: 10,
            parallelism: 10,
            echo_size: 1024,
            schedule: "*/10 * * * *".to_string(),
            successful_jobs_history_limit: 3,
            failed_jobs_history_limit: 1,
            timeout_secs: 30 * 60,
        }
    }
}

impl EchoJobConfig {
    pub fn validate(&self) -> Result<()> {
        if self.completions <= 0 || self.parallelism <= 0 {
            return Err(Error::invalid_config(
                "completions and parallelism must be positive",
            ));
        }
        if self.parallelism > self.completions {
            return Err(Error::invalid_config(
                "parallelism cannot exceed completions",
            ));
        }
        if self.echo_size > MAX_ECHO_SIZE {
            return Err(Error::invalid_config(format!(
                "echo_size cannot exceed {} bytes",
                MAX_ECHO_SIZE
            )));
        }
        if self.schedule.split_whitespace().count() != 5 {
            return Err(Error::invalid_config(format!(
                "schedule {:?} is not a five-field cron expression",
                self.schedule
            )));
        }
        if self.image.trim().is_empty() {
            return Err(Error::invalid_config("image cannot be empty"));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn pod_template(config: &EchoJobConfig) -> PodTemplateSpec {
    let echo: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(config.echo_size as usize)
        .map(char::from)
        .collect();
    PodTemplateSpec {
        metadata: None,
        spec: Some(PodSpec {
            restart_policy: Some("OnFailure".to_string()),
            containers: vec![Container {
                name: JOB_NAME.to_string(),
                image: Some(config.image.clone()),
                image_pull_policy: Some("IfNotPresent".to_string()),
                command: Some(vec![
                    "/bin/sh".to_string(),
                    "-ec".to_string(),
                    format!("echo -n '{}' >> /config/output.txt", echo),
                ]),
                volume_mounts: Some(vec![VolumeMount {
                    name: "config".to_string(),
                    mount_path: "/config".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            volumes: Some(vec![Volume {
                name: "config".to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

fn job_spec(config: &EchoJobConfig) -> JobSpec {
    JobSpec {
        completions: Some(config.completions),
        parallelism: Some(config.parallelism),
        template: pod_template(config),
        ..Default::default()
    }
}

pub fn echo_job(namespace: &str, config: &EchoJobConfig) -> Job {
    Job {
        metadata: ObjectMeta {
            name: Some(JOB_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(job_spec(config)),
        ..Default::default()
    }
}

pub fn echo_cron_job(namespace: &str, config: &EchoJobConfig) -> CronJob {
    CronJob {
        metadata: ObjectMeta {
            name: Some(JOB_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(CronJobSpec {
            schedule: config.schedule.clone(),
            concurrency_policy: Some("Replace".to_string()),
            successful_jobs_history_limit: Some(config.successful_jobs_history_limit),
            failed_jobs_history_limit: Some(config.failed_jobs_history_limit),
            job_template: JobTemplateSpec {
                metadata: Some(ObjectMeta {
                    name: Some(JOB_NAME.to_string()),
                    ..Default::default()
                }),
                spec: Some(job_spec(config)),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Runs the echo workload as a Job or a CronJob
pub struct EchoJobAddon {
    kind: JobKind,
    config: Option<EchoJobConfig>,
}

impl EchoJobAddon {
    pub fn job(config: Option<EchoJobConfig>) -> Self {
        Self {
            kind: JobKind::Job,
            config,
        }
    }

    pub fn cron_job(config: Option<EchoJobConfig>) -> Self {
        Self {
            kind: JobKind::CronJob,
            config,
        }
    }

    pub fn namespace(&self, ctx: &AddonContext) -> String {
        self.config
            .as_ref()
            .and_then(|c| c.namespace.clone())
            .unwrap_or_else(|| format!("{}-{}", ctx.resource_id, self.name()))
    }
}

#[async_trait]
impl Addon for EchoJobAddon {
    fn name(&self) -> &str {
        match self.kind {
            JobKind::Job => "jobs-echo",
            JobKind::CronJob => "cron-jobs",
        }
    }

    fn is_enabled(&self) -> bool {
        self.config.is_some()
    }

    fn apply_defaults(&mut self) {
        if let Some(config) = self.config.as_mut() {
            if config.namespace.as_deref().is_some_and(|n| n.trim().is_empty()) {
                config.namespace = None;
            }
        }
    }

    fn validate(&self) -> Result<()> {
        match &self.config {
            Some(config) => config.validate(),
            None => Ok(()),
        }
    }

    async fn apply(&self, ctx: &AddonContext) -> Result<()> {
        let Some(config) = &self.config else {
            return Ok(());
        };
        let api = ctx.k8s.clone().ok_or_else(|| {
            Error::invalid_config(format!("{} add-on needs a cluster client", self.name()))
        })?;
        let namespace = self.namespace(ctx);
        api.create_namespace(&namespace).await?;
        match self.kind {
            JobKind::Job => api.create_job(&namespace, echo_job(&namespace, config)).await?,
            JobKind::CronJob => {
                api.create_cron_job(&namespace, echo_cron_job(&namespace, config))
                    .await?
            }
        }
        info!(addon = %self.name(), namespace = %namespace, "Created {}", self.kind);

        let wait = wait_until(
            "echo job completion",
            JOB_NAME,
            config.timeout(),
            JOB_POLL_INTERVAL,
            || async {
                let succeeded = api.succeeded_pods(&namespace, self.kind, JOB_NAME).await?;
                debug!(succeeded, wanted = config.completions, "Echo pods succeeded");
                Ok((succeeded >= config.completions).then_some(succeeded))
            },
        );
        let succeeded = tokio::select! {
            biased;
            _ = ctx.stop.stopped() => return Err(Error::cancelled("echo job completion")),
            result = wait => result?,
        };
        info!(addon = %self.name(), succeeded, "Echo workload complete");
        Ok(())
    }

    async fn finalize(&self, ctx: &AddonContext) -> Result<()> {
        let Some(api) = &ctx.k8s else {
            debug!(addon = %self.name(), "No cluster client, nothing to finalize");
            return Ok(());
        };
        let namespace = self.namespace(ctx);
        let job = api.delete_job(&namespace, self.kind, JOB_NAME).await;
        let ns = api.delete_namespace(&namespace).await;
        Error::aggregate(job.err().into_iter().chain(ns.err()).collect())?;
        info!(addon = %self.name(), namespace = %namespace, "Deleted echo workload");
        Ok(())
    }
}
