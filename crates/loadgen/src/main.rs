//! Synthetic API-server load generator
//!
//! Runs one load run against the cluster it is deployed into, serving
//! health, Prometheus metrics and a live latency summary until the run's
//! deadline or a termination signal.

use anyhow::{Context, Result};
use eksapi_lib::{
    health::{components, HealthRegistry},
    loadgen::{KubeLoadTarget, LoadMetrics, LoadRun, StopSignal},
};
use prometheus::Registry;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting eksapi-loadgen");

    let config = config::LoadgenConfig::from_env()?;
    let load = config.load.clone();
    info!(
        clients = load.clients,
        qps = load.qps,
        deadline_secs = load.deadline_secs,
        "Load generator configured"
    );

    let health_registry = HealthRegistry::new();
    health_registry.register(components::TARGET).await;
    health_registry.register(components::PERSISTENCE).await;
    if load.object_size > 0 {
        health_registry.register(components::WRITERS).await;
    }
    if !load.namespaces_read.is_empty() {
        health_registry.register(components::READERS).await;
    }

    let registry = Registry::new();
    let metrics = LoadMetrics::new(&registry)?;

    let client = match &config.kubeconfig {
        Some(path) => eksapi_lib::k8s::KubeClusterApi::from_kubeconfig(path)
            .await?
            .client()
            .clone(),
        None => kube::Client::try_default()
            .await
            .context("building in-cluster client")?,
    };

    let stop = StopSignal::new();
    let signals = stop.trigger_on_os_signals();
    let run = LoadRun::new(
        load.clone(),
        Arc::new(KubeLoadTarget::new(client)),
        metrics.clone(),
        stop.clone(),
    )?;

    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        registry,
        run.journal().clone(),
    ));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));
    let watcher = tokio::spawn(watch_health(
        health_registry.clone(),
        metrics,
        stop.clone(),
    ));

    health_registry.mark_running().await;
    let outcome = run.run().await?;
    health_registry.mark_draining().await;
    watcher.abort();
    signals.abort();

    info!(
        reason = ?outcome.reason,
        created = outcome.created,
        deleted = outcome.deleted,
        "Load run complete"
    );
    println!("writes:\n{}", outcome.summary.writes);
    println!("reads:\n{}", outcome.summary.reads);

    if load.bucket.is_some() {
        warn!("No object store client in this process, outputs stay local");
    }
    let paths = load.output_paths();
    if let Err(e) = run.persist(&outcome.summary, &paths, None).await {
        health_registry
            .set_unhealthy(components::PERSISTENCE, e.to_string())
            .await;
        return Err(e).context("writing load run outputs");
    }

    api_handle.abort();
    info!("Shutting down");
    Ok(())
}

/// Mark a stream degraded while it fails more often than it succeeds
async fn watch_health(health: HealthRegistry, metrics: LoadMetrics, stop: StopSignal) {
    let mut interval = tokio::time::interval(HEALTH_CHECK_INTERVAL);
    loop {
        tokio::select! {
            _ = stop.stopped() => break,
            _ = interval.tick() => {
                for (name, (ok, failed)) in [
                    (components::WRITERS, metrics.write_totals()),
                    (components::READERS, metrics.read_totals()),
                ] {
                    if failed > ok {
                        health
                            .set_degraded(name, format!("{} of {} requests failed", failed, ok + failed))
                            .await;
                    } else if ok > 0 {
                        health.set_healthy(name).await;
                    }
                }
                let (ok, failed) = metrics.write_totals();
                let (read_ok, read_failed) = metrics.read_totals();
                if ok + read_ok == 0 && failed + read_failed > 0 {
                    health
                        .set_unhealthy(components::TARGET, "every request has failed")
                        .await;
                } else {
                    health.set_healthy(components::TARGET).await;
                }
            }
        }
    }
}
