//! Load run summaries, offline and live

use std::path::Path;

use anyhow::{Context, Result};
use colored::Colorize;
use eksapi_lib::loadgen::{read_ndjson, RequestSummary, RunSummary};
use tabled::Tabled;

use crate::client::LoadgenClient;
use crate::output::{color_rate, color_status, format_ms, print_info, print_rows, OutputFormat};

#[derive(Tabled)]
struct SummaryRow {
    #[tabled(rename = "Stream")]
    stream: &'static str,
    #[tabled(rename = "Requests")]
    count: usize,
    #[tabled(rename = "Success")]
    success: String,
    #[tabled(rename = "Avg")]
    avg: String,
    #[tabled(rename = "p50")]
    p50: String,
    #[tabled(rename = "p90")]
    p90: String,
    #[tabled(rename = "p99")]
    p99: String,
    #[tabled(rename = "Max")]
    max: String,
    #[tabled(rename = "Req/s")]
    throughput: String,
}

fn row(stream: &'static str, s: &RequestSummary) -> SummaryRow {
    SummaryRow {
        stream,
        count: s.count,
        success: color_rate(s.success_rate()),
        avg: format_ms(s.avg_ms),
        p50: format_ms(s.p50_ms),
        p90: format_ms(s.p90_ms),
        p99: format_ms(s.p99_ms),
        max: format_ms(s.max_ms),
        throughput: format!("{:.1}", s.throughput),
    }
}

fn print_summary(summary: &RunSummary, format: OutputFormat) -> Result<()> {
    let rows = vec![row("writes", &summary.writes), row("reads", &summary.reads)];
    print_rows(rows, summary, format)
}

fn read_journal(path: &Path) -> Result<RequestSummary> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading journal {}", path.display()))?;
    let records = read_ndjson(&content)?;
    Ok(RequestSummary::from_records(&records))
}

/// Summarize journals written by a finished run
pub fn summarize(writes: &Path, reads: Option<&Path>, format: OutputFormat) -> Result<()> {
    let summary = RunSummary {
        writes: read_journal(writes)?,
        reads: match reads {
            Some(path) => read_journal(path)?,
            None => RequestSummary::default(),
        },
    };
    print_summary(&summary, format)
}

/// Health, readiness and live summary of a running load generator
pub async fn status(client: &LoadgenClient, format: OutputFormat) -> Result<()> {
    let health = client.health().await?;
    let readiness = client.readiness().await?;
    let summary = client.summary().await?;

    if format == OutputFormat::Json {
        let raw = serde_json::json!({
            "health": health,
            "readiness": readiness,
            "summary": summary,
        });
        println!("{}", serde_json::to_string_pretty(&raw)?);
        return Ok(());
    }

    println!("{}", "Load Generator".bold());
    println!("{}", "=".repeat(50));
    let status = serde_json::to_value(health.status)?;
    println!(
        "Health:     {}",
        color_status(status.as_str().unwrap_or_default())
    );
    let ready = if readiness.ready { "ready" } else { "not-ready" };
    match &readiness.reason {
        Some(reason) => println!("Readiness:  {} ({})", color_status(ready), reason),
        None => println!("Readiness:  {}", color_status(ready)),
    }
    let mut components: Vec<_> = health.components.iter().collect();
    components.sort_by(|a, b| a.0.cmp(b.0));
    for (name, component) in components {
        let status = serde_json::to_value(component.status)?;
        let word = status.as_str().unwrap_or_default();
        match &component.message {
            Some(message) => print_info(&format!("{}: {} ({})", name, color_status(word), message)),
            None => print_info(&format!("{}: {}", name, color_status(word))),
        }
    }
    println!();
    print_summary(&summary, format)
}
