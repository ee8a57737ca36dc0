//! Output formatting utilities

use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

/// Print rows as a table, or the raw value as JSON
pub fn print_rows<T: Tabled, S: Serialize + ?Sized>(
    rows: Vec<T>,
    raw: &S,
    format: OutputFormat,
) -> anyhow::Result<()> {
    match format {
        OutputFormat::Table => {
            if rows.is_empty() {
                println!("{}", "No items found".yellow());
            } else {
                println!("{}", Table::new(rows).with(Style::rounded()));
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(raw)?),
    }
    Ok(())
}

pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

pub fn format_ms(ms: f64) -> String {
    if ms >= 1000.0 {
        format!("{:.2}s", ms / 1000.0)
    } else {
        format!("{:.3}ms", ms)
    }
}

pub fn format_rate(rate: f64) -> String {
    format!("{:.1}%", rate * 100.0)
}

/// Color a health or readiness word
pub fn color_status(status: &str) -> String {
    match status.to_lowercase().as_str() {
        "healthy" | "ready" | "true" => status.green().to_string(),
        "degraded" | "not-ready" => status.yellow().to_string(),
        "unhealthy" | "false" | "failed" => status.red().to_string(),
        _ => status.to_string(),
    }
}

/// Green at or above 99%, yellow above 90%, red otherwise
pub fn color_rate(rate: f64) -> String {
    let formatted = format_rate(rate);
    if rate >= 0.99 {
        formatted.green().to_string()
    } else if rate >= 0.9 {
        formatted.yellow().to_string()
    } else {
        formatted.red().to_string()
    }
}
