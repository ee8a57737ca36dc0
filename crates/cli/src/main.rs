//! Operator tooling for cluster test runs
//!
//! Renders artefacts from a run document, summarizes load journals,
//! checks node readiness and queries a running load generator.

mod client;
mod commands;
mod output;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{load, nodes, render};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "ekstest")]
#[command(author, version, about = "Operator tooling for EKS cluster test runs", long_about = None)]
pub struct Cli {
    /// Load generator endpoint
    #[arg(long, env = "EKSTEST_LOADGEN_URL", default_value = "http://localhost:8080")]
    pub loadgen_url: String,

    /// Kubeconfig for live commands; default client config when unset
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    /// Debug logging on stderr
    #[arg(long, short)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Render the kubeconfig of a run
    Kubeconfig {
        /// Run document
        document: PathBuf,

        /// Write here (mode 0666) instead of printing
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Render the user data unmanaged nodes of a run boot with
    Userdata {
        /// Run document
        document: PathBuf,

        /// Override the run's user data format
        #[arg(long = "user-data-format", value_enum)]
        user_data_format: Option<render::UserDataKind>,
    },

    /// Show the subnet CIDRs the VPC block is split into
    Subnets {
        /// Number of subnets
        #[arg(default_value_t = 4)]
        count: usize,
    },

    /// Summarize request journals of a finished load run
    Summarize {
        /// Write journal (NDJSON)
        writes: PathBuf,

        /// Read journal (NDJSON)
        reads: Option<PathBuf>,
    },

    /// List nodes and check readiness
    Nodes {
        /// Fail unless at least this many nodes are Ready
        #[arg(long)]
        expected: Option<usize>,

        /// Wait up to this many seconds for the expected nodes
        #[arg(long, requires = "expected")]
        wait: Option<u64>,
    },

    /// Query a running load generator
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with(fmt::layer().compact().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Commands::Kubeconfig { document, output } => {
            render::kubeconfig(&document, output.as_deref())?;
        }
        Commands::Userdata {
            document,
            user_data_format,
        } => {
            render::userdata(&document, user_data_format)?;
        }
        Commands::Subnets { count } => {
            render::subnets(count, cli.format)?;
        }
        Commands::Summarize { writes, reads } => {
            load::summarize(&writes, reads.as_deref(), cli.format)?;
        }
        Commands::Nodes { expected, wait } => {
            nodes::nodes(cli.kubeconfig.as_deref(), expected, wait, cli.format).await?;
        }
        Commands::Status => {
            let client = client::LoadgenClient::new(&cli.loadgen_url)?;
            load::status(&client, cli.format).await?;
        }
    }

    Ok(())
}
