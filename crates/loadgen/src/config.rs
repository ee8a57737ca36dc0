//! Load generator configuration

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use eksapi_lib::loadgen::LoadConfig;
use serde::Deserialize;

pub const ENV_PREFIX: &str = "LOADGEN";

/// Optional YAML file read before the environment
pub const CONFIG_FILE_ENV: &str = "LOADGEN_CONFIG_FILE";

#[derive(Debug, Clone, Deserialize)]
pub struct LoadgenConfig {
    /// Port for health, metrics and summary
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Kubeconfig for the target API server; in-cluster config when unset
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,

    #[serde(default)]
    pub load: LoadConfig,
}

fn default_api_port() -> u16 {
    8080
}

impl LoadgenConfig {
    /// Load from an optional file overlaid by `LOADGEN_*` variables
    ///
    /// Nested keys use `__`, e.g. `LOADGEN_LOAD__QPS=50`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml));
        }
        let config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .context("loading load generator configuration")?;
        let parsed: Self = config
            .try_deserialize()
            .context("parsing load generator configuration")?;
        parsed.load.validate()?;
        Ok(parsed)
    }

    pub fn from_env() -> Result<Self> {
        let path = std::env::var_os(CONFIG_FILE_ENV).map(PathBuf::from);
        Self::load(path.as_deref())
    }
}
