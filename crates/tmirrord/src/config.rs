//! Configuration file support for tmirrord
//!
//! Loads daemon settings from TOML. Default location: /etc/tmirror/tmirrord.toml
//!
//! ```toml
//! [daemon]
//! region = "us-east-1"
//! policy_dir = "/etc/tmirror/policies"
//! backfill_topic = "arn:aws:sns:us-east-1:123456789012:tmirror-backfill"
//!
//! [logging]
//! level = "info"
//! format = "json"
//!
//! [engine]
//! page_size = 200
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tmirror_engine::{EngineSettings, PolicyStore};

use crate::error::{DaemonError, Result};
use crate::logging::LogFormat;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/tmirror/tmirrord.toml";

/// Placement and identity settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonSection {
    /// Region used to select the policy document
    #[serde(default)]
    pub region: Option<String>,

    /// Directory holding `<region>.yaml` policy documents
    #[serde(default = "default_policy_dir")]
    pub policy_dir: PathBuf,

    /// Topic that re-invokes the backfill coordinator
    #[serde(default = "default_backfill_topic")]
    pub backfill_topic: String,
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Default filter when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

/// Complete tmirrord configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub daemon: DaemonSection,

    #[serde(default)]
    pub logging: LoggingSection,

    #[serde(default)]
    pub engine: EngineSettings,
}

fn default_policy_dir() -> PathBuf {
    PathBuf::from("config")
}

fn default_backfill_topic() -> String {
    "tmirror-backfill".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            region: None,
            policy_dir: default_policy_dir(),
            backfill_topic: default_backfill_topic(),
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| {
                DaemonError::Configuration(format!(
                    "Failed to parse config file {}: {}",
                    path.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                eprintln!("tmirrord: Config file {} not found, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(DaemonError::Io(e)),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.daemon.backfill_topic.trim().is_empty() {
            return Err(DaemonError::Configuration("backfill_topic cannot be empty".to_string()));
        }
        self.engine.validate()?;
        Ok(())
    }

    /// Picks the region: the command line, then the config file, then `AWS_REGION`.
    pub fn resolve_region(&self, cli: Option<&str>, aws_region: Option<String>) -> Result<String> {
        cli.map(str::to_string)
            .or_else(|| self.daemon.region.clone())
            .or(aws_region)
            .filter(|region| !region.trim().is_empty())
            .ok_or(DaemonError::MissingRegion)
    }

    /// Path of the policy document for `region`.
    pub fn policy_path(&self, region: &str) -> PathBuf {
        PolicyStore::policy_path(&self.daemon.policy_dir, region)
    }
}
