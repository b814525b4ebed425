//! Configuration for the signing pipeline.
//!
//! Configuration is loaded from `~/.config/signpipe/config.toml`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, ensure};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::queue::QUEUE_CAPACITY;
use crate::signer::{RetryPolicy, SignerConfig};

/// Tuning for one signing pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Capacity of every queue between stages.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Per-item sub-tasks a stage may run at once.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Concurrent md5 calls allowed through the gate.
    #[serde(default = "default_md5_permits")]
    pub md5_permits: usize,

    /// Simulated backend.
    #[serde(default)]
    pub signer: SignerConfig,

    /// Retries around every signer call.
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_queue_capacity() -> usize {
    QUEUE_CAPACITY
}

fn default_max_in_flight() -> usize {
    100
}

fn default_md5_permits() -> usize {
    1
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            max_in_flight: default_max_in_flight(),
            md5_permits: default_md5_permits(),
            signer: SignerConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl PipelineConfig {
    /// Defaults with no simulated signer latency.
    pub fn instant() -> Self {
        Self {
            signer: SignerConfig::instant(),
            ..Self::default()
        }
    }

    /// Load configuration from the default path.
    ///
    /// If the config file doesn't exist, returns default configuration.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            tracing::debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config in {}", path.display()))?;
        Ok(config)
    }

    /// Get the default config file path.
    pub fn config_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("", "", "signpipe")
            .context("Could not determine config directory")?;

        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Reject settings that would stall every run.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.queue_capacity > 0, "queue_capacity must be at least 1");
        ensure!(self.max_in_flight > 0, "max_in_flight must be at least 1");
        ensure!(self.md5_permits > 0, "md5_permits must be at least 1");
        ensure!(self.retry.max_attempts > 0, "retry.max_attempts must be at least 1");
        Ok(())
    }
}
