//! Lease worker configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{LeaseError, Result};
use crate::manager::ManagerSettings;
use crate::retry::RetryConfig;

/// File configuration for a lease worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Directory of the persistent lease database.
    pub data_dir: PathBuf,
    /// Longest a manager sleeps between expiry sweeps.
    pub max_sleep_secs: u64,
    /// How long the store may be unreachable before tokens stop validating.
    pub stale_after_secs: u64,
    /// Capacity of each manager's command queue.
    pub command_queue_capacity: usize,
    /// Interval between database checkpoints.
    pub checkpoint_interval_secs: u64,
    /// Back-off for conflicting transactions and failed refreshes.
    pub retry: RetryConfig,
    /// Model UUIDs served by this process.
    pub models: Vec<String>,
    /// UUID of the controller model, served in addition to `models`.
    pub controller_uuid: Option<String>,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/juju/lease"),
            max_sleep_secs: 60,
            stale_after_secs: 120,
            command_queue_capacity: 64,
            checkpoint_interval_secs: 300,
            retry: RetryConfig::default(),
            models: Vec::new(),
            controller_uuid: None,
        }
    }
}

impl LeaseConfig {
    /// Loads a config file, TOML or JSON by extension.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => Ok(toml::from_str(&contents)?),
            "json" => Ok(serde_json::from_str(&contents)?),
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Like [`LeaseConfig::from_file`], but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            return Self::from_file(path);
        }
        tracing::warn!(path = %path.display(), "config file not found, using defaults");
        Ok(Self::default())
    }

    /// Rejects settings the managers cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_sleep_secs == 0 {
            return Err(LeaseError::NotValid("max_sleep_secs must be positive".into()));
        }
        if self.command_queue_capacity == 0 {
            return Err(LeaseError::NotValid(
                "command_queue_capacity must be positive".into(),
            ));
        }
        if self.checkpoint_interval_secs == 0 {
            return Err(LeaseError::NotValid(
                "checkpoint_interval_secs must be positive".into(),
            ));
        }
        if Duration::from_secs(self.stale_after_secs)
            < Duration::from_millis(self.retry.initial_backoff_ms)
        {
            return Err(LeaseError::NotValid(format!(
                "stale_after_secs ({}) is shorter than the initial retry backoff ({} ms)",
                self.stale_after_secs, self.retry.initial_backoff_ms
            )));
        }
        for model in self.all_models() {
            if uuid::Uuid::parse_str(model).is_err() {
                return Err(LeaseError::NotValid(format!("model uuid {:?}", model)));
            }
        }
        Ok(())
    }

    /// Every model UUID to serve, the controller model first.
    pub fn all_models(&self) -> impl Iterator<Item = &str> {
        self.controller_uuid
            .iter()
            .chain(self.models.iter())
            .map(String::as_str)
    }

    /// Runtime settings for each lease manager.
    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            max_sleep: Duration::from_secs(self.max_sleep_secs),
            stale_after: Duration::from_secs(self.stale_after_secs),
            retry: self.retry.clone(),
            queue_capacity: self.command_queue_capacity,
        }
    }

    /// Interval between database checkpoints.
    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs)
    }
}
