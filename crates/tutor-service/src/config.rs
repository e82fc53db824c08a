//! Service configuration loaded from TOML
//!
//! Every field has a default, so an empty file is a valid configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tutor_core::{MemoryStore, ResourceStore, RetryPolicy};

/// Full service configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Persistence settings
    pub store: StoreConfig,
    /// Assignment scheduling settings
    pub scheduler: SchedulerConfig,
    /// Conflict retry policy
    pub retry: RetryPolicy,
    /// Log output settings
    pub logging: LoggingConfig,
}

/// Persistence settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Journal file; the store is memory-only when unset
    pub journal_path: Option<PathBuf>,
    /// fsync after every journal append
    pub sync_writes: bool,
}

/// Assignment scheduling settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Untrained demonstration steps that make a session eligible
    pub training_threshold_demo_steps: u64,
    /// Lease granted on claim and on every progress report
    pub lease_duration_ms: u64,
    /// How long a claim waits for work before returning nothing
    pub claim_timeout_ms: u64,
    /// Period of the background reclamation pass
    pub reap_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            training_threshold_demo_steps: 100,
            lease_duration_ms: 60_000,
            claim_timeout_ms: 5_000,
            reap_interval_ms: 10_000,
        }
    }
}

impl SchedulerConfig {
    /// Lease length in microseconds
    #[must_use]
    pub fn lease_micros(&self) -> u64 {
        self.lease_duration_ms.saturating_mul(1_000)
    }

    /// Claim wait as a duration
    #[must_use]
    pub fn claim_timeout(&self) -> Duration {
        Duration::from_millis(self.claim_timeout_ms)
    }

    /// Reclamation period as a duration
    #[must_use]
    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }
}

/// Log output settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `TUTOR_LOG` overrides it
    pub filter: String,
    /// Colored output
    pub ansi: bool,
    /// Include the module target in each line
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            ansi: true,
            with_target: false,
        }
    }
}

impl ServiceConfig {
    /// Load and validate a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Parse and validate configuration text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the scheduler cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.lease_duration_ms == 0 {
            bail!("scheduler.lease_duration_ms must be positive");
        }
        if self.scheduler.training_threshold_demo_steps == 0 {
            bail!("scheduler.training_threshold_demo_steps must be positive");
        }
        if self.scheduler.reap_interval_ms == 0 {
            bail!("scheduler.reap_interval_ms must be positive");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be positive");
        }
        Ok(())
    }

    /// Open the store this configuration describes
    pub async fn open_store(&self) -> Result<Arc<dyn ResourceStore>> {
        match &self.store.journal_path {
            Some(path) => {
                let store = MemoryStore::open(path, self.store.sync_writes)
                    .await
                    .with_context(|| format!("Failed to open journal {}", path.display()))?;
                Ok(Arc::new(store))
            }
            None => Ok(Arc::new(MemoryStore::new())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = ServiceConfig::from_toml_str("").unwrap();
        assert_eq!(config, ServiceConfig::default());
        assert_eq!(config.scheduler.lease_micros(), 60_000_000);
    }

    #[test]
    fn test_partial_sections() {
        let config = ServiceConfig::from_toml_str(
            r#"
            [store]
            journal_path = "/tmp/tutor.journal"

            [scheduler]
            training_threshold_demo_steps = 3
            lease_duration_ms = 250

            [retry]
            max_attempts = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.scheduler.training_threshold_demo_steps, 3);
        assert_eq!(config.scheduler.claim_timeout_ms, 5_000);
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.retry.max_delay_ms, RetryPolicy::default().max_delay_ms);
        assert_eq!(
            config.store.journal_path.as_deref(),
            Some(Path::new("/tmp/tutor.journal"))
        );
    }

    #[test]
    fn test_zero_lease_is_rejected() {
        let err = ServiceConfig::from_toml_str("[scheduler]\nlease_duration_ms = 0\n").unwrap_err();
        assert!(err.to_string().contains("lease_duration_ms"));
    }
}
