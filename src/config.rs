//! Job settings loaded from a TOML file.
//!
//! Every field has a default, so a partial file (or none at all) is valid.
//! Durations are stored as milliseconds to keep the file flat.

use crate::retry::RetryPolicy;
use crate::types::{DuplicatePolicy, NamingMode};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub pool_size: usize,
    pub attempt_budget: u32,
    pub chunk_size: usize,
    pub poll_interval_ms: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub skip_duplicates: bool,
    pub naming: NamingMode,
    pub duplicates: DuplicatePolicy,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            pool_size: 10,
            attempt_budget: 3,
            chunk_size: 64 * 1024,
            poll_interval_ms: 3_000,
            backoff_initial_ms: 500,
            backoff_max_ms: 8_000,
            skip_duplicates: false,
            naming: NamingMode::default(),
            duplicates: DuplicatePolicy::default(),
        }
    }
}

impl TransferConfig {
    /// Read `path`; a missing file yields the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self =
            toml::from_str(&data).with_context(|| format!("Invalid config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            bail!("pool_size must be at least 1");
        }
        if self.attempt_budget == 0 {
            bail!("attempt_budget must be at least 1");
        }
        if self.chunk_size == 0 {
            bail!("chunk_size must be at least 1 byte");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.attempt_budget,
            Duration::from_millis(self.backoff_initial_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_gives_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = TransferConfig::load(tmp.path().join("none.toml")).unwrap();
        assert_eq!(config, TransferConfig::default());
        assert_eq!(config.pool_size, 10);
        assert_eq!(config.poll_interval(), Duration::from_secs(3));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ferry.toml");
        std::fs::write(
            &path,
            "pool_size = 4\nnaming = \"by_remote_id\"\nduplicates = \"renumber\"\n",
        )
        .unwrap();
        let config = TransferConfig::load(&path).unwrap();
        assert_eq!(config.pool_size, 4);
        assert_eq!(config.naming, NamingMode::ByRemoteId);
        assert_eq!(config.duplicates, DuplicatePolicy::Renumber);
        assert_eq!(config.attempt_budget, 3);
        assert_eq!(config.retry_policy().max_attempts, 3);
    }

    #[test]
    fn zero_pool_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ferry.toml");
        std::fs::write(&path, "pool_size = 0\n").unwrap();
        assert!(TransferConfig::load(&path).is_err());

        let config = TransferConfig {
            attempt_budget: 0,
            ..TransferConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn garbage_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ferry.toml");
        std::fs::write(&path, "pool_size = \"many\"\n").unwrap();
        assert!(TransferConfig::load(&path).is_err());
    }
}
