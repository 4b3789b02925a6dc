//! Configuration resolution for cdp-sink
//!
//! Every key resolves with ENV → TOML → compiled default priority. The TOML
//! file is optional; environment variables use the `CDP_` prefix.

use cdp_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{info, warn};

use crate::tasks::RetryPolicy;

/// Service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Data root folder; resolved separately when absent
    pub root_folder: Option<PathBuf>,
    /// SQLite file, relative paths are joined onto the root folder
    pub database_path: PathBuf,
    /// Queue messages processed concurrently
    pub max_concurrent_workers: usize,
    /// Failed attempts allowed before a result goes to ERROR
    pub max_stream_retries: i64,
    /// Linear backoff unit: attempt N waits N × unit
    pub retry_backoff_unit_secs: u64,
    pub delayed_sweep_interval_secs: u64,
    pub delayed_sweep_batch: i64,
    /// PROCESSING results untouched for this long are considered abandoned
    pub processing_timeout_secs: u64,
    /// Budget for retrying "database is locked" commits
    pub db_lock_max_wait_ms: u64,
    pub queue_capacity: usize,
    pub enrichment: EnrichmentConfig,
    pub arbitration: ArbitrationConfig,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            root_folder: None,
            database_path: PathBuf::from("cdp.db"),
            max_concurrent_workers: 4,
            max_stream_retries: 5,
            retry_backoff_unit_secs: 120,
            delayed_sweep_interval_secs: 60,
            delayed_sweep_batch: 10,
            processing_timeout_secs: 900,
            db_lock_max_wait_ms: 5000,
            queue_capacity: 1024,
            enrichment: EnrichmentConfig::default(),
            arbitration: ArbitrationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    pub enabled: bool,
    /// Scheduler tick, also the minimum age of a member's last enrichment attempt
    pub interval_secs: u64,
    pub batch_size: i64,
    pub member_timeout_secs: u64,
    pub retry: RetryPolicy,
    /// Platform whose profile handle drives cascade discard
    pub social_network_platform: String,
    pub requests_per_second: u32,
    /// How long a provider's remaining-credits answer is trusted
    pub credits_cache_secs: u64,
    pub lock_timeout_ms: u64,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 3600,
            batch_size: 50,
            member_timeout_secs: 300,
            retry: RetryPolicy::default(),
            social_network_platform: "linkedin".to_string(),
            requests_per_second: 5,
            credits_cache_secs: 60,
            lock_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbitrationConfig {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ArbitrationConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            timeout_secs: 60,
        }
    }
}

impl SinkConfig {
    /// Resolve configuration from an optional TOML file plus the environment
    pub fn resolve(toml_path: Option<&Path>) -> Result<Self> {
        let mut config = match toml_path {
            Some(path) if path.exists() => {
                info!(path = %path.display(), "Loading configuration file");
                cdp_common::config::load_toml::<SinkConfig>(path)?
            }
            Some(path) => {
                warn!(path = %path.display(), "Configuration file not found, using defaults");
                SinkConfig::default()
            }
            None => SinkConfig::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(v) = env_value::<PathBuf>("CDP_DATABASE_PATH")? {
            self.database_path = v;
        }
        if let Some(v) = env_value("CDP_MAX_CONCURRENT_WORKERS")? {
            self.max_concurrent_workers = v;
        }
        if let Some(v) = env_value("CDP_MAX_STREAM_RETRIES")? {
            self.max_stream_retries = v;
        }
        if let Some(v) = env_value("CDP_RETRY_BACKOFF_UNIT_SECS")? {
            self.retry_backoff_unit_secs = v;
        }
        if let Some(v) = env_value("CDP_DELAYED_SWEEP_INTERVAL_SECS")? {
            self.delayed_sweep_interval_secs = v;
        }
        if let Some(v) = env_value("CDP_PROCESSING_TIMEOUT_SECS")? {
            self.processing_timeout_secs = v;
        }
        if let Some(v) = env_value("CDP_DB_LOCK_MAX_WAIT_MS")? {
            self.db_lock_max_wait_ms = v;
        }
        if let Some(v) = env_value("CDP_ENRICHMENT_ENABLED")? {
            self.enrichment.enabled = v;
        }
        if let Some(v) = env_value("CDP_ENRICHMENT_INTERVAL_SECS")? {
            self.enrichment.interval_secs = v;
        }
        if let Some(v) = env_value::<String>("CDP_ARBITRATION_ENDPOINT")? {
            self.arbitration.endpoint = Some(v);
        }
        if let Some(v) = env_value::<String>("CDP_ARBITRATION_API_KEY")? {
            self.arbitration.api_key = Some(v);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.max_concurrent_workers == 0 {
            return Err(Error::Config("max_concurrent_workers must be at least 1".to_string()));
        }
        if self.max_stream_retries < 0 {
            return Err(Error::Config("max_stream_retries must not be negative".to_string()));
        }
        if self.enrichment.retry.maximum_attempts == 0 {
            return Err(Error::Config(
                "enrichment.retry.maximum_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Absolute database file location
    pub fn database_file(&self, root_folder: &Path) -> PathBuf {
        if self.database_path.is_absolute() {
            self.database_path.clone()
        } else {
            root_folder.join(&self.database_path)
        }
    }
}

/// Read and parse an environment variable; blank values count as unset
fn env_value<T: FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(|v| {
                info!(key = name, "Configuration value loaded from environment");
                Some(v)
            })
            .map_err(|e| Error::Config(format!("{}: {}", name, e))),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    #[serial]
    fn test_defaults_without_file() {
        std::env::remove_var("CDP_MAX_STREAM_RETRIES");
        let config = SinkConfig::resolve(None).unwrap();
        assert_eq!(config.max_stream_retries, 5);
        assert_eq!(config.retry_backoff_unit_secs, 120);
        assert_eq!(config.enrichment.social_network_platform, "linkedin");
    }

    #[test]
    #[serial]
    fn test_env_overrides_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cdp-sink.toml");
        std::fs::write(
            &path,
            "max_stream_retries = 2\nmax_concurrent_workers = 8\n[enrichment]\nenabled = true\n",
        )
        .unwrap();

        std::env::set_var("CDP_MAX_STREAM_RETRIES", "9");
        let config = SinkConfig::resolve(Some(&path)).unwrap();
        std::env::remove_var("CDP_MAX_STREAM_RETRIES");

        assert_eq!(config.max_stream_retries, 9);
        assert_eq!(config.max_concurrent_workers, 8);
        assert!(config.enrichment.enabled);
        assert_eq!(config.enrichment.retry.maximum_attempts, 4);
    }

    #[test]
    #[serial]
    fn test_invalid_env_value_is_config_error() {
        std::env::set_var("CDP_MAX_CONCURRENT_WORKERS", "many");
        let result = SinkConfig::resolve(None);
        std::env::remove_var("CDP_MAX_CONCURRENT_WORKERS");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_relative_database_path_joins_root() {
        let config = SinkConfig::default();
        assert_eq!(
            config.database_file(Path::new("/data")),
            PathBuf::from("/data/cdp.db")
        );
    }
}
