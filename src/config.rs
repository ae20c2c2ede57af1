//! Engine and application configuration.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Tunables for the dispatcher, runner and recovery sweeper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of jobs processed concurrently.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Maximum processing attempts per job before it fails.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay between retry attempts, in seconds.
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,

    /// Idle poll interval of the dispatcher loop, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Age after which a processing job counts as stalled, in seconds.
    #[serde(default = "default_staleness_threshold_secs")]
    pub staleness_threshold_secs: u64,

    /// Interval between periodic recovery sweeps, in seconds. 0 disables
    /// periodic sweeps; the startup sweep always runs.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Days to keep completed/failed jobs before purging. 0 disables purging.
    #[serde(default = "default_purge_retention_days")]
    pub purge_retention_days: u32,
}

fn default_max_concurrent() -> usize {
    3
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay_secs() -> u64 {
    5
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_staleness_threshold_secs() -> u64 {
    300
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_purge_retention_days() -> u32 {
    30
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_attempts: default_max_attempts(),
            retry_delay_secs: default_retry_delay_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            staleness_threshold_secs: default_staleness_threshold_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            purge_retention_days: default_purge_retention_days(),
        }
    }
}

impl EngineConfig {
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_retry_delay_secs(mut self, secs: u64) -> Self {
        self.retry_delay_secs = secs;
        self
    }

    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_staleness_threshold_secs(mut self, secs: u64) -> Self {
        self.staleness_threshold_secs = secs;
        self
    }

    pub fn with_sweep_interval_secs(mut self, secs: u64) -> Self {
        self.sweep_interval_secs = secs;
        self
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(Error::config("max_concurrent must be at least 1"));
        }
        if self.max_attempts == 0 {
            return Err(Error::config("max_attempts must be at least 1"));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::config("poll_interval_ms must be at least 1"));
        }
        if self.staleness_threshold_secs == 0 {
            return Err(Error::config("staleness_threshold_secs must be at least 1"));
        }
        Ok(())
    }
}

/// Top-level application configuration, sourced from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub log_dir: String,
    /// oEmbed endpoint for video metadata lookup.
    pub oembed_endpoint: String,
    /// Chat completions endpoint for summary generation.
    pub summary_endpoint: String,
    pub summary_api_key: String,
    pub summary_model: String,
    pub engine: EngineConfig,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| Error::config(format!("invalid value for {key}: {raw:?}"))),
        Err(_) => Ok(None),
    }
}

impl AppConfig {
    /// Load configuration from `SNAPSUM_*` environment variables, falling
    /// back to defaults. `SNAPSUM_SUMMARY_API_KEY` is required.
    pub fn from_env() -> Result<Self> {
        let mut engine = EngineConfig::default();
        if let Some(v) = env_parse("SNAPSUM_MAX_CONCURRENT")? {
            engine.max_concurrent = v;
        }
        if let Some(v) = env_parse("SNAPSUM_MAX_ATTEMPTS")? {
            engine.max_attempts = v;
        }
        if let Some(v) = env_parse("SNAPSUM_RETRY_DELAY_SECS")? {
            engine.retry_delay_secs = v;
        }
        if let Some(v) = env_parse("SNAPSUM_POLL_INTERVAL_MS")? {
            engine.poll_interval_ms = v;
        }
        if let Some(v) = env_parse("SNAPSUM_STALENESS_THRESHOLD_SECS")? {
            engine.staleness_threshold_secs = v;
        }
        if let Some(v) = env_parse("SNAPSUM_SWEEP_INTERVAL_SECS")? {
            engine.sweep_interval_secs = v;
        }
        if let Some(v) = env_parse("SNAPSUM_PURGE_RETENTION_DAYS")? {
            engine.purge_retention_days = v;
        }
        engine.validate()?;

        let summary_api_key = std::env::var("SNAPSUM_SUMMARY_API_KEY")
            .map_err(|_| Error::config("SNAPSUM_SUMMARY_API_KEY is not set"))?;

        Ok(Self {
            database_url: env_or("SNAPSUM_DATABASE_URL", "sqlite:snapsum.db?mode=rwc"),
            log_dir: env_or("SNAPSUM_LOG_DIR", "logs"),
            oembed_endpoint: env_or(
                "SNAPSUM_OEMBED_ENDPOINT",
                "https://www.tiktok.com/oembed",
            ),
            summary_endpoint: env_or(
                "SNAPSUM_SUMMARY_ENDPOINT",
                "https://api.deepseek.com/chat/completions",
            ),
            summary_api_key,
            summary_model: env_or("SNAPSUM_SUMMARY_MODEL", "deepseek-chat"),
            engine,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrent, 3);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.retry_delay_secs, 5);
        assert_eq!(config.poll_interval_ms, 1000);
        assert_eq!(config.staleness_threshold_secs, 300);
    }

    #[test]
    fn test_engine_validate() {
        assert!(EngineConfig::default().validate().is_ok());
        assert!(
            EngineConfig::default()
                .with_max_concurrent(0)
                .validate()
                .is_err()
        );
        assert!(
            EngineConfig::default()
                .with_max_attempts(0)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_engine_deserialize_partial() {
        let config: EngineConfig = serde_json::from_str(r#"{"max_concurrent": 5}"#).unwrap();
        assert_eq!(config.max_concurrent, 5);
        assert_eq!(config.max_attempts, 3);
    }
}
