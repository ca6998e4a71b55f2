//! Engine configuration
//!
//! Query deadlines, retry policy, journey cache bounds and analysis defaults.
//! Loaded from TOML with per-section defaults, then overridden from the environment.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// SQLite database holding the allocation log
    #[serde(default = "default_database_path")]
    pub database_path: String,

    #[serde(default)]
    pub query: QueryConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub flows: FlowConfig,

    #[serde(default)]
    pub stability: StabilityConfig,
}

fn default_database_path() -> String {
    "./rankflow.db".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            query: QueryConfig::default(),
            cache: CacheConfig::default(),
            flows: FlowConfig::default(),
            stability: StabilityConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("invalid engine config in {}", path.display()))?;
        Ok(config)
    }

    /// Load from `RANKFLOW_CONFIG_PATH` (or `rankflow.toml`), then apply env overrides.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let path =
            std::env::var("RANKFLOW_CONFIG_PATH").unwrap_or_else(|_| "rankflow.toml".to_string());

        let mut config = Self::load(&path).unwrap_or_else(|e| {
            tracing::debug!("Using default engine config ({}): {}", path, e);
            Self::default()
        });
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("RANKFLOW_DB_PATH") {
            if !v.trim().is_empty() {
                self.database_path = v;
            }
        }
        if let Some(ms) = env_parse::<u64>("RANKFLOW_QUERY_TIMEOUT_MS").filter(|&v| v > 0) {
            self.query.timeout_ms = ms;
        }
        if let Some(n) = env_parse::<u32>("RANKFLOW_QUERY_MAX_RETRIES") {
            self.query.max_retries = n;
        }
        if let Some(n) = env_parse::<usize>("RANKFLOW_CACHE_MAX_ENTRIES") {
            self.cache.max_entries = n;
        }
        if let Some(secs) = env_parse::<u64>("RANKFLOW_CACHE_TTL_SECS") {
            self.cache.ttl_secs = secs;
        }
    }
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Option<T> {
    std::env::var(var).ok().and_then(|v| v.trim().parse().ok())
}

/// Per-attempt deadline and retry/backoff for store queries
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub timeout_ms: u64,
    /// Retries after the first attempt; only retryable failures are retried
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            max_retries: 2,
            initial_backoff_ms: 100,
            max_backoff_ms: 2_000,
        }
    }
}

impl QueryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Journey memoisation. `max_entries = 0` disables the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            ttl_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Flows smaller than this are dropped unless the request overrides it
    pub default_min_flow_count: usize,
    /// Individual migrations attached to a flow report for drill-down
    pub sample_cap: usize,
    pub max_page_size: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            default_min_flow_count: 3,
            sample_cap: 50,
            max_page_size: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilityConfig {
    pub lookback_years: u16,
    pub from_round: u16,
    pub to_round: u16,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            lookback_years: 2,
            from_round: 1,
            to_round: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_section_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
            database_path = "/data/alloc.db"

            [query]
            timeout_ms = 250

            [flows]
            sample_cap = 10
            "#,
        )
        .expect("parse config");

        assert_eq!(config.database_path, "/data/alloc.db");
        assert_eq!(config.query.timeout_ms, 250);
        assert_eq!(config.query.max_retries, 2);
        assert_eq!(config.flows.sample_cap, 10);
        assert_eq!(config.flows.max_page_size, 500);
        assert_eq!(config.stability.lookback_years, 2);
        assert_eq!(config.cache.max_entries, 10_000);
    }

    #[test]
    fn test_empty_toml_is_default() {
        let config: EngineConfig = toml::from_str("").expect("parse empty config");
        assert_eq!(config.database_path, "./rankflow.db");
        assert_eq!(config.query.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_load_missing_file_errors() {
        assert!(EngineConfig::load("/nonexistent/rankflow.toml").is_err());
    }
}
