//! Engine configuration
//!
//! Loaded from `bigmodel.toml`:
//!
//! ```toml
//! [database]
//! path = "bigmodel.db"
//!
//! [pools.glm]
//! short = ["http://10.0.0.1:8080/stream", "http://10.0.0.2:8080/stream"]
//! long = ["http://10.0.1.1:8080/stream"]
//! long_input_threshold = 1000
//!
//! [pools.text_to_image]
//! short = ["http://10.0.2.1:8080/draw"]
//! quarantine = { failure_threshold = 3, cooldown_secs = 30 }
//!
//! [relay]
//! skip_step = 5
//! ```

use crate::events::{SubscribeOptions, TopicConfig};
use crate::executor::{EndpointPool, PoolRouter, QuarantineConfig, RelayConfig, RetryConfig};
use bigmodel_providers::{TaskType, TransportConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Database configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database file path, or `:memory:`
    #[serde(default = "default_database_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

fn default_database_path() -> String {
    "bigmodel.db".to_string()
}

/// Endpoints serving one task type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolRouteConfig {
    /// Endpoints for ordinary inputs
    #[serde(default)]
    pub short: Vec<String>,

    /// Endpoints for long inputs; falls back to `short` when empty
    #[serde(default)]
    pub long: Vec<String>,

    /// Inputs longer than this many characters use `long`
    #[serde(default = "default_long_input_threshold")]
    pub long_input_threshold: usize,

    /// Wait per acquire attempt, in milliseconds
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    #[serde(default)]
    pub quarantine: Option<QuarantineConfig>,
}

impl Default for PoolRouteConfig {
    fn default() -> Self {
        Self {
            short: Vec::new(),
            long: Vec::new(),
            long_input_threshold: default_long_input_threshold(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            quarantine: None,
        }
    }
}

fn default_long_input_threshold() -> usize {
    1000
}

fn default_acquire_timeout_ms() -> u64 {
    1000
}

impl PoolRouteConfig {
    /// Build the pools for `task_type`.
    pub fn build_router(&self, task_type: TaskType) -> PoolRouter {
        let short = self.build_pool(format!("{}-short", task_type), &self.short);
        if self.long.is_empty() {
            PoolRouter::single(short)
        } else {
            let long = self.build_pool(format!("{}-long", task_type), &self.long);
            PoolRouter::split(short, long, self.long_input_threshold)
        }
    }

    fn build_pool(&self, name: String, addresses: &[String]) -> EndpointPool {
        let pool = EndpointPool::new(name, addresses.iter().cloned())
            .with_acquire_timeout(Duration::from_millis(self.acquire_timeout_ms));
        match self.quarantine {
            Some(quarantine) => pool.with_quarantine(quarantine),
            None => pool,
        }
    }
}

/// Relay settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Tokens between moderation checks
    pub skip_step: usize,
    /// Pause between acquire attempts, in milliseconds
    pub wait_interval_ms: u64,
    /// Acquire attempts before giving up
    pub wait_attempts: u32,
    /// Upper bound on one relay, in seconds
    pub dispatch_timeout_secs: Option<u64>,
    /// Events buffered between relay worker and dispatcher
    pub buffer_size: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            skip_step: 5,
            wait_interval_ms: 500,
            wait_attempts: 3,
            dispatch_timeout_secs: Some(600),
            buffer_size: 64,
        }
    }
}

/// Start-event consumer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerSettings {
    pub max_attempts: u32,
    pub interval_ms: u64,
    /// Dispatches running at once
    pub concurrency: usize,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            interval_ms: 1000,
            concurrency: 8,
        }
    }
}

impl ConsumerSettings {
    pub fn subscribe_options(&self) -> SubscribeOptions {
        SubscribeOptions {
            retry: RetryConfig::fixed(Duration::from_millis(self.interval_ms), self.max_attempts),
            concurrency: self.concurrency,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModerationSettings {
    /// Phrases that block generated output
    pub blocked_words: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageSettings {
    /// Accepted text-to-image styles; empty accepts any
    pub styles: Vec<String>,
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Keyed by task type name (`glm`, `llama`, `text_to_image`)
    #[serde(default)]
    pub pools: BTreeMap<String, PoolRouteConfig>,
    #[serde(default)]
    pub relay: RelaySettings,
    #[serde(default)]
    pub consumer: ConsumerSettings,
    #[serde(default)]
    pub topics: TopicConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub moderation: ModerationSettings,
    #[serde(default)]
    pub image: ImageSettings,
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load configuration from the default location, apply environment
    /// overrides, and validate.
    ///
    /// Searches for config in:
    /// 1. `BIGMODEL_CONFIG` environment variable
    /// 2. ./config/bigmodel.toml
    /// 3. ./bigmodel.toml
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("BIGMODEL_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => {
                let paths = [
                    PathBuf::from("config/bigmodel.toml"),
                    PathBuf::from("./bigmodel.toml"),
                ];
                match paths.iter().find(|p| p.exists()) {
                    Some(path) => Self::from_file(path)?,
                    None => {
                        tracing::warn!("No bigmodel.toml found, using defaults");
                        Self::default()
                    }
                }
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `BIGMODEL_*` overrides looked up through `lookup`.
    ///
    /// - `BIGMODEL_DATABASE_PATH`
    /// - `BIGMODEL_SKIP_STEP`
    /// - `BIGMODEL_DISPATCH_TIMEOUT_SECS`
    /// - `BIGMODEL_<TASK_TYPE>_SHORT_ENDPOINTS`, `BIGMODEL_<TASK_TYPE>_LONG_ENDPOINTS`
    ///   (comma separated, e.g. `BIGMODEL_GLM_SHORT_ENDPOINTS`)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("BIGMODEL_DATABASE_PATH") {
            self.database.path = path;
        }
        if let Some(step) = lookup("BIGMODEL_SKIP_STEP") {
            self.relay.skip_step = parse_override("BIGMODEL_SKIP_STEP", &step)?;
        }
        if let Some(secs) = lookup("BIGMODEL_DISPATCH_TIMEOUT_SECS") {
            self.relay.dispatch_timeout_secs =
                Some(parse_override("BIGMODEL_DISPATCH_TIMEOUT_SECS", &secs)?);
        }

        for task_type in TaskType::ALL {
            let prefix = format!("BIGMODEL_{}", task_type.as_str().to_uppercase());
            let short = lookup(&format!("{}_SHORT_ENDPOINTS", prefix));
            let long = lookup(&format!("{}_LONG_ENDPOINTS", prefix));
            if short.is_none() && long.is_none() {
                continue;
            }

            let route = self.pools.entry(task_type.as_str().to_string()).or_default();
            if let Some(short) = short {
                route.short = split_endpoints(&short);
            }
            if let Some(long) = long {
                route.long = split_endpoints(&long);
            }
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.path.trim().is_empty() {
            return Err(ConfigError::InvalidConfig("database.path is empty".to_string()));
        }
        if self.relay.skip_step == 0 {
            return Err(ConfigError::InvalidConfig(
                "relay.skip_step must be at least 1".to_string(),
            ));
        }
        if self.relay.wait_attempts == 0 {
            return Err(ConfigError::InvalidConfig(
                "relay.wait_attempts must be at least 1".to_string(),
            ));
        }
        if self.consumer.max_attempts == 0 || self.consumer.concurrency == 0 {
            return Err(ConfigError::InvalidConfig(
                "consumer.max_attempts and consumer.concurrency must be at least 1".to_string(),
            ));
        }

        for (name, route) in &self.pools {
            name.parse::<TaskType>()
                .map_err(|e| ConfigError::InvalidConfig(format!("pools.{}: {}", name, e)))?;
            if route.short.is_empty() {
                return Err(ConfigError::InvalidConfig(format!(
                    "pools.{}.short must list at least one endpoint",
                    name
                )));
            }
            if let Some(q) = route.quarantine {
                if q.failure_threshold == 0 {
                    return Err(ConfigError::InvalidConfig(format!(
                        "pools.{}.quarantine.failure_threshold must be at least 1",
                        name
                    )));
                }
            }
        }

        Ok(())
    }

    /// Routers for every configured task type.
    pub fn routers(&self) -> Result<Vec<(TaskType, PoolRouter)>, ConfigError> {
        self.pools
            .iter()
            .map(|(name, route)| {
                let task_type: TaskType = name
                    .parse()
                    .map_err(|e| ConfigError::InvalidConfig(format!("pools.{}: {}", name, e)))?;
                Ok((task_type, route.build_router(task_type)))
            })
            .collect()
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            skip_step: self.relay.skip_step,
            wait: RetryConfig::fixed(
                Duration::from_millis(self.relay.wait_interval_ms),
                self.relay.wait_attempts,
            ),
            deadline: self.relay.dispatch_timeout_secs.map(Duration::from_secs),
        }
    }
}

fn parse_override<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidConfig(format!("{} has invalid value {:?}", key, value)))
}

fn split_endpoints(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
