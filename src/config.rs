//! Configuration management for tokenwarden.

use clap::ValueEnum;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, WardenError};
use crate::ratelimit::{LimitSpec, LimitTable};
use crate::store::RetryPolicy;

/// Prefix for environment overrides, e.g. `TOKENWARDEN__STORE__URL`.
pub const ENV_PREFIX: &str = "TOKENWARDEN";

/// Main configuration for the tokenwarden service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Shared store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Limit overrides, merged over the built-in limit types
    #[serde(default)]
    pub limits: HashMap<String, LimitSpec>,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 8080))
}

/// Which [`SharedStore`](crate::store::SharedStore) implementation to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store; buckets are not shared between processes
    #[default]
    Memory,
    /// Redis or a protocol-compatible server
    Redis,
}

/// Shared store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Connection URL for the redis backend
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Retries after a failed connection attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Cap on the delay between retries in milliseconds
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,

    /// Deadline for a single store command in milliseconds
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// How often the memory backend drops expired buckets
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: default_store_url(),
            max_retries: default_max_retries(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_retry_delay_ms() -> u64 {
    2000
}

fn default_command_timeout_ms() -> u64 {
    1000
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl StoreConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            max_delay: Duration::from_millis(self.max_retry_delay_ms),
            command_timeout: Duration::from_millis(self.command_timeout_ms),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,

    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ServiceConfig {
    /// Load configuration from an optional YAML file plus environment
    /// overrides. Missing settings fall back to their defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml).required(true));
        }

        let config: ServiceConfig = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: ServiceConfig = serde_yaml::from_str(yaml)
            .map_err(|e| WardenError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the service misbehave at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.store.backend == StoreBackend::Redis && self.store.url.trim().is_empty() {
            return Err(WardenError::Config(
                "store.url is required for the redis backend".to_string(),
            ));
        }
        if self.store.command_timeout_ms == 0 {
            return Err(WardenError::Config(
                "store.command_timeout_ms must be positive".to_string(),
            ));
        }
        self.limit_table().map(|_| ())
    }

    /// Built-in limits with the configured overrides applied.
    ///
    /// Limit type names are upper-cased: environment sources fold keys to
    /// lower case.
    pub fn limit_table(&self) -> Result<LimitTable> {
        let specs = self
            .limits
            .iter()
            .map(|(name, spec)| (name.to_ascii_uppercase(), spec.clone()))
            .collect();
        LimitTable::from_specs(specs)
    }
}
