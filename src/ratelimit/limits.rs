//! Limit types and their token bucket parameters.
//!
//! The limit table maps a limit type name (e.g. `GENERAL_IP`) to the bucket
//! configuration applied to identifiers checked under that name. The table is
//! assembled once at startup from the built-in limits plus any overrides from
//! configuration, and is read-only afterwards.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use super::bucket::{self, MAX_REFILL_SECONDS};
use crate::error::{Result, WardenError};

/// Token bucket parameters for one limit type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Namespace prepended to identifiers to build store keys
    pub key_prefix: String,
    /// Maximum number of tokens (burst size)
    pub capacity: f64,
    /// Tokens added per second
    pub refill_rate: f64,
    /// Nominal window the limit is expressed over
    pub window_seconds: u64,
}

impl RateLimitConfig {
    /// Create a limit of `capacity` tokens that fully refills over `window_seconds`.
    pub fn new(key_prefix: impl Into<String>, capacity: f64, window_seconds: u64) -> Self {
        Self {
            key_prefix: key_prefix.into(),
            capacity,
            refill_rate: capacity / window_seconds as f64,
            window_seconds,
        }
    }

    /// Override the refill rate (tokens per second).
    pub fn with_refill_rate(mut self, refill_rate: f64) -> Self {
        self.refill_rate = refill_rate;
        self
    }

    /// Check the bucket invariants (`capacity > 0`, `refill_rate > 0`).
    pub fn validate(&self, name: &str) -> Result<()> {
        if self.key_prefix.is_empty() {
            return Err(WardenError::Config(format!(
                "limit {}: key_prefix must not be empty",
                name
            )));
        }
        if !(self.capacity.is_finite() && self.capacity > 0.0) {
            return Err(WardenError::Config(format!(
                "limit {}: capacity must be positive, got {}",
                name, self.capacity
            )));
        }
        if !(self.refill_rate.is_finite() && self.refill_rate > 0.0) {
            return Err(WardenError::Config(format!(
                "limit {}: refill_rate must be positive, got {}",
                name, self.refill_rate
            )));
        }
        if self.expiry_seconds() > MAX_REFILL_SECONDS * 2 {
            return Err(WardenError::Config(format!(
                "limit {}: a full refill must take at most {} seconds",
                name, MAX_REFILL_SECONDS
            )));
        }
        Ok(())
    }

    /// Store key for an identifier under this limit.
    pub fn key_for(&self, identifier: &str) -> String {
        format!("{}:{}", self.key_prefix, identifier)
    }

    /// Idle time after which a bucket key expires: twice the full-refill time.
    pub fn expiry_seconds(&self) -> u64 {
        bucket::expiry_seconds(self.capacity, self.refill_rate)
    }
}

/// The built-in limit types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitType {
    /// Per-IP limit for general traffic
    GeneralIp,
    /// Per-identifier limit for sensitive actions such as sign-in
    SensitiveIdentifier,
    /// Limit for expensive API endpoints
    ApiHeavyEndpoint,
}

impl LimitType {
    pub const ALL: [LimitType; 3] = [
        LimitType::GeneralIp,
        LimitType::SensitiveIdentifier,
        LimitType::ApiHeavyEndpoint,
    ];

    /// The configuration name of this limit type.
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitType::GeneralIp => "GENERAL_IP",
            LimitType::SensitiveIdentifier => "SENSITIVE_IDENTIFIER",
            LimitType::ApiHeavyEndpoint => "API_HEAVY_ENDPOINT",
        }
    }

    /// Default bucket parameters for this limit type.
    pub fn default_config(&self) -> RateLimitConfig {
        match self {
            LimitType::GeneralIp => RateLimitConfig::new("rl:ip", 100.0, 60),
            LimitType::SensitiveIdentifier => RateLimitConfig::new("rl:id", 5.0, 5 * 60),
            LimitType::ApiHeavyEndpoint => RateLimitConfig::new("rl:api_heavy", 20.0, 60),
        }
    }
}

impl fmt::Display for LimitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LimitType {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self> {
        LimitType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| WardenError::Config(format!("unknown limit type: {}", s)))
    }
}

impl AsRef<str> for LimitType {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

/// A limit as written in configuration files.
///
/// `refill_rate` may be omitted, in which case the bucket refills fully over
/// `window_seconds`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitSpec {
    pub key_prefix: String,
    pub capacity: f64,
    #[serde(default)]
    pub refill_rate: Option<f64>,
    #[serde(default)]
    pub window_seconds: Option<u64>,
}

impl LimitSpec {
    fn into_config(self, name: &str) -> Result<RateLimitConfig> {
        let window_seconds = match (self.window_seconds, self.refill_rate) {
            (Some(window), _) => window,
            (None, Some(rate)) if rate > 0.0 => (self.capacity / rate).ceil() as u64,
            _ => {
                return Err(WardenError::Config(format!(
                    "limit {}: one of refill_rate or window_seconds is required",
                    name
                )))
            }
        };
        if window_seconds == 0 && self.refill_rate.is_none() {
            return Err(WardenError::Config(format!(
                "limit {}: window_seconds must be positive",
                name
            )));
        }

        let mut config = RateLimitConfig::new(self.key_prefix, self.capacity, window_seconds);
        if let Some(rate) = self.refill_rate {
            config = config.with_refill_rate(rate);
        }
        config.validate(name)?;
        Ok(config)
    }
}

/// Immutable mapping from limit type name to bucket configuration.
#[derive(Debug, Clone, Default)]
pub struct LimitTable {
    limits: HashMap<String, RateLimitConfig>,
}

impl LimitTable {
    /// A table holding only the built-in limit types.
    pub fn builtin() -> Self {
        let limits = LimitType::ALL
            .into_iter()
            .map(|t| (t.as_str().to_string(), t.default_config()))
            .collect();
        Self { limits }
    }

    /// Built-in limits with `specs` merged over them.
    pub fn from_specs(specs: HashMap<String, LimitSpec>) -> Result<Self> {
        let mut table = Self::builtin();
        for (name, spec) in specs {
            let config = spec.into_config(&name)?;
            table.limits.insert(name, config);
        }
        Ok(table)
    }

    /// Load limit overrides from a YAML mapping of name to [`LimitSpec`].
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let specs: HashMap<String, LimitSpec> = serde_yaml::from_str(yaml)
            .map_err(|e| WardenError::Config(format!("Failed to parse limit table: {}", e)))?;
        Self::from_specs(specs)
    }

    /// Add or replace a limit, validating it first.
    pub fn with_limit(mut self, name: impl Into<String>, config: RateLimitConfig) -> Result<Self> {
        let name = name.into();
        config.validate(&name)?;
        self.limits.insert(name, config);
        Ok(self)
    }

    /// Look up the configuration for a limit type name.
    pub fn get(&self, name: &str) -> Option<&RateLimitConfig> {
        self.limits.get(name)
    }

    /// Whether `name` is a known limit type.
    pub fn contains(&self, name: &str) -> bool {
        self.limits.contains_key(name)
    }

    /// Sorted names of every configured limit type.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.limits.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.limits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limits.is_empty()
    }
}
