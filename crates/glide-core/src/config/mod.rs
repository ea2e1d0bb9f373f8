//! Configuration parsing and management.
//!
//! This module handles parsing of orchestrator configuration files (TOML)
//! that define session timing, tariffs, retry policy, and pricing defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GlideConfig {
    /// Session timing and approval settings.
    #[serde(default)]
    pub session: SessionConfig,

    /// Token tariff per billable event.
    #[serde(default)]
    pub tariff: TariffConfig,

    /// Retry policy for metering gateway calls.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Pricing defaults applied when a session does not override them.
    #[serde(default)]
    pub pricing: PricingConfig,
}

impl GlideConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the
    /// parsed values fail validation.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or validation fails.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Validate cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] on the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.approval_threshold == 0 {
            return Err(ConfigError::Validation(
                "session.approval_threshold must be at least 1 token".to_string(),
            ));
        }
        if self.session.meter_interval.is_zero() {
            return Err(ConfigError::Validation(
                "session.meter_interval must be non-zero".to_string(),
            ));
        }
        if self.session.approval_wait.is_zero() {
            return Err(ConfigError::Validation(
                "session.approval_wait must be non-zero".to_string(),
            ));
        }
        if self.session.max_active_sessions == 0 {
            return Err(ConfigError::Validation(
                "session.max_active_sessions must be at least 1".to_string(),
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(ConfigError::Validation(
                "retry.multiplier must be at least 1.0".to_string(),
            ));
        }
        if self.retry.initial_delay.is_zero() {
            return Err(ConfigError::Validation(
                "retry.initial_delay must be non-zero".to_string(),
            ));
        }
        if self.pricing.currency.is_empty() {
            return Err(ConfigError::Validation(
                "pricing.currency must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Session timing and approval settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Token total at which consumption approval is required.
    #[serde(default = "default_approval_threshold")]
    pub approval_threshold: u64,

    /// Interval between time-based meter charges while a session runs.
    #[serde(default = "default_meter_interval")]
    #[serde(with = "humantime_serde")]
    pub meter_interval: Duration,

    /// How long a blocked session waits for approval before timing out.
    #[serde(default = "default_approval_wait")]
    #[serde(with = "humantime_serde")]
    pub approval_wait: Duration,

    /// Upper bound on concurrently active (non-terminal) sessions.
    #[serde(default = "default_max_active_sessions")]
    pub max_active_sessions: usize,
}

const fn default_approval_threshold() -> u64 {
    70
}

const fn default_meter_interval() -> Duration {
    Duration::from_secs(15)
}

const fn default_approval_wait() -> Duration {
    Duration::from_secs(60)
}

const fn default_max_active_sessions() -> usize {
    32
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            approval_threshold: default_approval_threshold(),
            meter_interval: default_meter_interval(),
            approval_wait: default_approval_wait(),
            max_active_sessions: default_max_active_sessions(),
        }
    }
}

/// Token tariff: how many tokens each billable event consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TariffConfig {
    /// Tokens consumed by the one-time unlock charge.
    #[serde(default = "default_unlock_tokens")]
    pub unlock_tokens: u64,

    /// Tokens consumed by each elapsed-time meter charge.
    #[serde(default = "default_time_tokens")]
    pub time_tokens: u64,

    /// Tokens consumed by each distance increment charge.
    #[serde(default = "default_distance_tokens")]
    pub distance_tokens: u64,

    /// Feet of travel reported by one distance signal.
    #[serde(default = "default_feet_per_increment")]
    pub feet_per_increment: u64,
}

const fn default_unlock_tokens() -> u64 {
    10
}

const fn default_time_tokens() -> u64 {
    2
}

const fn default_distance_tokens() -> u64 {
    5
}

const fn default_feet_per_increment() -> u64 {
    100
}

impl Default for TariffConfig {
    fn default() -> Self {
        Self {
            unlock_tokens: default_unlock_tokens(),
            time_tokens: default_time_tokens(),
            distance_tokens: default_distance_tokens(),
            feet_per_increment: default_feet_per_increment(),
        }
    }
}

/// Retry policy applied uniformly to every metering gateway call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delay before the first retry.
    #[serde(default = "default_initial_delay")]
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Ceiling on the backoff delay.
    #[serde(default = "default_max_delay")]
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Multiplier for each retry (default: 2.0).
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Attempt budget. `None` retries transient failures indefinitely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,

    /// Timeout applied to each individual call attempt.
    #[serde(default = "default_call_timeout")]
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,
}

const fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

const fn default_max_delay() -> Duration {
    Duration::from_secs(100)
}

const fn default_multiplier() -> f64 {
    2.0
}

const fn default_call_timeout() -> Duration {
    Duration::from_secs(60)
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            multiplier: default_multiplier(),
            max_attempts: None,
            call_timeout: default_call_timeout(),
        }
    }
}

impl RetryConfig {
    /// Calculate the backoff delay for a given attempt number (1-based).
    /// Saturates at `max_delay`; an unbounded budget reaches attempt
    /// numbers whose uncapped delay no longer fits in a `Duration`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay_secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(delay_secs)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether another attempt is allowed after `attempts` have failed.
    #[must_use]
    pub fn allows_attempt(&self, attempts: u32) -> bool {
        self.max_attempts.is_none_or(|budget| attempts < budget)
    }
}

/// Pricing defaults applied when a session does not override them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Price in currency minor units per 1000 tokens.
    #[serde(default = "default_price_per_thousand")]
    pub price_per_thousand: u64,

    /// ISO currency code for the amount due.
    #[serde(default = "default_currency")]
    pub currency: String,
}

const fn default_price_per_thousand() -> u64 {
    25
}

fn default_currency() -> String {
    "USD".to_string()
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            price_per_thousand: default_price_per_thousand(),
            currency: default_currency(),
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}


mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
