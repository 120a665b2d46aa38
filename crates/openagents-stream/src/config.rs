use std::env;

use thiserror::Error;

use crate::event_log::DEFAULT_EVENT_LOG_CAPACITY;
use crate::lifecycle::{
    BackoffPolicy, DEFAULT_RECONNECT_BASE_MS, DEFAULT_RECONNECT_MAX_ATTEMPTS,
    DEFAULT_RECONNECT_MAX_MS,
};
use crate::metric_series::DEFAULT_METRIC_CAPACITY;
use crate::mitigation::{DEFAULT_MITIGATION_COOLDOWN_MS, DEFAULT_STEPS, MitigationConfig};

pub const EVENT_LOG_CAPACITY_KEY: &str = "OA_STREAM_EVENT_LOG_CAPACITY";
pub const METRIC_CAPACITY_KEY: &str = "OA_STREAM_METRIC_CAPACITY";
pub const RECONNECT_BASE_MS_KEY: &str = "OA_STREAM_RECONNECT_BASE_MS";
pub const RECONNECT_MAX_MS_KEY: &str = "OA_STREAM_RECONNECT_MAX_MS";
pub const RECONNECT_MAX_ATTEMPTS_KEY: &str = "OA_STREAM_RECONNECT_MAX_ATTEMPTS";
pub const MITIGATION_COOLDOWN_MS_KEY: &str = "OA_STREAM_MITIGATION_COOLDOWN_MS";
pub const INITIAL_STEPS_KEY: &str = "OA_STREAM_INITIAL_STEPS";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
    #[error("invalid {key}: must be greater than zero")]
    Zero { key: &'static str },
    #[error("invalid OA_STREAM_RECONNECT_MAX_MS: {max_ms} is below the base delay {base_ms}")]
    BackoffRange { base_ms: u64, max_ms: u64 },
}

/// Tunables for the live stream layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub event_log_capacity: usize,
    pub metric_capacity: usize,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub reconnect_max_attempts: u32,
    pub mitigation_cooldown_ms: u64,
    pub initial_steps: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            event_log_capacity: DEFAULT_EVENT_LOG_CAPACITY,
            metric_capacity: DEFAULT_METRIC_CAPACITY,
            reconnect_base_ms: DEFAULT_RECONNECT_BASE_MS,
            reconnect_max_ms: DEFAULT_RECONNECT_MAX_MS,
            reconnect_max_attempts: DEFAULT_RECONNECT_MAX_ATTEMPTS,
            mitigation_cooldown_ms: DEFAULT_MITIGATION_COOLDOWN_MS,
            initial_steps: DEFAULT_STEPS,
        }
    }
}

impl StreamConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load from an arbitrary key lookup. Missing or blank keys take their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            event_log_capacity: parse_or(
                &lookup,
                EVENT_LOG_CAPACITY_KEY,
                defaults.event_log_capacity,
            )?,
            metric_capacity: parse_or(&lookup, METRIC_CAPACITY_KEY, defaults.metric_capacity)?,
            reconnect_base_ms: parse_or(
                &lookup,
                RECONNECT_BASE_MS_KEY,
                defaults.reconnect_base_ms,
            )?,
            reconnect_max_ms: parse_or(&lookup, RECONNECT_MAX_MS_KEY, defaults.reconnect_max_ms)?,
            reconnect_max_attempts: parse_or(
                &lookup,
                RECONNECT_MAX_ATTEMPTS_KEY,
                defaults.reconnect_max_attempts,
            )?,
            mitigation_cooldown_ms: parse_or(
                &lookup,
                MITIGATION_COOLDOWN_MS_KEY,
                defaults.mitigation_cooldown_ms,
            )?,
            initial_steps: parse_or(&lookup, INITIAL_STEPS_KEY, defaults.initial_steps)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.event_log_capacity == 0 {
            return Err(ConfigError::Zero {
                key: EVENT_LOG_CAPACITY_KEY,
            });
        }
        if self.metric_capacity == 0 {
            return Err(ConfigError::Zero {
                key: METRIC_CAPACITY_KEY,
            });
        }
        if self.reconnect_base_ms == 0 {
            return Err(ConfigError::Zero {
                key: RECONNECT_BASE_MS_KEY,
            });
        }
        if self.reconnect_max_ms < self.reconnect_base_ms {
            return Err(ConfigError::BackoffRange {
                base_ms: self.reconnect_base_ms,
                max_ms: self.reconnect_max_ms,
            });
        }
        if self.initial_steps == 0 {
            return Err(ConfigError::Zero {
                key: INITIAL_STEPS_KEY,
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_delay_ms: self.reconnect_base_ms,
            max_delay_ms: self.reconnect_max_ms,
            max_attempts: self.reconnect_max_attempts,
        }
    }

    #[must_use]
    pub fn mitigation_config(&self) -> MitigationConfig {
        MitigationConfig {
            cooldown_ms: self.mitigation_cooldown_ms,
            initial_steps: self.initial_steps,
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse::<T>()
                .map_err(|error| ConfigError::InvalidValue {
                    key,
                    reason: format!("{raw:?}: {error}"),
                })
        }
        _ => Ok(default),
    }
}
