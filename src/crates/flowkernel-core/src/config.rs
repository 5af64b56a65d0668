//! Runtime configuration
//!
//! [`RuntimeConfig`] can be built in code, loaded from a YAML or JSON file (format picked
//! by extension), or read from environment variables:
//!
//! | Variable | Field | Default |
//! |----------|-------|---------|
//! | `{PREFIX}_INSTANCE_ID` | `instance_id` | random uuid |
//! | `{PREFIX}_IDLE_BACKOFF_MS` | `idle_backoff_ms` | `25` |
//! | `{PREFIX}_BACKOFF_JITTER` | `backoff_jitter` | `true` |
//! | `{PREFIX}_CONCURRENCY` | `concurrency` | `1` |
//! | `{PREFIX}_EVENT_CAPACITY` | `event_capacity` | `256` |
//!
//! ```rust,ignore
//! use flowkernel_core::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_file("flowkernel.yaml")?;
//! let config = RuntimeConfig::from_env("FLOWKERNEL")?;
//! ```

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{FlowError, Result};

/// Default environment variable prefix
pub const ENV_PREFIX: &str = "FLOWKERNEL";

/// Scheduling configuration shared by every node of a runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Identifies this runtime instance in logs
    pub instance_id: String,

    /// Sleep between idle polls of a node loop, in milliseconds
    pub idle_backoff_ms: u64,

    /// Randomize idle sleeps so cooperating instances do not poll in lockstep
    pub backoff_jitter: bool,

    /// Batches a node may execute at the same time
    pub concurrency: usize,

    /// Buffered lifecycle events per subscriber
    pub event_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            instance_id: Uuid::new_v4().to_string(),
            idle_backoff_ms: 25,
            backoff_jitter: true,
            concurrency: 1,
            event_capacity: 256,
        }
    }
}

impl RuntimeConfig {
    /// Create the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the instance id
    pub fn with_instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = id.into();
        self
    }

    /// Set the idle backoff
    pub fn with_idle_backoff(mut self, backoff: Duration) -> Self {
        self.idle_backoff_ms = backoff.as_millis().max(1) as u64;
        self
    }

    /// Enable or disable jitter
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.backoff_jitter = jitter;
        self
    }

    /// Set the per-node concurrency budget
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the lifecycle event buffer
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Check invariants
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(FlowError::Configuration(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.idle_backoff_ms == 0 {
            return Err(FlowError::Configuration(
                "idle_backoff_ms must be at least 1".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(FlowError::Configuration(
                "event_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Next idle sleep
    ///
    /// With jitter enabled the delay is scaled by a random factor in `0.5..=1.5`.
    pub fn idle_delay(&self) -> Duration {
        let base = self.idle_backoff_ms as f64;
        let millis = if self.backoff_jitter {
            base * rand::thread_rng().gen_range(0.5..=1.5)
        } else {
            base
        };
        Duration::from_micros((millis * 1000.0) as u64)
    }

    /// Load from a `.yaml`, `.yml` or `.json` file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .ok_or_else(|| {
                FlowError::Configuration(format!(
                    "Unable to determine file extension for {:?}",
                    path
                ))
            })?;

        let content = std::fs::read_to_string(path)?;
        let config: Self = match extension.to_lowercase().as_str() {
            "yaml" | "yml" => serde_yaml::from_str(&content)?,
            "json" => serde_json::from_str(&content)?,
            other => {
                return Err(FlowError::Configuration(format!(
                    "Unsupported config file extension: {}",
                    other
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Load from `{prefix}_*` environment variables, falling back to defaults
    pub fn from_env(prefix: &str) -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            instance_id: env_or(prefix, "INSTANCE_ID", defaults.instance_id)?,
            idle_backoff_ms: env_or(prefix, "IDLE_BACKOFF_MS", defaults.idle_backoff_ms)?,
            backoff_jitter: env_bool_or(prefix, "BACKOFF_JITTER", defaults.backoff_jitter)?,
            concurrency: env_or(prefix, "CONCURRENCY", defaults.concurrency)?,
            event_capacity: env_or(prefix, "EVENT_CAPACITY", defaults.event_capacity)?,
        };
        config.validate()?;
        Ok(config)
    }
}

fn env_or<T>(prefix: &str, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let name = format!("{}_{}", prefix, key);
    match std::env::var(&name) {
        Ok(value) => value.parse::<T>().map_err(|e| {
            FlowError::Configuration(format!(
                "Failed to parse environment variable '{}': {}",
                name, e
            ))
        }),
        Err(_) => Ok(default),
    }
}

fn env_bool_or(prefix: &str, key: &str, default: bool) -> Result<bool> {
    let name = format!("{}_{}", prefix, key);
    match std::env::var(&name) {
        Ok(value) => match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(FlowError::Configuration(format!(
                "Invalid boolean value for '{}': {}",
                name, value
            ))),
        },
        Err(_) => Ok(default),
    }
}
