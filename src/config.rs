// Runtime configuration

//! # Runtime Configuration
//!
//! Settings are layered, later sources overriding earlier ones:
//!
//! 1. built-in defaults ([`RuntimeConfig::default`])
//! 2. an optional `canvas_runtime.{toml,json,yaml}` file in the working directory
//! 3. environment variables prefixed with `CANVAS_RUNTIME__`, e.g.
//!    `CANVAS_RUNTIME__LOCK_TIMEOUT_SECONDS=120`
//!
//! A `.env` file is read into the environment first, so it can supply step 3.

use ::config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::lock::MAX_LOCK_TIMEOUT_SECONDS;
use crate::{CanvasRuntimeError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Timeout given to newly acquired locks
    pub lock_timeout_seconds: u64,

    pub lock_sweep_interval_seconds: u64,
    pub scheduler_poll_interval_ms: u64,
    pub event_history_capacity: usize,

    /// Per-client push buffer; a client that falls this far behind is disconnected
    pub client_buffer_capacity: usize,

    /// Maximum nesting of trigger actions re-entering the dispatcher
    pub max_trigger_depth: usize,

    pub log_level: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            lock_timeout_seconds: 300,
            lock_sweep_interval_seconds: 30,
            scheduler_poll_interval_ms: 1000,
            event_history_capacity: 1000,
            client_buffer_capacity: 256,
            max_trigger_depth: 8,
            log_level: "info".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Load from `.env`, the optional config file and the environment
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_sources(Some("canvas_runtime"))
    }

    /// Load from an optional config file (extension picked by the `config` crate) and the
    /// environment
    pub fn from_sources(file: Option<&str>) -> Result<Self> {
        let defaults = RuntimeConfig::default();
        let mut builder = Config::builder()
            .set_default("lock_timeout_seconds", defaults.lock_timeout_seconds)?
            .set_default("lock_sweep_interval_seconds", defaults.lock_sweep_interval_seconds)?
            .set_default("scheduler_poll_interval_ms", defaults.scheduler_poll_interval_ms)?
            .set_default("event_history_capacity", defaults.event_history_capacity as u64)?
            .set_default("client_buffer_capacity", defaults.client_buffer_capacity as u64)?
            .set_default("max_trigger_depth", defaults.max_trigger_depth as u64)?
            .set_default("log_level", defaults.log_level)?;

        if let Some(file) = file {
            builder = builder.add_source(File::with_name(file).required(false));
        }

        let config: RuntimeConfig = builder
            .add_source(
                Environment::with_prefix("CANVAS_RUNTIME")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would disable a component outright
    pub fn validate(&self) -> Result<()> {
        let zero = [
            ("lock_timeout_seconds", self.lock_timeout_seconds == 0),
            ("lock_sweep_interval_seconds", self.lock_sweep_interval_seconds == 0),
            ("scheduler_poll_interval_ms", self.scheduler_poll_interval_ms == 0),
            ("event_history_capacity", self.event_history_capacity == 0),
            ("client_buffer_capacity", self.client_buffer_capacity == 0),
            ("max_trigger_depth", self.max_trigger_depth == 0),
        ];
        if let Some((name, _)) = zero.iter().find(|(_, is_zero)| *is_zero) {
            return Err(CanvasRuntimeError::Validation(format!(
                "{} must be greater than zero",
                name
            )));
        }
        if self.lock_timeout_seconds > MAX_LOCK_TIMEOUT_SECONDS {
            return Err(CanvasRuntimeError::Validation(format!(
                "lock_timeout_seconds must not exceed {}",
                MAX_LOCK_TIMEOUT_SECONDS
            )));
        }
        Ok(())
    }

    pub fn lock_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.lock_sweep_interval_seconds)
    }

    pub fn scheduler_poll_interval(&self) -> Duration {
        Duration::from_millis(self.scheduler_poll_interval_ms)
    }
}
