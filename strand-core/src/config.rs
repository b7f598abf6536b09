//! Engine configuration.
//!
//! Every component has its own config struct with defaults and builder
//! methods; [`EngineConfig`] groups them so a process can load the whole
//! set from JSON or from `STRAND_*` environment variables.
//!
//! Durations are written in milliseconds:
//!
//! ```json
//! {
//!   "listener": { "keepalive_timeout": 15000, "suspend_timeout": 30000 },
//!   "scheduler": { "dispatch_limit": 16 },
//!   "worker": { "max_threads": 128 }
//! }
//! ```
//!
//! ## Environment Variables
//!
//! - `STRAND_KEEPALIVE_TIMEOUT_MS` - Keepalive wait before closing
//! - `STRAND_SUSPEND_TIMEOUT_MS` - Default comet suspend deadline
//! - `STRAND_MAX_CONNECTIONS` - Concurrent connection limit
//! - `STRAND_TIMER_DISPATCH_LIMIT` - In-flight fired timer limit
//! - `STRAND_WORKER_THREADS` - Request lane size

use crate::error::{Error, Result};
use crate::listener::ListenerConfig;
use crate::multiplexer::MultiplexerConfig;
use crate::timer::SchedulerConfig;
use crate::worker::WorkerConfig;
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub listener: ListenerConfig,
    pub scheduler: SchedulerConfig,
    pub worker: WorkerConfig,
    pub multiplexer: MultiplexerConfig,
}

impl EngineConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON document. Missing fields keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the document is malformed or fails
    /// validation.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `STRAND_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a variable is present but unparsable.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(ms) = env_var::<u64>("STRAND_KEEPALIVE_TIMEOUT_MS")? {
            config.listener.keepalive_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_var::<u64>("STRAND_SUSPEND_TIMEOUT_MS")? {
            config.listener.suspend_timeout = Duration::from_millis(ms);
        }
        if let Some(max) = env_var::<usize>("STRAND_MAX_CONNECTIONS")? {
            config.listener.max_connections = max;
        }
        if let Some(limit) = env_var::<usize>("STRAND_TIMER_DISPATCH_LIMIT")? {
            config.scheduler.dispatch_limit = limit;
        }
        if let Some(threads) = env_var::<usize>("STRAND_WORKER_THREADS")? {
            config.worker.max_threads = threads;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first offending setting.
    pub fn validate(&self) -> Result<()> {
        if self.listener.keepalive_timeout.is_zero() {
            return Err(Error::Config("listener.keepalive_timeout must be > 0".into()));
        }
        if self.listener.suspend_timeout.is_zero() {
            return Err(Error::Config("listener.suspend_timeout must be > 0".into()));
        }
        if self.listener.max_connections == 0 {
            return Err(Error::Config("listener.max_connections must be > 0".into()));
        }
        if self.scheduler.dispatch_limit == 0 {
            return Err(Error::Config("scheduler.dispatch_limit must be > 0".into()));
        }
        if self.scheduler.min_sample_interval > self.scheduler.max_sample_interval {
            return Err(Error::Config(
                "scheduler.min_sample_interval exceeds max_sample_interval".into(),
            ));
        }
        Ok(())
    }
}

fn env_var<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{name}: cannot parse {raw:?}"))),
        Err(_) => Ok(None),
    }
}

/// Serde adapter for `Duration` fields written as integer milliseconds.
pub(crate) mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub(crate) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
