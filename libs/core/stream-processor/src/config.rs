//! Handler configuration
//!
//! Every handler gets a [`HandlerConfig`] at registration time. Resolution is
//! layered: built-in defaults first, then whatever the external [`ConfigSource`]
//! has under the handler's name. A config source that fails to load is logged
//! and ignored; it never blocks registration.

use crate::error::BoxError;
use serde::Deserialize;
use serde_json::Value;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Name used for handlers registered without one.
pub const DEFAULT_HANDLER_NAME: &str = "default";

/// Flush interval used when none is configured.
pub const DEFAULT_AUTO_BATCH_INTERVAL: Duration = Duration::from_secs(60);

/// Configuration errors. These are always recoverable: the handler falls back
/// to its defaults.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse '{key}': {details}")]
    InvalidValue { key: String, details: String },

    #[error("Failed to decode options for {name}: {source}")]
    Decode {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to load options: {0}")]
    Source(BoxError),
}

/// Options for one handler.
///
/// # Ordering
///
/// Records of one partition are only processed, batched and committed in offset
/// order when `handle_workers` is 1. With several handle workers (or several
/// batch workers) records of the same partition can overtake each other, and a
/// later offset may be committed before an earlier one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerConfig {
    /// Handler name; also the key for source and option lookups.
    pub name: String,

    /// Workers pulling from the source
    pub fetch_workers: usize,

    /// Workers running `Handler::handle`
    pub handle_workers: usize,

    /// Workers accumulating results and running `BatchHandler::batch`
    pub batch_workers: usize,

    /// Results per batch before a flush is forced
    pub batch_size: usize,

    /// Flush a partial batch after this long without a flush
    pub auto_batch_interval: Duration,

    /// Capacity of the record and batch channels
    pub channel_capacity: usize,

    /// Commit right after `handle` instead of after the batch is flushed.
    /// Also enables a final flush when the processor shuts down.
    pub auto_commit: bool,
}

impl HandlerConfig {
    /// Defaults for a handler. An empty name becomes `"default"`.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            name: if name.is_empty() {
                DEFAULT_HANDLER_NAME.to_string()
            } else {
                name
            },
            fetch_workers: 1,
            handle_workers: 1,
            batch_workers: 1,
            batch_size: 1,
            auto_batch_interval: DEFAULT_AUTO_BATCH_INTERVAL,
            channel_capacity: 1,
            auto_commit: false,
        }
    }

    /// Defaults overridden by `config`'s entry for `name`.
    pub fn resolve(name: impl Into<String>, config: &dyn ConfigSource) -> Self {
        let base = Self::new(name);
        match config.lookup(&base.name) {
            Ok(Some(overrides)) => {
                debug!(handler = %base.name, ?overrides, "Applying handler options");
                base.apply(&overrides)
            }
            Ok(None) => base,
            Err(e) => {
                warn!(
                    handler = %base.name,
                    error = %e,
                    "Failed to load handler options, using defaults"
                );
                base
            }
        }
    }

    /// Apply every override that is present
    pub fn apply(mut self, overrides: &HandlerConfigOverrides) -> Self {
        if let Some(n) = overrides.read_worker_count {
            self = self.with_fetch_workers(n);
        }
        if let Some(n) = overrides.handle_worker_count {
            self = self.with_handle_workers(n);
        }
        if let Some(n) = overrides.batch_worker_count {
            self = self.with_batch_workers(n);
        }
        if let Some(n) = overrides.batch_size {
            self = self.with_batch_size(n);
        }
        if let Some(interval) = overrides.auto_batch_interval {
            self = self.with_auto_batch_interval(interval);
        }
        if let Some(n) = overrides.channel_capacity {
            self = self.with_channel_capacity(n);
        }
        if let Some(auto_commit) = overrides.auto_commit {
            self = self.with_auto_commit(auto_commit);
        }
        self
    }

    /// Set the fetch worker count
    pub fn with_fetch_workers(mut self, count: usize) -> Self {
        self.fetch_workers = count.max(1);
        self
    }

    /// Set the handle worker count
    pub fn with_handle_workers(mut self, count: usize) -> Self {
        self.handle_workers = count.max(1);
        self
    }

    /// Set the batch worker count
    pub fn with_batch_workers(mut self, count: usize) -> Self {
        self.batch_workers = count.max(1);
        self
    }

    /// Set the batch size threshold
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Set the flush interval. Zero keeps the default.
    pub fn with_auto_batch_interval(mut self, interval: Duration) -> Self {
        self.auto_batch_interval = if interval.is_zero() {
            DEFAULT_AUTO_BATCH_INTERVAL
        } else {
            interval
        };
        self
    }

    /// Set the channel capacity
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Enable or disable auto commit
    pub fn with_auto_commit(mut self, enable: bool) -> Self {
        self.auto_commit = enable;
        self
    }
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self::new(DEFAULT_HANDLER_NAME)
    }
}

/// Options read from an external store. Absent fields keep the default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerConfigOverrides {
    #[serde(alias = "batchWorker")]
    pub batch_worker_count: Option<usize>,

    pub batch_size: Option<usize>,

    #[serde(alias = "handleWorker")]
    pub handle_worker_count: Option<usize>,

    #[serde(alias = "fetchWorkerCount")]
    pub read_worker_count: Option<usize>,

    #[serde(default, with = "humantime_serde")]
    pub auto_batch_interval: Option<Duration>,

    pub auto_commit: Option<bool>,

    pub channel_capacity: Option<usize>,
}

/// External option store keyed by handler name.
pub trait ConfigSource: Send + Sync {
    /// Options stored for `name`, or `None` if the store has no entry.
    fn lookup(&self, name: &str) -> Result<Option<HandlerConfigOverrides>, ConfigError>;
}

/// Config source with no entries; every handler runs on defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoConfig;

impl ConfigSource for NoConfig {
    fn lookup(&self, _name: &str) -> Result<Option<HandlerConfigOverrides>, ConfigError> {
        Ok(None)
    }
}

/// Reads options from a JSON tree under `processor.<name>`.
///
/// ```json
/// { "processor": { "orders": { "batchSize": 3, "autoBatchInterval": "1s" } } }
/// ```
#[derive(Debug, Clone, Default)]
pub struct JsonConfig {
    root: Value,
}

impl JsonConfig {
    pub fn new(root: Value) -> Self {
        Self { root }
    }

    /// Parse a JSON document
    pub fn parse(document: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(document)
            .map(Self::new)
            .map_err(|e| ConfigError::Source(Box::new(e)))
    }
}

impl ConfigSource for JsonConfig {
    fn lookup(&self, name: &str) -> Result<Option<HandlerConfigOverrides>, ConfigError> {
        let Some(entry) = self.root.get("processor").and_then(|p| p.get(name)) else {
            return Ok(None);
        };

        HandlerConfigOverrides::deserialize(entry)
            .map(Some)
            .map_err(|source| ConfigError::Decode {
                name: name.to_string(),
                source,
            })
    }
}

/// Reads options from `<PREFIX>_<NAME>_<OPTION>` environment variables.
///
/// With the default `PROCESSOR` prefix, handler `orders` reads
/// `PROCESSOR_ORDERS_BATCH_SIZE`, `PROCESSOR_ORDERS_AUTO_BATCH_INTERVAL` (e.g.
/// `1s`), `PROCESSOR_ORDERS_AUTO_COMMIT`, `PROCESSOR_ORDERS_READ_WORKER_COUNT`,
/// `PROCESSOR_ORDERS_HANDLE_WORKER_COUNT`, `PROCESSOR_ORDERS_BATCH_WORKER_COUNT`
/// and `PROCESSOR_ORDERS_CHANNEL_CAPACITY`.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    prefix: String,
}

impl EnvConfig {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn key(&self, name: &str, option: &str) -> String {
        let name: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}_{}_{}", self.prefix, name, option)
    }
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self::new("PROCESSOR")
    }
}

impl ConfigSource for EnvConfig {
    fn lookup(&self, name: &str) -> Result<Option<HandlerConfigOverrides>, ConfigError> {
        let interval_key = self.key(name, "AUTO_BATCH_INTERVAL");
        let auto_batch_interval = env_optional(&interval_key)
            .map(|raw| {
                humantime::parse_duration(&raw).map_err(|e| ConfigError::InvalidValue {
                    key: interval_key.clone(),
                    details: e.to_string(),
                })
            })
            .transpose()?;

        let overrides = HandlerConfigOverrides {
            batch_worker_count: env_parse(&self.key(name, "BATCH_WORKER_COUNT"))?,
            batch_size: env_parse(&self.key(name, "BATCH_SIZE"))?,
            handle_worker_count: env_parse(&self.key(name, "HANDLE_WORKER_COUNT"))?,
            read_worker_count: env_parse(&self.key(name, "READ_WORKER_COUNT"))?,
            auto_batch_interval,
            auto_commit: env_parse(&self.key(name, "AUTO_COMMIT"))?,
            channel_capacity: env_parse(&self.key(name, "CHANNEL_CAPACITY"))?,
        };

        if overrides == HandlerConfigOverrides::default() {
            Ok(None)
        } else {
            Ok(Some(overrides))
        }
    }
}

/// Value of an environment variable, treating empty as unset
fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Parse an optional environment variable
fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    env_optional(key)
        .map(|raw| {
            raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                details: e.to_string(),
            })
        })
        .transpose()
}
