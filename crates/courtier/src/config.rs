//! Configuration file handling.
//!
//! The substrate reads a plain `key=value` text file. Lines starting with
//! `#` and blank lines are skipped; unknown keys are logged and ignored so a
//! newer configuration file keeps working against an older build. Malformed
//! values are fatal: the driver refuses to begin optimization on a broken
//! configuration.

use crate::broker::BrokerConfig;
use crate::collector::CollectorConfig;
use crate::serialization::SerializationMode;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Error types for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}:{line}: expected key=value, got {text:?}")]
    MalformedLine {
        path: String,
        line: usize,
        text: String,
    },
    #[error("{path}:{line}: invalid value {value:?} for key {key}")]
    InvalidValue {
        path: String,
        line: usize,
        key: String,
        value: String,
    },
}

/// The recognized configuration keys with their documented defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Threads feeding the random-number factory.
    pub n_producer_threads: u16,
    /// Default capacity of every bounded buffer.
    pub buffer_capacity: usize,
    /// Collector deadline for the first return per generation; `None` means
    /// no timeout (the file value 0 also means no timeout).
    pub first_item_timeout: Option<Duration>,
    /// Multiplier on first-return latency for the overall generation
    /// deadline.
    pub wait_factor: u32,
    /// Collector repair attempts before cloning.
    pub max_resubmissions: usize,
    /// Broker stale-fingerprint sweep period.
    pub stale_sweep_interval: Duration,
    /// Age at which a routing-index entry is dropped.
    pub stale_threshold: Duration,
    /// Wire format for remote consumers.
    pub serialization: SerializationMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            n_producer_threads: 10,
            buffer_capacity: 20_000,
            first_item_timeout: None,
            wait_factor: 2,
            max_resubmissions: 5,
            stale_sweep_interval: Duration::from_millis(1000),
            stale_threshold: Duration::from_millis(60_000),
            serialization: SerializationMode::Binary,
        }
    }
}

impl Config {
    /// Loads a configuration file, falling back to defaults for absent keys.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: display.clone(),
            source,
        })?;
        Self::parse(&text, &display)
    }

    /// Parses configuration text. `origin` is used in error messages.
    pub fn parse(text: &str, origin: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::MalformedLine {
                    path: origin.to_owned(),
                    line,
                    text: trimmed.to_owned(),
                });
            };
            let key = key.trim();
            let value = value.trim();
            match key {
                "nProducerThreads" => {
                    config.n_producer_threads = parse_value(origin, line, key, value)?;
                }
                "bufferCapacity" => {
                    config.buffer_capacity = parse_value(origin, line, key, value)?;
                }
                "firstItemTimeoutMs" => {
                    let ms: u64 = parse_value(origin, line, key, value)?;
                    config.first_item_timeout = (ms != 0).then(|| Duration::from_millis(ms));
                }
                "waitFactor" => {
                    config.wait_factor = parse_value(origin, line, key, value)?;
                }
                "maxResubmissions" => {
                    config.max_resubmissions = parse_value(origin, line, key, value)?;
                }
                "staleSweepIntervalMs" => {
                    let ms: u64 = parse_value(origin, line, key, value)?;
                    config.stale_sweep_interval = Duration::from_millis(ms);
                }
                "staleThresholdMs" => {
                    let ms: u64 = parse_value(origin, line, key, value)?;
                    config.stale_threshold = Duration::from_millis(ms);
                }
                "serialization" => {
                    config.serialization = parse_value(origin, line, key, value)?;
                }
                other => {
                    warn!(key = other, origin, line, "ignoring unknown configuration key");
                }
            }
        }
        Ok(config)
    }

    /// The broker view of this configuration.
    pub fn broker(&self) -> BrokerConfig {
        BrokerConfig {
            stale_sweep_interval: self.stale_sweep_interval,
            stale_threshold: self.stale_threshold,
        }
    }

    /// The collector view of this configuration.
    pub fn collector(&self) -> CollectorConfig {
        CollectorConfig {
            first_item_timeout: self.first_item_timeout,
            wait_factor: self.wait_factor,
            max_resubmissions: self.max_resubmissions,
            ..CollectorConfig::default()
        }
    }
}

fn parse_value<V>(origin: &str, line: usize, key: &str, value: &str) -> Result<V, ConfigError>
where
    V: FromStr,
{
    value.parse().map_err(|_| ConfigError::InvalidValue {
        path: origin.to_owned(),
        line,
        key: key.to_owned(),
        value: value.to_owned(),
    })
}
