use std::path::PathBuf;
use std::time::Duration;

use chronicle_core::PartitionId;
use chronicle_replica::{BackoffPolicy, DEFAULT_INLINE_THRESHOLD};

/// Node configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub partitions: Vec<PartitionId>,
    pub inline_threshold: usize,
    pub max_attempts: u32,
    pub retry_base: Duration,
    pub compact_on_start: bool,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let db_path = lookup("CHRONICLE_DB_PATH")
            .unwrap_or_else(|| "./chronicle.redb".to_string())
            .into();

        let partitions = Self::parse_partitions(lookup("CHRONICLE_PARTITIONS"))?;

        let inline_threshold = match lookup("CHRONICLE_INLINE_THRESHOLD") {
            Some(value) => value.parse().map_err(|_| {
                ConfigError::Invalid("CHRONICLE_INLINE_THRESHOLD", "must be a byte count")
            })?,
            None => DEFAULT_INLINE_THRESHOLD,
        };

        let max_attempts = match lookup("CHRONICLE_MAX_ATTEMPTS") {
            Some(value) => match value.parse::<u32>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(ConfigError::Invalid(
                        "CHRONICLE_MAX_ATTEMPTS",
                        "must be a positive integer",
                    ))
                }
            },
            None => 3,
        };

        let retry_base = match lookup("CHRONICLE_RETRY_BASE_MS") {
            Some(value) => Duration::from_millis(value.parse().map_err(|_| {
                ConfigError::Invalid("CHRONICLE_RETRY_BASE_MS", "must be milliseconds")
            })?),
            None => Duration::from_millis(500),
        };

        let compact_on_start = match lookup("CHRONICLE_COMPACT_ON_START").as_deref() {
            None | Some("true") | Some("1") => true,
            Some("false") | Some("0") => false,
            Some(_) => {
                return Err(ConfigError::Invalid(
                    "CHRONICLE_COMPACT_ON_START",
                    "must be true or false",
                ))
            }
        };

        Ok(Config {
            db_path,
            partitions,
            inline_threshold,
            max_attempts,
            retry_base,
            compact_on_start,
        })
    }

    fn parse_partitions(value: Option<String>) -> Result<Vec<PartitionId>, ConfigError> {
        let value = match value {
            Some(s) if !s.trim().is_empty() => s,
            _ => return Err(ConfigError::Missing("CHRONICLE_PARTITIONS")),
        };

        let mut partitions = Vec::new();
        for uri in value.split(',') {
            let uri = uri.trim();
            if uri.is_empty() {
                continue;
            }
            // Partition URIs carry a scheme, e.g. "chronicle://host/partition"
            if !uri.contains(':') {
                return Err(ConfigError::Invalid(
                    "CHRONICLE_PARTITIONS",
                    "expected comma separated partition URIs",
                ));
            }
            partitions.push(PartitionId::new(uri));
        }
        Ok(partitions)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.max_attempts,
            base: self.retry_base,
            ..BackoffPolicy::default()
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Missing(&'static str),
    Invalid(&'static str, &'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Missing(var) => write!(f, "Missing environment variable: {}", var),
            ConfigError::Invalid(var, msg) => write!(f, "Invalid value for {}: {}", var, msg),
        }
    }
}

impl std::error::Error for ConfigError {}
