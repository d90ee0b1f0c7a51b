//! Configuration types for the mesh exporter
//!
//! Settings are normally read from environment variables at startup
//! ([`ExporterConfig::from_env`]) and may be overridden by the binary's CLI
//! flags through [`ExporterConfigBuilder`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{ExporterError, Result};

/// Default expiry for packet deduplication markers (10 minutes)
pub const DEFAULT_FLOOD_EXPIRE_SECS: u64 = 10 * 60;

/// Default expiry for node metadata records (72 hours)
pub const DEFAULT_NODE_METADATA_TTL_SECS: u64 = 72 * 3600;

/// Default capacity of the in-memory store
pub const DEFAULT_CACHE_MAX_ENTRIES: usize = 10_000;

/// Default Redis host
pub const DEFAULT_REDIS_HOST: &str = "localhost";

/// Default Redis port
pub const DEFAULT_REDIS_PORT: u16 = 6379;

/// Main configuration for the exporter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// Backend holding dedup markers and node metadata
    #[serde(default)]
    pub store: StoreConfig,

    /// Deduplication settings
    #[serde(default)]
    pub dedup: DedupConfig,

    /// Node metadata settings
    #[serde(default)]
    pub metadata: MetadataConfig,

    /// Log output settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Expiring key-value backend selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Process-local LRU store
    Memory {
        /// Maximum markers and maximum node entries before LRU eviction
        #[serde(default = "default_max_entries")]
        max_entries: usize,
    },
    /// Redis server shared between exporter instances
    Redis {
        /// Host name or address
        host: String,
        /// TCP port
        #[serde(default = "default_redis_port")]
        port: u16,
    },
}

fn default_max_entries() -> usize {
    DEFAULT_CACHE_MAX_ENTRIES
}

fn default_redis_port() -> u16 {
    DEFAULT_REDIS_PORT
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Memory {
            max_entries: DEFAULT_CACHE_MAX_ENTRIES,
        }
    }
}

impl StoreConfig {
    /// Connection URL for the Redis backend, `None` for the memory store
    pub fn redis_url(&self) -> Option<String> {
        match self {
            StoreConfig::Memory { .. } => None,
            StoreConfig::Redis { host, port } => Some(format!("redis://{}:{}/0", host, port)),
        }
    }
}

/// Deduplication behavior configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// How long a packet id is remembered after first sighting
    #[serde(with = "humantime_serde", default = "default_flood_expire_time")]
    pub flood_expire_time: Duration,
}

fn default_flood_expire_time() -> Duration {
    Duration::from_secs(DEFAULT_FLOOD_EXPIRE_SECS)
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            flood_expire_time: default_flood_expire_time(),
        }
    }
}

/// Node metadata configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    /// Expiry applied on every metadata upsert
    #[serde(with = "humantime_serde", default = "default_metadata_ttl")]
    pub ttl: Duration,
}

fn default_metadata_ttl() -> Duration {
    Duration::from_secs(DEFAULT_NODE_METADATA_TTL_SECS)
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            ttl: default_metadata_ttl(),
        }
    }
}

/// Log output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `mesh_exporter=debug`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Colorize terminal output
    #[serde(default = "default_log_color")]
    pub color: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_color() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            color: default_log_color(),
        }
    }
}

impl ExporterConfig {
    /// Read configuration from process environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary variable lookup
    ///
    /// Recognized variables: `FLOOD_EXPIRE_TIME`, `NODE_METADATA_TTL` (both in
    /// seconds), `CACHE_MAX_ENTRIES`, `STORE_BACKEND` (`memory` or `redis`),
    /// `REDIS_HOST`, `REDIS_PORT`, `LOG_LEVEL` and `LOG_COLOR`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = ExporterConfig::default();

        if let Some(v) = lookup("FLOOD_EXPIRE_TIME") {
            config.dedup.flood_expire_time =
                Duration::from_secs(parse_number("FLOOD_EXPIRE_TIME", &v)?);
        }
        if let Some(v) = lookup("NODE_METADATA_TTL") {
            config.metadata.ttl = Duration::from_secs(parse_number("NODE_METADATA_TTL", &v)?);
        }

        let backend = lookup("STORE_BACKEND").unwrap_or_else(|| "memory".to_string());
        config.store = match backend.trim().to_ascii_lowercase().as_str() {
            "memory" => StoreConfig::Memory {
                max_entries: match lookup("CACHE_MAX_ENTRIES") {
                    Some(v) => parse_number("CACHE_MAX_ENTRIES", &v)?,
                    None => DEFAULT_CACHE_MAX_ENTRIES,
                },
            },
            "redis" => StoreConfig::Redis {
                host: lookup("REDIS_HOST").unwrap_or_else(|| DEFAULT_REDIS_HOST.to_string()),
                port: match lookup("REDIS_PORT") {
                    Some(v) => parse_number("REDIS_PORT", &v)?,
                    None => DEFAULT_REDIS_PORT,
                },
            },
            other => {
                return Err(ExporterError::InvalidConfig(format!(
                    "STORE_BACKEND must be one of: memory, redis (got {:?})",
                    other
                )))
            }
        };

        if let Some(v) = lookup("LOG_LEVEL") {
            config.logging.level = v.trim().to_ascii_lowercase();
        }
        if let Some(v) = lookup("LOG_COLOR") {
            config.logging.color = parse_flag("LOG_COLOR", &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check invariants that serde defaults cannot express
    pub fn validate(&self) -> Result<()> {
        if self.dedup.flood_expire_time.is_zero() {
            return Err(ExporterError::InvalidConfig(
                "flood_expire_time must be greater than zero".to_string(),
            ));
        }
        if self.metadata.ttl.is_zero() {
            return Err(ExporterError::InvalidConfig(
                "node metadata ttl must be greater than zero".to_string(),
            ));
        }
        match &self.store {
            StoreConfig::Memory { max_entries: 0 } => Err(ExporterError::InvalidConfig(
                "memory store needs room for at least one entry".to_string(),
            )),
            StoreConfig::Redis { host, .. } if host.trim().is_empty() => {
                Err(ExporterError::MissingConfig("REDIS_HOST".to_string()))
            }
            _ => Ok(()),
        }
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse::<T>().map_err(|_| {
        ExporterError::InvalidConfig(format!("{} must be a non-negative integer, got {:?}", name, value))
    })
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ExporterError::InvalidConfig(format!(
            "{} must be a boolean flag, got {:?}",
            name, value
        ))),
    }
}

/// Builder for ExporterConfig
#[derive(Debug, Default)]
pub struct ExporterConfigBuilder {
    config: ExporterConfig,
}

impl ExporterConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration
    pub fn from_config(config: ExporterConfig) -> Self {
        Self { config }
    }

    /// Set the deduplication window
    pub fn flood_expire_time(mut self, ttl: Duration) -> Self {
        self.config.dedup.flood_expire_time = ttl;
        self
    }

    /// Set the node metadata expiry
    pub fn metadata_ttl(mut self, ttl: Duration) -> Self {
        self.config.metadata.ttl = ttl;
        self
    }

    /// Use the in-memory store
    pub fn memory_store(mut self, max_entries: usize) -> Self {
        self.config.store = StoreConfig::Memory { max_entries };
        self
    }

    /// Use a Redis store
    pub fn redis_store(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.store = StoreConfig::Redis {
            host: host.into(),
            port,
        };
        self
    }

    /// Set the log filter directive
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    /// Enable or disable colored logs
    pub fn log_color(mut self, enabled: bool) -> Self {
        self.config.logging.color = enabled;
        self
    }

    /// Build the configuration
    pub fn build(self) -> ExporterConfig {
        self.config
    }
}

// Custom serde module for Duration with humantime
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
