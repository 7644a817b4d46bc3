//! Engine configuration.
//!
//! [`EngineConfig`] can be built programmatically, deserialized from JSON, or
//! read from the environment. Durations are written in humantime form
//! (`"30s"`, `"5m"`, `"250ms"`).
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `FHIRVAULT_DB_PATH` | `:memory:` | SQLite database path |
//! | `FHIRVAULT_POOL_SIZE` | 10 | Maximum pooled connections |
//! | `FHIRVAULT_BUSY_TIMEOUT` | 5s | SQLite busy timeout |
//! | `FHIRVAULT_ENABLE_WAL` | true | WAL journal for file databases |
//! | `FHIRVAULT_STORAGE_STRATEGY` | HYBRID | NATIVE, CANONICAL, HYBRID or MULTI_VERSION |
//! | `FHIRVAULT_CANONICAL_VERSION` | R5 | Release bodies are stored in |
//! | `FHIRVAULT_DEFAULT_VERSION` | R4 | Release assumed when detection is inconclusive |
//! | `FHIRVAULT_DEFAULT_COUNT` | 10 | Default search page size |
//! | `FHIRVAULT_MAX_COUNT` | 1000 | Largest search page size |
//! | `FHIRVAULT_SEARCH_TIMEOUT` | 30s | Search timeout |
//! | `FHIRVAULT_TRANSACTION_TIMEOUT` | 60s | Transaction bundle timeout |
//! | `FHIRVAULT_ENTRY_TIMEOUT` | 10s | Batch entry timeout |
//! | `FHIRVAULT_MAX_BUNDLE_ENTRIES` | 1000 | Largest accepted bundle |
//! | `FHIRVAULT_CACHE_TTL` | 5m | Converted-output cache TTL |
//! | `FHIRVAULT_CACHE_MAX_ENTRIES` | 10000 | Converted-output cache capacity |
//! | `FHIRVAULT_EVERYTHING_MAX_DEPTH` | 2 | `$everything` reference depth |
//!
//! # Example
//!
//! ```
//! use fhirvault_persistence::config::EngineConfig;
//! use std::time::Duration;
//!
//! let config = EngineConfig::from_json_str(r#"{
//!     "search": { "timeout": "2s" },
//!     "versioning": { "strategy": "CANONICAL" }
//! }"#).unwrap();
//!
//! assert_eq!(config.search.timeout, Duration::from_secs(2));
//! assert_eq!(config.search.default_count, 10);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::version::{FhirVersion, StorageStrategy};

/// Serde helpers for humantime durations.
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    /// Serializes a duration as a humantime string.
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*value))
    }

    /// Deserializes a duration from a humantime string.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(D::Error::custom)
    }
}

/// Errors raised while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The JSON document could not be parsed.
    #[error("invalid configuration document: {0}")]
    Parse(#[from] serde_json::Error),

    /// An environment variable held a value of the wrong shape.
    #[error("invalid value for {variable}: {message}")]
    InvalidValue { variable: String, message: String },

    /// The assembled configuration is inconsistent.
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// SQLite storage settings.
    #[serde(default)]
    pub sqlite: SqliteBackendConfig,

    /// Version detection and storage strategy.
    #[serde(default)]
    pub versioning: VersioningConfig,

    /// Search paging and timeouts.
    #[serde(default)]
    pub search: SearchConfig,

    /// Bundle processing limits.
    #[serde(default)]
    pub bundle: BundleConfig,

    /// Converted-output cache.
    #[serde(default)]
    pub cache: CacheConfig,

    /// `$everything` traversal.
    #[serde(default)]
    pub everything: EverythingConfig,
}

/// Configuration for the SQLite backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqliteBackendConfig {
    /// Database path, or `:memory:`.
    #[serde(default = "default_path")]
    pub path: String,

    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// How long to wait for a pooled connection.
    #[serde(default = "default_connection_timeout", with = "humantime_serde")]
    pub connection_timeout: Duration,

    /// SQLite busy timeout.
    #[serde(default = "default_busy_timeout", with = "humantime_serde")]
    pub busy_timeout: Duration,

    /// Enable WAL mode for file databases.
    #[serde(default = "default_true")]
    pub enable_wal: bool,
}

fn default_path() -> String {
    ":memory:".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_connection_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_busy_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_true() -> bool {
    true
}

impl Default for SqliteBackendConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            max_connections: default_max_connections(),
            connection_timeout: default_connection_timeout(),
            busy_timeout: default_busy_timeout(),
            enable_wal: true,
        }
    }
}

impl SqliteBackendConfig {
    /// Returns true for an in-memory database.
    pub fn is_memory(&self) -> bool {
        self.path == ":memory:"
    }
}

/// Version negotiation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersioningConfig {
    /// How bodies are persisted across releases.
    #[serde(default)]
    pub strategy: StorageStrategy,

    /// The release CANONICAL and HYBRID store in.
    #[serde(default = "default_canonical")]
    pub canonical_version: FhirVersion,

    /// The release assumed when detection finds no indicator.
    #[serde(default)]
    pub default_version: FhirVersion,
}

fn default_canonical() -> FhirVersion {
    FhirVersion::R5
}

impl Default for VersioningConfig {
    fn default() -> Self {
        Self {
            strategy: StorageStrategy::default(),
            canonical_version: default_canonical(),
            default_version: FhirVersion::default(),
        }
    }
}

/// Search settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Page size when `_count` is absent.
    #[serde(default = "default_count")]
    pub default_count: u32,

    /// Largest page size; larger `_count` values are capped.
    #[serde(default = "default_max_count")]
    pub max_count: u32,

    /// Per-search timeout.
    #[serde(default = "default_search_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_count() -> u32 {
    crate::search::DEFAULT_COUNT
}

fn default_max_count() -> u32 {
    crate::search::MAX_COUNT
}

fn default_search_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_count: default_count(),
            max_count: default_max_count(),
            timeout: default_search_timeout(),
        }
    }
}

/// Bundle processing settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleConfig {
    /// Budget for a whole `transaction` bundle.
    #[serde(default = "default_transaction_timeout", with = "humantime_serde")]
    pub transaction_timeout: Duration,

    /// Budget for each `batch` entry.
    #[serde(default = "default_entry_timeout", with = "humantime_serde")]
    pub entry_timeout: Duration,

    /// Largest accepted entry count.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

fn default_transaction_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_entry_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_max_entries() -> usize {
    1000
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            transaction_timeout: default_transaction_timeout(),
            entry_timeout: default_entry_timeout(),
            max_entries: default_max_entries(),
        }
    }
}

/// Converted-output cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Entry lifetime.
    #[serde(default = "default_ttl", with = "humantime_serde")]
    pub ttl: Duration,

    /// Capacity; the oldest entries are evicted first.
    #[serde(default = "default_cache_entries")]
    pub max_entries: usize,
}

fn default_ttl() -> Duration {
    Duration::from_secs(300)
}

fn default_cache_entries() -> usize {
    10_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: default_ttl(),
            max_entries: default_cache_entries(),
        }
    }
}

/// `$everything` settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EverythingConfig {
    /// How many reference hops to follow from compartment members.
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
}

fn default_max_depth() -> u32 {
    2
}

impl Default for EverythingConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
        }
    }
}

impl EngineConfig {
    /// Parses a JSON document. Missing sections take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
    }

    /// Builds a configuration from defaults overridden by `FHIRVAULT_*` variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
    }

    /// Applies overrides from a variable lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("FHIRVAULT_DB_PATH") {
            self.sqlite.path = v;
        }
        override_parsed(&lookup, "FHIRVAULT_POOL_SIZE", &mut self.sqlite.max_connections)?;
        override_duration(&lookup, "FHIRVAULT_BUSY_TIMEOUT", &mut self.sqlite.busy_timeout)?;
        override_parsed(&lookup, "FHIRVAULT_ENABLE_WAL", &mut self.sqlite.enable_wal)?;

        if let Some(v) = lookup("FHIRVAULT_STORAGE_STRATEGY") {
            self.versioning.strategy =
                StorageStrategy::parse(&v).ok_or_else(|| ConfigError::InvalidValue {
                    variable: "FHIRVAULT_STORAGE_STRATEGY".to_string(),
                    message: format!("unknown strategy '{}'", v),
                })?;
        }
        override_parsed(
            &lookup,
            "FHIRVAULT_CANONICAL_VERSION",
            &mut self.versioning.canonical_version,
        )?;
        override_parsed(
            &lookup,
            "FHIRVAULT_DEFAULT_VERSION",
            &mut self.versioning.default_version,
        )?;

        override_parsed(&lookup, "FHIRVAULT_DEFAULT_COUNT", &mut self.search.default_count)?;
        override_parsed(&lookup, "FHIRVAULT_MAX_COUNT", &mut self.search.max_count)?;
        override_duration(&lookup, "FHIRVAULT_SEARCH_TIMEOUT", &mut self.search.timeout)?;

        override_duration(
            &lookup,
            "FHIRVAULT_TRANSACTION_TIMEOUT",
            &mut self.bundle.transaction_timeout,
        )?;
        override_duration(&lookup, "FHIRVAULT_ENTRY_TIMEOUT", &mut self.bundle.entry_timeout)?;
        override_parsed(
            &lookup,
            "FHIRVAULT_MAX_BUNDLE_ENTRIES",
            &mut self.bundle.max_entries,
        )?;

        override_duration(&lookup, "FHIRVAULT_CACHE_TTL", &mut self.cache.ttl)?;
        override_parsed(&lookup, "FHIRVAULT_CACHE_MAX_ENTRIES", &mut self.cache.max_entries)?;
        override_parsed(
            &lookup,
            "FHIRVAULT_EVERYTHING_MAX_DEPTH",
            &mut self.everything.max_depth,
        )?;
        Ok(())
    }

    /// Validates the configuration and returns every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.sqlite.max_connections == 0 {
            errors.push("Pool size cannot be 0".to_string());
        }
        if self.search.default_count == 0 {
            errors.push("Default count cannot be 0".to_string());
        }
        if self.search.default_count > self.search.max_count {
            errors.push("Default count cannot exceed max count".to_string());
        }
        if self.search.timeout.is_zero() {
            errors.push("Search timeout cannot be 0".to_string());
        }
        if self.bundle.transaction_timeout.is_zero() || self.bundle.entry_timeout.is_zero() {
            errors.push("Bundle timeouts cannot be 0".to_string());
        }
        if self.bundle.max_entries == 0 {
            errors.push("Max bundle entries cannot be 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Creates a configuration suitable for testing: in-memory storage and short timeouts.
    pub fn for_testing() -> Self {
        Self {
            search: SearchConfig {
                timeout: Duration::from_secs(5),
                ..Default::default()
            },
            bundle: BundleConfig {
                transaction_timeout: Duration::from_secs(10),
                entry_timeout: Duration::from_secs(5),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

fn override_parsed<F, T>(lookup: &F, variable: &str, target: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(variable) {
        *target = raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            variable: variable.to_string(),
            message: e.to_string(),
        })?;
    }
    Ok(())
}

fn override_duration<F>(lookup: &F, variable: &str, target: &mut Duration) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(variable) {
        *target = humantime::parse_duration(raw.trim()).map_err(|e| ConfigError::InvalidValue {
            variable: variable.to_string(),
            message: e.to_string(),
        })?;
    }
    Ok(())
}
