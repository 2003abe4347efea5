//! TOML Configuration File Support
//!
//! Centralised configuration loading for the client core, backed by an
//! optional TOML file at `~/.config/parley/client.toml`.
//!
//! # Configuration Priority
//!
//! Values are resolved with the following priority (highest first):
//! 1. CLI arguments (via [`ConfigOverrides`])
//! 2. Environment variables (`PARLEY_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [api]
//! base_url = "https://chat.example.com/api"
//! request_timeout_secs = 30
//!
//! [stream]
//! first_byte_timeout_secs = 30
//! inactivity_timeout_secs = 180
//! dedup_prefix_chars = 150
//!
//! [cache]
//! ttl_secs = 300
//! sweep_interval_secs = 60
//!
//! [pagination]
//! initial_limit = 20
//! growth_factor = 2
//! max_limit = 100
//! min_fetch_spacing_ms = 500
//!
//! [store]
//! settle_pause_ms = 50
//! title_max_chars = 30
//! default_title = "New Chat"
//! max_input_length = 32768
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::cache::CacheConfig;
use crate::store::pagination::PaginationConfig;
use crate::store::StoreConfig;
use crate::streaming::StreamConfig;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where the configuration came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Command-line argument
    Cli,
    /// Environment variable
    Env,
    /// TOML configuration file
    File,
    /// Built-in default
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[api]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiToml {
    /// Base URL of the chat API
    pub base_url: Option<String>,
    /// Timeout for non-streaming requests, in seconds
    pub request_timeout_secs: Option<u64>,
}

/// `[stream]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamToml {
    /// Time allowed before the first byte arrives, in seconds
    pub first_byte_timeout_secs: Option<u64>,
    /// Time allowed between bytes once streaming, in seconds
    pub inactivity_timeout_secs: Option<u64>,
    /// Payload characters included in frame dedup keys
    pub dedup_prefix_chars: Option<usize>,
}

/// `[cache]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheToml {
    /// Page cache time-to-live, in seconds
    pub ttl_secs: Option<u64>,
    /// Interval of the background sweep, in seconds
    pub sweep_interval_secs: Option<u64>,
}

/// `[pagination]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PaginationToml {
    /// Page size of the first page
    pub initial_limit: Option<u32>,
    /// Page size multiplier per older page
    pub growth_factor: Option<u32>,
    /// Largest page size requested
    pub max_limit: Option<u32>,
    /// Minimum spacing between fetches of one conversation, in milliseconds
    pub min_fetch_spacing_ms: Option<u64>,
}

/// `[store]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreToml {
    /// Pause after an optimistic add before the request goes out, in milliseconds
    pub settle_pause_ms: Option<u64>,
    /// Maximum length of derived titles
    pub title_max_chars: Option<usize>,
    /// Title used for new conversations
    pub default_title: Option<String>,
    /// Longest message accepted for sending, in characters
    pub max_input_length: Option<usize>,
}

/// Root of the TOML configuration file
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParleyToml {
    /// `[api]`
    pub api: ApiToml,
    /// `[stream]`
    pub stream: StreamToml,
    /// `[cache]`
    pub cache: CacheToml,
    /// `[pagination]`
    pub pagination: PaginationToml,
    /// `[store]`
    pub store: StoreToml,
}

// =============================================================================
// Resolved Configuration
// =============================================================================

/// Chat API connection settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiConfig {
    /// Base URL of the chat API
    pub base_url: String,
    /// Timeout for non-streaming requests
    pub request_timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Fully resolved client configuration
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Chat API settings
    pub api: ApiConfig,
    /// Streaming session settings
    pub stream: StreamConfig,
    /// Page cache settings
    pub cache: CacheConfig,
    /// Pagination settings
    pub pagination: PaginationConfig,
    /// Conversation store settings
    pub store: StoreConfig,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    /// Source of configuration values
    source: ConfigSource,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            stream: StreamConfig::default(),
            cache: CacheConfig::default(),
            pagination: PaginationConfig::default(),
            store: StoreConfig::default(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl ClientConfig {
    /// Create a configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Check values that would break the client at runtime
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let base_url = self.api.base_url.as_str();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ConfigError::ValidationError(format!(
                "api.base_url must be an http(s) URL, got {base_url:?}"
            )));
        }
        if self.pagination.initial_limit == 0 {
            return Err(ConfigError::ValidationError(
                "pagination.initial_limit must be at least 1".to_string(),
            ));
        }
        if self.pagination.growth_factor == 0 {
            return Err(ConfigError::ValidationError(
                "pagination.growth_factor must be at least 1".to_string(),
            ));
        }
        if self.pagination.max_limit < self.pagination.initial_limit {
            return Err(ConfigError::ValidationError(format!(
                "pagination.max_limit ({}) is below initial_limit ({})",
                self.pagination.max_limit, self.pagination.initial_limit
            )));
        }
        if self.store.title_max_chars == 0 {
            return Err(ConfigError::ValidationError(
                "store.title_max_chars must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/parley/client.toml` or
/// `~/.config/parley/client.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("parley").join("client.toml"))
}

/// Load configuration from the default path, then the environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if
/// the resolved configuration is invalid. A missing file is not an error.
pub fn load_config() -> Result<ClientConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path, then the environment
///
/// # Errors
///
/// Returns an error if the config file cannot be read or parsed, or if the
/// resolved configuration is invalid.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<ClientConfig, ConfigError> {
    let mut config = ClientConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: ParleyToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config);
    config.validate()?;

    Ok(config)
}

/// Apply TOML values over the current configuration
fn apply_toml_config(config: &mut ClientConfig, toml: &ParleyToml) {
    if let Some(ref url) = toml.api.base_url {
        config.api.base_url = url.clone();
    }
    if let Some(secs) = toml.api.request_timeout_secs {
        config.api.request_timeout = Duration::from_secs(secs);
    }

    if let Some(secs) = toml.stream.first_byte_timeout_secs {
        config.stream.first_byte_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = toml.stream.inactivity_timeout_secs {
        config.stream.inactivity_timeout = Duration::from_secs(secs);
    }
    if let Some(chars) = toml.stream.dedup_prefix_chars {
        config.stream.dedup_prefix_chars = chars;
    }

    if let Some(secs) = toml.cache.ttl_secs {
        config.cache.ttl = Duration::from_secs(secs);
    }
    if let Some(secs) = toml.cache.sweep_interval_secs {
        config.cache.sweep_interval = Duration::from_secs(secs);
    }

    if let Some(limit) = toml.pagination.initial_limit {
        config.pagination.initial_limit = limit;
    }
    if let Some(factor) = toml.pagination.growth_factor {
        config.pagination.growth_factor = factor;
    }
    if let Some(limit) = toml.pagination.max_limit {
        config.pagination.max_limit = limit;
    }
    if let Some(ms) = toml.pagination.min_fetch_spacing_ms {
        config.pagination.min_fetch_spacing = Duration::from_millis(ms);
    }

    if let Some(ms) = toml.store.settle_pause_ms {
        config.store.settle_pause = Duration::from_millis(ms);
    }
    if let Some(chars) = toml.store.title_max_chars {
        config.store.title_max_chars = chars;
    }
    if let Some(ref title) = toml.store.default_title {
        config.store.default_title = title.clone();
    }
    if let Some(length) = toml.store.max_input_length {
        config.store.max_input_length = length;
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// Apply `PARLEY_*` environment overrides
fn apply_env_config(config: &mut ClientConfig) {
    if let Ok(url) = std::env::var("PARLEY_BASE_URL") {
        config.api.base_url = url;
        config.source = ConfigSource::Env;
    }
    if let Some(secs) = env_parse::<u64>("PARLEY_REQUEST_TIMEOUT_SECS") {
        config.api.request_timeout = Duration::from_secs(secs);
        config.source = ConfigSource::Env;
    }
    if let Some(secs) = env_parse::<u64>("PARLEY_FIRST_BYTE_TIMEOUT_SECS") {
        config.stream.first_byte_timeout = Duration::from_secs(secs);
        config.source = ConfigSource::Env;
    }
    if let Some(secs) = env_parse::<u64>("PARLEY_INACTIVITY_TIMEOUT_SECS") {
        config.stream.inactivity_timeout = Duration::from_secs(secs);
        config.source = ConfigSource::Env;
    }
    if let Some(secs) = env_parse::<u64>("PARLEY_CACHE_TTL_SECS") {
        config.cache.ttl = Duration::from_secs(secs);
        config.source = ConfigSource::Env;
    }
    if let Some(limit) = env_parse::<u32>("PARLEY_PAGE_LIMIT") {
        config.pagination.initial_limit = limit;
        config.source = ConfigSource::Env;
    }
    if let Some(limit) = env_parse::<u32>("PARLEY_MAX_PAGE_LIMIT") {
        config.pagination.max_limit = limit;
        config.source = ConfigSource::Env;
    }
    if let Some(ms) = env_parse::<u64>("PARLEY_FETCH_SPACING_MS") {
        config.pagination.min_fetch_spacing = Duration::from_millis(ms);
        config.source = ConfigSource::Env;
    }
    if let Some(length) = env_parse::<usize>("PARLEY_MAX_INPUT_LENGTH") {
        config.store.max_input_length = length;
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Base URL override
    pub base_url: Option<String>,
    /// First-byte timeout override (seconds)
    pub first_byte_timeout_secs: Option<u64>,
    /// Inactivity timeout override (seconds)
    pub inactivity_timeout_secs: Option<u64>,
}

impl ConfigOverrides {
    /// Create an empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set base URL override
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Set first-byte timeout override
    #[must_use]
    pub fn with_first_byte_timeout_secs(mut self, secs: u64) -> Self {
        self.first_byte_timeout_secs = Some(secs);
        self
    }

    /// Set inactivity timeout override
    #[must_use]
    pub fn with_inactivity_timeout_secs(mut self, secs: u64) -> Self {
        self.inactivity_timeout_secs = Some(secs);
        self
    }

    /// Whether any override is set
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.base_url.is_none()
            && self.first_byte_timeout_secs.is_none()
            && self.inactivity_timeout_secs.is_none()
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut ClientConfig) {
        if !self.is_empty() {
            config.source = ConfigSource::Cli;
        }
        if let Some(ref url) = self.base_url {
            config.api.base_url = url.clone();
        }
        if let Some(secs) = self.first_byte_timeout_secs {
            config.stream.first_byte_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.inactivity_timeout_secs {
            config.stream.inactivity_timeout = Duration::from_secs(secs);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
