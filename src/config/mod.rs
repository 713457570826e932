//! Configuration loading for the listing sync service.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `LISTING_SYNC_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, net::SocketAddr, path::PathBuf};

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;
use utoipa::ToSchema;

/// Prefix shared by every recognised environment variable.
pub const ENV_PREFIX: &str = "LISTING_SYNC_";

/// Application configuration derived from `LISTING_SYNC_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_api_bind_addr")]
    pub api_bind_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    /// Base URL of the destination marketplace API
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_api_base: Option<String>,
    /// Bearer token presented to the destination API
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_api_token: Option<String>,
    #[serde(default)]
    pub sync: SyncEngineConfig,
    #[serde(default)]
    pub rate_limit_policy: RateLimitPolicyConfig,
}

/// What to do with jobs that were still active when the process last stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum RestartPolicy {
    /// Mark interrupted jobs as FAILED and release their keys
    Fail,
    /// Relaunch interrupted jobs from their persisted cursor
    Resume,
}

impl std::str::FromStr for RestartPolicy {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fail" => Ok(RestartPolicy::Fail),
            "resume" => Ok(RestartPolicy::Resume),
            other => Err(ConfigError::InvalidRestartPolicy {
                value: other.to_string(),
            }),
        }
    }
}

/// Sync engine tuning parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SyncEngineConfig {
    /// Timeout applied by the HTTP pusher to a single push call (default: 30)
    ///
    /// Environment variable: `LISTING_SYNC_SYNC_PUSH_TIMEOUT_SECONDS`
    #[serde(default = "default_sync_push_timeout_seconds")]
    pub push_timeout_seconds: u64,

    /// Maximum number of item errors carried in a progress snapshot (default: 50)
    ///
    /// Environment variable: `LISTING_SYNC_SYNC_MAX_SNAPSHOT_ERRORS`
    #[serde(default = "default_sync_max_snapshot_errors")]
    pub max_snapshot_errors: usize,

    /// Largest accepted item count for a single start request (default: 10000)
    ///
    /// Environment variable: `LISTING_SYNC_SYNC_MAX_ITEMS_PER_JOB`
    #[serde(default = "default_sync_max_items_per_job")]
    pub max_items_per_job: usize,

    /// Handling of jobs interrupted by a process restart (default: fail)
    ///
    /// Environment variable: `LISTING_SYNC_SYNC_RESTART_POLICY`
    #[serde(default = "default_sync_restart_policy")]
    pub restart_policy: RestartPolicy,
}

/// Rate limit policy applied when the destination API throttles a push
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct RateLimitPolicyConfig {
    /// Lower bound for any pause, in seconds (default: 1)
    ///
    /// A zero or missing `Retry-After` never produces a pause shorter than this.
    ///
    /// Environment variable: `LISTING_SYNC_RATE_LIMIT_MIN_SECONDS`
    #[serde(default = "default_rate_limit_min_seconds")]
    #[schema(example = 1)]
    pub min_seconds: u64,

    /// Base retry interval in seconds when no hint is given (default: 5)
    ///
    /// Consecutive pauses on the same item use exponential backoff:
    /// base_seconds * 2^pauses.
    ///
    /// Environment variable: `LISTING_SYNC_RATE_LIMIT_BASE_SECONDS`
    #[serde(default = "default_rate_limit_base_seconds")]
    #[schema(example = 5)]
    pub base_seconds: u64,

    /// Maximum retry interval in seconds (default: 900)
    ///
    /// Environment variable: `LISTING_SYNC_RATE_LIMIT_MAX_SECONDS`
    #[serde(default = "default_rate_limit_max_seconds")]
    #[schema(example = 900)]
    pub max_seconds: u64,

    /// Jitter factor applied to computed backoff (default: 0.1, range: 0.0-1.0)
    ///
    /// Server-provided `Retry-After` hints are honoured without jitter.
    ///
    /// Environment variable: `LISTING_SYNC_RATE_LIMIT_JITTER_FACTOR`
    #[serde(default = "default_rate_limit_jitter_factor")]
    #[schema(example = 0.1, minimum = 0.0, maximum = 1.0)]
    pub jitter_factor: f64,

    /// Case-insensitive patterns marking an error message as throttling
    ///
    /// Environment variable: `LISTING_SYNC_RATE_LIMIT_MESSAGE_PATTERNS` (comma-separated)
    #[serde(default = "default_rate_limit_message_patterns")]
    pub message_patterns: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            api_bind_addr: default_api_bind_addr(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            destination_api_base: None,
            destination_api_token: None,
            sync: SyncEngineConfig::default(),
            rate_limit_policy: RateLimitPolicyConfig::default(),
        }
    }
}

impl Default for SyncEngineConfig {
    fn default() -> Self {
        Self {
            push_timeout_seconds: default_sync_push_timeout_seconds(),
            max_snapshot_errors: default_sync_max_snapshot_errors(),
            max_items_per_job: default_sync_max_items_per_job(),
            restart_policy: default_sync_restart_policy(),
        }
    }
}

impl Default for RateLimitPolicyConfig {
    fn default() -> Self {
        Self {
            min_seconds: default_rate_limit_min_seconds(),
            base_seconds: default_rate_limit_base_seconds(),
            max_seconds: default_rate_limit_max_seconds(),
            jitter_factor: default_rate_limit_jitter_factor(),
            message_patterns: default_rate_limit_message_patterns(),
        }
    }
}

impl AppConfig {
    /// Returns the configured bind address as a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.api_bind_addr.parse()
    }

    /// Returns a redacted JSON representation (secrets are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if config.destination_api_token.is_some() {
            config.destination_api_token = Some("[REDACTED]".to_string());
        }
        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration, returning an error if a setting is out of bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(base) = &self.destination_api_base {
            Url::parse(base).map_err(|source| ConfigError::InvalidDestinationApiBase {
                value: base.clone(),
                source,
            })?;
        }

        // Outside local/test a real destination is required
        if !matches!(self.profile.as_str(), "local" | "test")
            && self.destination_api_base.is_none()
        {
            return Err(ConfigError::MissingDestinationApiBase);
        }

        self.sync.validate()?;
        self.rate_limit_policy.validate()?;

        Ok(())
    }
}

impl SyncEngineConfig {
    /// Validate sync engine configuration bounds
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.push_timeout_seconds == 0 || self.push_timeout_seconds > 600 {
            return Err(ConfigError::InvalidPushTimeout {
                value: self.push_timeout_seconds,
            });
        }

        if self.max_snapshot_errors == 0 {
            return Err(ConfigError::InvalidMaxSnapshotErrors {
                value: self.max_snapshot_errors,
            });
        }

        if self.max_items_per_job == 0 {
            return Err(ConfigError::InvalidMaxItemsPerJob {
                value: self.max_items_per_job,
            });
        }

        Ok(())
    }
}

impl RateLimitPolicyConfig {
    /// Validate rate limit policy configuration bounds
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_seconds == 0 {
            return Err(ConfigError::InvalidRateLimitMinimum {
                value: self.min_seconds,
            });
        }

        if self.min_seconds > self.base_seconds || self.base_seconds > self.max_seconds {
            return Err(ConfigError::InvalidRateLimitBounds {
                min: self.min_seconds,
                base: self.base_seconds,
                max: self.max_seconds,
            });
        }

        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::InvalidRateLimitJitter {
                value: self.jitter_factor,
            });
        }

        for pattern in &self.message_patterns {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|source| ConfigError::InvalidRateLimitPattern {
                    pattern: pattern.clone(),
                    source,
                })?;
        }

        Ok(())
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_api_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "sqlite://listing-sync.db?mode=rwc".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_sync_push_timeout_seconds() -> u64 {
    30
}

fn default_sync_max_snapshot_errors() -> usize {
    50
}

fn default_sync_max_items_per_job() -> usize {
    10_000
}

fn default_sync_restart_policy() -> RestartPolicy {
    RestartPolicy::Fail
}

fn default_rate_limit_min_seconds() -> u64 {
    1
}

fn default_rate_limit_base_seconds() -> u64 {
    5
}

fn default_rate_limit_max_seconds() -> u64 {
    900 // 15 minutes
}

fn default_rate_limit_jitter_factor() -> f64 {
    0.1 // 10% jitter
}

fn default_rate_limit_message_patterns() -> Vec<String> {
    ["rate limit", "too many requests", "throttl", "quota exceeded"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid api bind address '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error("invalid destination API base '{value}': {source}")]
    InvalidDestinationApiBase {
        value: String,
        source: url::ParseError,
    },
    #[error(
        "destination API base is missing; set LISTING_SYNC_DESTINATION_API_BASE environment variable"
    )]
    MissingDestinationApiBase,
    #[error("push timeout must be between 1 and 600 seconds, got {value}")]
    InvalidPushTimeout { value: u64 },
    #[error("max snapshot errors must be positive, got {value}")]
    InvalidMaxSnapshotErrors { value: usize },
    #[error("max items per job must be positive, got {value}")]
    InvalidMaxItemsPerJob { value: usize },
    #[error("restart policy must be one of fail, resume; got '{value}'")]
    InvalidRestartPolicy { value: String },
    #[error("rate limit minimum must be at least 1 second, got {value}")]
    InvalidRateLimitMinimum { value: u64 },
    #[error("rate limit bounds must satisfy min ({min}) <= base ({base}) <= max ({max})")]
    InvalidRateLimitBounds { min: u64, base: u64, max: u64 },
    #[error("rate limit jitter factor must be between 0.0 and 1.0, got {value}")]
    InvalidRateLimitJitter { value: f64 },
    #[error("invalid rate limit message pattern '{pattern}': {source}")]
    InvalidRateLimitPattern {
        pattern: String,
        source: regex::Error,
    },
}

/// Loads configuration using layered `.env` files and `LISTING_SYNC_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads configuration: `.env`, `.env.local`, `.env.<profile>`,
    /// `.env.<profile>.local`, then the process environment.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = layered
            .remove("PROFILE")
            .filter(|v| !v.is_empty())
            .unwrap_or(profile_hint);
        let api_bind_addr = layered
            .remove("API_BIND_ADDR")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_api_bind_addr);
        let log_level = layered
            .remove("LOG_LEVEL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_level);
        let log_format = layered
            .remove("LOG_FORMAT")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_format);
        let database_url = layered
            .remove("DATABASE_URL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_database_url);
        let db_max_connections = layered
            .remove("DB_MAX_CONNECTIONS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_db_max_connections);
        let db_acquire_timeout_ms = layered
            .remove("DB_ACQUIRE_TIMEOUT_MS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_db_acquire_timeout_ms);

        let destination_api_base = non_empty_trimmed(layered.remove("DESTINATION_API_BASE"));
        let destination_api_token = non_empty_trimmed(layered.remove("DESTINATION_API_TOKEN"));

        // Parse sync engine configuration
        let push_timeout_seconds = layered
            .remove("SYNC_PUSH_TIMEOUT_SECONDS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_sync_push_timeout_seconds);
        let max_snapshot_errors = layered
            .remove("SYNC_MAX_SNAPSHOT_ERRORS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_sync_max_snapshot_errors);
        let max_items_per_job = layered
            .remove("SYNC_MAX_ITEMS_PER_JOB")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_sync_max_items_per_job);
        // An explicit but unknown policy is an error rather than a silent default
        let restart_policy = match non_empty_trimmed(layered.remove("SYNC_RESTART_POLICY")) {
            Some(value) => value.parse()?,
            None => default_sync_restart_policy(),
        };

        // Parse rate limit policy configuration
        let rate_limit_min_seconds = layered
            .remove("RATE_LIMIT_MIN_SECONDS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_rate_limit_min_seconds);
        let rate_limit_base_seconds = layered
            .remove("RATE_LIMIT_BASE_SECONDS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_rate_limit_base_seconds);
        let rate_limit_max_seconds = layered
            .remove("RATE_LIMIT_MAX_SECONDS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_rate_limit_max_seconds);
        let rate_limit_jitter_factor = layered
            .remove("RATE_LIMIT_JITTER_FACTOR")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_rate_limit_jitter_factor);
        let rate_limit_message_patterns = layered
            .remove("RATE_LIMIT_MESSAGE_PATTERNS")
            .map(|patterns| {
                patterns
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_else(default_rate_limit_message_patterns);

        let config = AppConfig {
            profile,
            api_bind_addr,
            log_level,
            log_format,
            database_url,
            db_max_connections,
            db_acquire_timeout_ms,
            destination_api_base,
            destination_api_token,
            sync: SyncEngineConfig {
                push_timeout_seconds,
                max_snapshot_errors,
                max_items_per_job,
                restart_policy,
            },
            rate_limit_policy: RateLimitPolicyConfig {
                min_seconds: rate_limit_min_seconds,
                base_seconds: rate_limit_base_seconds,
                max_seconds: rate_limit_max_seconds,
                jitter_factor: rate_limit_jitter_factor,
                message_patterns: rate_limit_message_patterns,
            },
        };

        // Validate configuration
        config.validate()?;

        match config.bind_addr() {
            Ok(_) => Ok(config),
            Err(source) => Err(ConfigError::InvalidBindAddr {
                value: config.api_bind_addr.clone(),
                source,
            }),
        }
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var(format!("{}PROFILE", ENV_PREFIX))
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn non_empty_trimmed(value: Option<String>) -> Option<String> {
    value.and_then(|val| {
        let trimmed = val.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
