use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::api::ApiVersion;
use crate::pool::{CircuitBreakerConfig, PoolConfig};

/// Runtime environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
    /// Background reaping and health polling are not started
    Test,
}

impl FromStr for Environment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            "test" => Ok(Environment::Test),
            other => anyhow::bail!("Unknown environment: {}", other),
        }
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address (default: 0.0.0.0:3001)
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_listen() -> String {
    "0.0.0.0:3001".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

/// Database pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database file
    #[serde(default = "default_database_path")]
    pub path: PathBuf,

    /// Maximum pooled connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Idle reaping period in milliseconds (0 disables reaping)
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Optional bound on waiting for a free connection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acquire_timeout_ms: Option<u64>,

    /// Log every SQL statement at debug level
    #[serde(default)]
    pub verbose: bool,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./database.sqlite")
}

fn default_max_connections() -> usize {
    5
}

fn default_idle_timeout_ms() -> u64 {
    60_000
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            max_connections: default_max_connections(),
            idle_timeout_ms: default_idle_timeout_ms(),
            acquire_timeout_ms: None,
            verbose: false,
        }
    }
}

/// Catalog circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Guard catalog reads with the breaker
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,

    #[serde(default = "default_half_open_probes")]
    pub half_open_probes: u32,
}

fn default_true() -> bool {
    true
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_window_ms() -> u64 {
    30_000
}

fn default_open_timeout_ms() -> u64 {
    60_000
}

fn default_half_open_probes() -> u32 {
    2
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: default_failure_threshold(),
            window_ms: default_window_ms(),
            open_timeout_ms: default_open_timeout_ms(),
            half_open_probes: default_half_open_probes(),
        }
    }
}

/// Health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Polling period in milliseconds
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,

    #[serde(default = "default_database_timeout_ms")]
    pub database_timeout_ms: u64,

    #[serde(default = "default_probe_timeout_ms")]
    pub cache_timeout_ms: u64,

    #[serde(default = "default_probe_timeout_ms")]
    pub filesystem_timeout_ms: u64,

    /// Used/total memory ratio above which the memory probe is unhealthy
    #[serde(default = "default_memory_threshold_ratio")]
    pub memory_threshold_ratio: f64,
}

fn default_health_interval_ms() -> u64 {
    15_000
}

fn default_database_timeout_ms() -> u64 {
    5_000
}

fn default_probe_timeout_ms() -> u64 {
    2_000
}

fn default_memory_threshold_ratio() -> f64 {
    0.9
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_health_interval_ms(),
            database_timeout_ms: default_database_timeout_ms(),
            cache_timeout_ms: default_probe_timeout_ms(),
            filesystem_timeout_ms: default_probe_timeout_ms(),
            memory_threshold_ratio: default_memory_threshold_ratio(),
        }
    }
}

/// Cache (Redis) connectivity, probed by the health checks only
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_cache_url")]
    pub url: String,
}

fn default_cache_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_cache_url(),
        }
    }
}

/// API versioning configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Version used when a request does not name one
    #[serde(default)]
    pub default_version: ApiVersion,

    /// Date the v1 API stops being served (ISO date or RFC 3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v1_sunset_date: Option<String>,

    /// Target of the `Link: <...>; rel="deprecation"` header
    #[serde(default = "default_migration_guide_url")]
    pub migration_guide_url: String,
}

fn default_migration_guide_url() -> String {
    "/docs/api/MIGRATION_v1_to_v2.md".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            default_version: ApiVersion::default(),
            v1_sunset_date: None,
            migration_guide_url: default_migration_guide_url(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub environment: Environment,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub api: ApiConfig,
}

impl Config {
    /// Create a configuration with every default applied
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_test(&self) -> bool {
        self.environment == Environment::Test
    }

    /// Pool settings; reaping is disabled in the test environment
    pub fn pool_config(&self) -> PoolConfig {
        let idle_timeout = if self.is_test() {
            Duration::ZERO
        } else {
            Duration::from_millis(self.database.idle_timeout_ms)
        };

        PoolConfig {
            max_connections: self.database.max_connections,
            idle_timeout,
            path: self.database.path.clone(),
            verbose: self.database.verbose,
            acquire_timeout: self.database.acquire_timeout_ms.map(Duration::from_millis),
        }
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.breaker.failure_threshold,
            window: Duration::from_millis(self.breaker.window_ms),
            open_timeout: Duration::from_millis(self.breaker.open_timeout_ms),
            half_open_probes: self.breaker.half_open_probes,
        }
    }

    /// Reject settings the components cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.database.max_connections == 0 {
            anyhow::bail!("database.max_connections must be at least 1");
        }
        if self.breaker.failure_threshold == 0 {
            anyhow::bail!("breaker.failure_threshold must be at least 1");
        }
        if self.breaker.half_open_probes == 0 {
            anyhow::bail!("breaker.half_open_probes must be at least 1");
        }
        if self.health.interval_ms == 0 {
            anyhow::bail!("health.interval_ms must be greater than 0");
        }
        if !(0.0..=1.0).contains(&self.health.memory_threshold_ratio) {
            anyhow::bail!("health.memory_threshold_ratio must be between 0 and 1");
        }
        if let Some(date) = &self.api.v1_sunset_date {
            if crate::api::deprecation::parse_sunset_date(date).is_none() {
                anyhow::bail!("api.v1_sunset_date must be a valid ISO date: {}", date);
            }
        }
        Ok(())
    }
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: Config = serde_yaml::from_str(&content)
        .context("Failed to parse YAML configuration")?;

    Ok(config)
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let value = std::env::var(key).ok()?;
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(key, value = %value, "Ignoring unparseable environment variable");
            None
        }
    }
}

fn env_bool(key: &str) -> Option<bool> {
    let value = std::env::var(key).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            warn!(key, value = %value, "Ignoring unparseable boolean environment variable");
            None
        }
    }
}

/// Load configuration from environment variables
///
/// Every variable is optional:
/// - APP_ENV (development, production, test)
/// - LISTEN, or PORT to listen on 0.0.0.0:PORT
/// - DATABASE_PATH, DB_MAX_CONNECTIONS, DB_IDLE_TIMEOUT_MS, DB_ACQUIRE_TIMEOUT_MS, DB_VERBOSE
/// - BREAKER_ENABLED, BREAKER_THRESHOLD, BREAKER_WINDOW_MS, BREAKER_OPEN_TIMEOUT, BREAKER_HALF_OPEN_PROBES
/// - HEALTH_CHECK_ENABLED, HEALTH_CHECK_INTERVAL
/// - REDIS_ENABLED, REDIS_URL
/// - API_VERSION_DEFAULT, API_V1_SUNSET_DATE, API_MIGRATION_GUIDE_URL
pub fn load_from_env() -> Result<Config> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    let mut config = Config::new();

    if let Ok(env) = std::env::var("APP_ENV") {
        config.environment = env.parse().context("Invalid APP_ENV")?;
    }

    if let Ok(listen) = std::env::var("LISTEN") {
        config.server.listen = listen;
    } else if let Some(port) = env_parse::<u16>("PORT") {
        config.server.listen = format!("0.0.0.0:{}", port);
    }

    if let Ok(path) = std::env::var("DATABASE_PATH") {
        config.database.path = PathBuf::from(path);
    }
    if let Some(val) = env_parse("DB_MAX_CONNECTIONS") {
        config.database.max_connections = val;
    }
    if let Some(val) = env_parse("DB_IDLE_TIMEOUT_MS") {
        config.database.idle_timeout_ms = val;
    }
    if let Some(val) = env_parse("DB_ACQUIRE_TIMEOUT_MS") {
        config.database.acquire_timeout_ms = Some(val);
    }
    if let Some(val) = env_bool("DB_VERBOSE") {
        config.database.verbose = val;
    }

    if let Some(val) = env_bool("BREAKER_ENABLED") {
        config.breaker.enabled = val;
    }
    if let Some(val) = env_parse("BREAKER_THRESHOLD") {
        config.breaker.failure_threshold = val;
    }
    if let Some(val) = env_parse("BREAKER_WINDOW_MS") {
        config.breaker.window_ms = val;
    }
    if let Some(val) = env_parse("BREAKER_OPEN_TIMEOUT") {
        config.breaker.open_timeout_ms = val;
    }
    if let Some(val) = env_parse("BREAKER_HALF_OPEN_PROBES") {
        config.breaker.half_open_probes = val;
    }

    if let Some(val) = env_bool("HEALTH_CHECK_ENABLED") {
        config.health.enabled = val;
    }
    if let Some(val) = env_parse("HEALTH_CHECK_INTERVAL") {
        config.health.interval_ms = val;
    }

    if let Some(val) = env_bool("REDIS_ENABLED") {
        config.cache.enabled = val;
    }
    if let Ok(url) = std::env::var("REDIS_URL") {
        config.cache.url = url;
    }

    if let Ok(version) = std::env::var("API_VERSION_DEFAULT") {
        config.api.default_version = version
            .parse()
            .map_err(|_| anyhow::anyhow!("API_VERSION_DEFAULT must be v1 or v2, got {}", version))?;
    }
    if let Ok(date) = std::env::var("API_V1_SUNSET_DATE") {
        config.api.v1_sunset_date = Some(date);
    }
    if let Ok(url) = std::env::var("API_MIGRATION_GUIDE_URL") {
        config.api.migration_guide_url = url;
    }

    Ok(config)
}

/// Load configuration from file or environment, then validate it
///
/// A YAML file is used when a path is given; otherwise environment variables
/// (and their defaults) are used.
pub fn load_config(config_path: Option<&str>) -> Result<Config> {
    let config = match config_path {
        Some(path) => load_from_yaml(path)?,
        None => load_from_env()?,
    };
    config.validate()?;
    Ok(config)
}
