use pureza_api::api::ApiVersion;
use pureza_api::config::Environment;
use std::env;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

/// Test loading configuration from a YAML file
#[test]
fn test_load_yaml_config() {
    let yaml = r#"
environment: test
server:
  listen: "127.0.0.1:9000"
database:
  path: /tmp/pureza/catalog.sqlite
  max_connections: 3
breaker:
  enabled: false
  failure_threshold: 2
  window_ms: 1000
health:
  interval_ms: 5000
  memory_threshold_ratio: 0.8
cache:
  enabled: true
  url: "redis://cache:6380"
api:
  default_version: v2
  v1_sunset_date: "2026-12-31"
  migration_guide_url: "https://docs.example.com/migrate"
"#;

    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yaml");
    fs::write(&config_path, yaml).unwrap();

    let config = pureza_api::config::load_config(Some(config_path.to_str().unwrap())).unwrap();

    assert_eq!(config.environment, Environment::Test);
    assert_eq!(config.server.listen, "127.0.0.1:9000");
    assert_eq!(config.database.max_connections, 3);
    assert!(!config.breaker.enabled);
    assert_eq!(config.breaker_config().window, Duration::from_secs(1));
    assert_eq!(config.health.interval_ms, 5000);
    assert!(config.cache.enabled);
    assert_eq!(config.cache.url, "redis://cache:6380");
    assert_eq!(config.api.default_version, ApiVersion::V2);
    assert_eq!(config.api.v1_sunset_date.as_deref(), Some("2026-12-31"));

    // Test environment never reaps in the background
    assert!(config.pool_config().idle_timeout.is_zero());
}

#[test]
fn test_load_yaml_rejects_invalid_values() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yaml");
    fs::write(&config_path, "breaker:\n  failure_threshold: 0\n").unwrap();

    assert!(pureza_api::config::load_config(Some(config_path.to_str().unwrap())).is_err());
}

#[test]
fn test_missing_config_file() {
    let result = pureza_api::config::load_from_yaml("/nonexistent/pureza.yaml");
    assert!(result.is_err());
}

/// All environment assertions live in one test; the process environment is shared
#[test]
fn test_load_env_config() {
    let vars = [
        ("APP_ENV", "production"),
        ("PORT", "4100"),
        ("DATABASE_PATH", "/tmp/pureza-env.sqlite"),
        ("DB_MAX_CONNECTIONS", "7"),
        ("DB_ACQUIRE_TIMEOUT_MS", "250"),
        ("BREAKER_THRESHOLD", "9"),
        ("BREAKER_WINDOW_MS", "12000"),
        ("BREAKER_OPEN_TIMEOUT", "45000"),
        ("BREAKER_HALF_OPEN_PROBES", "3"),
        ("HEALTH_CHECK_ENABLED", "false"),
        ("HEALTH_CHECK_INTERVAL", "30000"),
        ("REDIS_ENABLED", "yes"),
        ("API_VERSION_DEFAULT", "v2"),
        ("API_V1_SUNSET_DATE", "2027-01-15"),
    ];
    for (key, value) in vars {
        env::set_var(key, value);
    }

    let config = pureza_api::config::load_from_env();

    for (key, _) in vars {
        env::remove_var(key);
    }

    let config = config.unwrap();
    assert_eq!(config.environment, Environment::Production);
    assert_eq!(config.server.listen, "0.0.0.0:4100");
    assert_eq!(config.database.max_connections, 7);
    assert_eq!(config.database.acquire_timeout_ms, Some(250));
    assert_eq!(config.breaker.failure_threshold, 9);
    assert_eq!(config.breaker_config().open_timeout, Duration::from_secs(45));
    assert_eq!(config.breaker.half_open_probes, 3);
    assert!(!config.health.enabled);
    assert_eq!(config.health.interval_ms, 30_000);
    assert!(config.cache.enabled);
    assert_eq!(config.api.default_version, ApiVersion::V2);
    assert!(config.validate().is_ok());
}
