//! Built-in probes: database, cache, filesystem and memory

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::debug;

use super::{with_timeout, HealthCheckResult, HealthProbe};
use crate::pool::SqlitePool;

/// `SELECT 1` through the connection pool
pub struct DatabaseProbe {
    pool: Arc<SqlitePool>,
    timeout: Duration,
}

impl DatabaseProbe {
    pub fn new(pool: Arc<SqlitePool>, timeout: Duration) -> Self {
        Self { pool, timeout }
    }
}

#[async_trait]
impl HealthProbe for DatabaseProbe {
    fn name(&self) -> &str {
        "database"
    }

    async fn check(&self) -> Result<HealthCheckResult> {
        let started = Instant::now();

        let query = self
            .pool
            .with_connection(|conn| conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)));
        with_timeout(query, self.timeout, "database").await???;

        Ok(HealthCheckResult::healthy("database").with_duration(started.elapsed()))
    }
}

/// Redis `PING` over a plain TCP connection
pub struct CacheProbe {
    enabled: bool,
    url: String,
    timeout: Duration,
}

impl CacheProbe {
    pub fn new(enabled: bool, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            enabled,
            url: url.into(),
            timeout,
        }
    }

    async fn ping(&self) -> Result<()> {
        let url = url::Url::parse(&self.url).context(format!("Invalid cache URL: {}", self.url))?;
        let host = url.host_str().unwrap_or("127.0.0.1");
        let port = url.port().unwrap_or(6379);

        let stream = TcpStream::connect((host, port))
            .await
            .context(format!("Failed to connect to cache at {}:{}", host, port))?;
        let mut stream = BufReader::new(stream);
        let mut line = String::new();

        if let Some(password) = url.password() {
            let user = url.username();
            let command = if user.is_empty() {
                resp_command(&["AUTH", password])
            } else {
                resp_command(&["AUTH", user, password])
            };
            stream.get_mut().write_all(command.as_bytes()).await?;
            stream.read_line(&mut line).await?;
            if !line.starts_with("+OK") {
                anyhow::bail!("Cache authentication failed: {}", line.trim_end());
            }
            line.clear();
        }

        stream.get_mut().write_all(resp_command(&["PING"]).as_bytes()).await?;
        stream.read_line(&mut line).await?;

        if !line.starts_with("+PONG") {
            anyhow::bail!("Unexpected PING reply: {}", line.trim_end());
        }
        Ok(())
    }
}

fn resp_command(args: &[&str]) -> String {
    let mut out = format!("*{}\r\n", args.len());
    for arg in args {
        out.push_str(&format!("${}\r\n{}\r\n", arg.len(), arg));
    }
    out
}

#[async_trait]
impl HealthProbe for CacheProbe {
    fn name(&self) -> &str {
        "redis"
    }

    async fn check(&self) -> Result<HealthCheckResult> {
        if !self.enabled {
            return Ok(HealthCheckResult::healthy("redis").with_details(json!({ "enabled": false })));
        }

        let started = Instant::now();
        with_timeout(self.ping(), self.timeout, "redis").await??;
        Ok(HealthCheckResult::healthy("redis").with_duration(started.elapsed()))
    }
}

const FILESYSTEM_MARKER: &str = "healthy";

/// Write, read back and delete a scratch file
pub struct FilesystemProbe {
    dir: PathBuf,
    timeout: Duration,
}

impl FilesystemProbe {
    pub fn new(timeout: Duration) -> Self {
        Self::in_dir(std::env::temp_dir(), timeout)
    }

    pub fn in_dir(dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            dir: dir.into(),
            timeout,
        }
    }

    fn scratch_path(&self) -> PathBuf {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(10)
            .map(char::from)
            .collect();
        let millis = chrono::Utc::now().timestamp_millis();
        self.dir.join(format!("health-check-{}-{}.tmp", millis, suffix))
    }
}

#[async_trait]
impl HealthProbe for FilesystemProbe {
    fn name(&self) -> &str {
        "filesystem"
    }

    async fn check(&self) -> Result<HealthCheckResult> {
        let started = Instant::now();
        let path = self.scratch_path();

        let round_trip = async {
            tokio::fs::write(&path, FILESYSTEM_MARKER)
                .await
                .context(format!("Failed to write {:?}", path))?;
            let contents = tokio::fs::read_to_string(&path)
                .await
                .context(format!("Failed to read {:?}", path))?;
            if contents != FILESYSTEM_MARKER {
                anyhow::bail!("Filesystem returned unexpected content");
            }
            Ok::<_, anyhow::Error>(())
        };
        let outcome = with_timeout(round_trip, self.timeout, "filesystem").await;

        if let Err(e) = tokio::fs::remove_file(&path).await {
            debug!(path = ?path, error = %e, "Failed to remove health check file");
        }
        outcome??;

        Ok(HealthCheckResult::healthy("filesystem").with_duration(started.elapsed()))
    }
}

/// Used system memory against a ratio threshold
pub struct MemoryProbe {
    threshold: f64,
    meminfo: PathBuf,
}

impl MemoryProbe {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            meminfo: PathBuf::from("/proc/meminfo"),
        }
    }
}

/// `(total, available)` in bytes from `/proc/meminfo` contents
pub fn parse_meminfo(contents: &str) -> Option<(u64, u64)> {
    let field = |name: &str| {
        contents
            .lines()
            .find_map(|line| line.strip_prefix(name))
            .and_then(|rest| rest.trim_start_matches(':').split_whitespace().next())
            .and_then(|kb| kb.parse::<u64>().ok())
            .map(|kb| kb * 1024)
    };

    let total = field("MemTotal")?;
    let available = field("MemAvailable").or_else(|| field("MemFree"))?;
    Some((total, available))
}

#[async_trait]
impl HealthProbe for MemoryProbe {
    fn name(&self) -> &str {
        "memory"
    }

    async fn check(&self) -> Result<HealthCheckResult> {
        let usage = tokio::fs::read_to_string(&self.meminfo)
            .await
            .ok()
            .and_then(|contents| parse_meminfo(&contents));

        let Some((total, available)) = usage else {
            return Ok(HealthCheckResult::healthy("memory")
                .with_details(json!({ "supported": false, "threshold": self.threshold })));
        };

        let used = total.saturating_sub(available);
        let ratio = if total > 0 { used as f64 / total as f64 } else { 0.0 };
        let rounded = (ratio * 1000.0).round() / 1000.0;

        let result = HealthCheckResult {
            healthy: ratio < self.threshold,
            ..HealthCheckResult::healthy("memory")
        };
        Ok(result.with_details(json!({
            "usedBytes": used,
            "totalBytes": total,
            "ratio": rounded,
            "threshold": self.threshold,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{PoolConfig, SqliteConnector};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    const MEMINFO: &str = "MemTotal:       16000000 kB\nMemFree:         1000000 kB\nMemAvailable:    4000000 kB\n";

    #[test]
    fn test_parse_meminfo() {
        assert_eq!(parse_meminfo(MEMINFO), Some((16_000_000 * 1024, 4_000_000 * 1024)));
        assert_eq!(parse_meminfo("MemTotal: 100 kB\nMemFree: 40 kB\n"), Some((102_400, 40_960)));
        assert_eq!(parse_meminfo("garbage"), None);
    }

    #[test]
    fn test_resp_command() {
        assert_eq!(resp_command(&["PING"]), "*1\r\n$4\r\nPING\r\n");
    }

    #[tokio::test]
    async fn test_memory_probe_against_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let meminfo = dir.path().join("meminfo");
        std::fs::write(&meminfo, MEMINFO).unwrap();

        let probe = MemoryProbe {
            threshold: 0.7,
            meminfo: meminfo.clone(),
        };
        let result = probe.check().await.unwrap();
        assert!(!result.healthy);
        assert_eq!(result.details.unwrap()["ratio"], 0.75);

        let probe = MemoryProbe { threshold: 0.8, meminfo };
        assert!(probe.check().await.unwrap().healthy);
    }

    #[tokio::test]
    async fn test_memory_probe_unsupported() {
        let probe = MemoryProbe {
            threshold: 0.9,
            meminfo: PathBuf::from("/nonexistent/meminfo"),
        };
        let result = probe.check().await.unwrap();
        assert!(result.healthy);
        assert_eq!(result.details.unwrap()["supported"], false);
    }

    #[tokio::test]
    async fn test_filesystem_probe_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let probe = FilesystemProbe::in_dir(dir.path(), Duration::from_secs(2));

        let result = probe.check().await.unwrap();

        assert!(result.healthy);
        assert!(result.duration_ms.is_some());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_filesystem_probe_missing_dir_fails() {
        let probe = FilesystemProbe::in_dir("/nonexistent/health", Duration::from_secs(2));
        assert!(probe.check().await.is_err());
    }

    #[tokio::test]
    async fn test_cache_probe_disabled() {
        let probe = CacheProbe::new(false, "redis://127.0.0.1:1", Duration::from_secs(2));
        let result = probe.check().await.unwrap();
        assert!(result.healthy);
        assert_eq!(result.details, Some(json!({ "enabled": false })));
    }

    #[tokio::test]
    async fn test_cache_probe_ping() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = socket.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"*1\r\n$4\r\nPING\r\n");
            socket.write_all(b"+PONG\r\n").await.unwrap();
        });

        let probe = CacheProbe::new(true, format!("redis://127.0.0.1:{}", port), Duration::from_secs(2));
        assert!(probe.check().await.unwrap().healthy);
    }

    #[tokio::test]
    async fn test_cache_probe_unexpected_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = socket.read(&mut buf).await.unwrap();
            socket.write_all(b"-ERR loading\r\n").await.unwrap();
        });

        let probe = CacheProbe::new(true, format!("redis://127.0.0.1:{}", port), Duration::from_secs(2));
        let err = probe.check().await.unwrap_err();
        assert!(err.to_string().contains("-ERR loading"));
    }

    #[tokio::test]
    async fn test_database_probe() {
        let dir = tempfile::tempdir().unwrap();
        let config = PoolConfig {
            path: dir.path().join("health.sqlite"),
            idle_timeout: Duration::ZERO,
            ..Default::default()
        };
        let pool = SqlitePool::new(config.clone(), SqliteConnector::from_config(&config)).unwrap();
        let probe = DatabaseProbe::new(Arc::new(pool), Duration::from_secs(5));

        let result = probe.check().await.unwrap();
        assert!(result.healthy);
        assert_eq!(result.name, "database");
    }
}
