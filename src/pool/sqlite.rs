//! SQLite connector for the connection pool

use rusqlite::Connection;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

use super::connection::{ConnectionPool, Connector, PoolConfig, PoolError};

/// Pool of SQLite connections
pub type SqlitePool = ConnectionPool<SqliteConnector>;

/// Opens tuned SQLite connections on a single database file
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    path: PathBuf,
    verbose: bool,
    busy_timeout: Duration,
}

impl SqliteConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            verbose: false,
            busy_timeout: Duration::from_secs(5),
        }
    }

    /// Build a connector from the pool's `path` and `verbose` settings
    pub fn from_config(config: &PoolConfig) -> Self {
        Self {
            verbose: config.verbose,
            ..Self::new(config.path.clone())
        }
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }
}

fn log_statement(sql: &str) {
    debug!(sql = %sql, "sqlite statement");
}

impl Connector for SqliteConnector {
    type Connection = Connection;

    fn connect(&self) -> Result<Connection, PoolError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    PoolError::ConnectionFailed(format!(
                        "Failed to create database directory {:?}: {}",
                        parent, e
                    ))
                })?;
            }
        }

        let mut conn = Connection::open(&self.path).map_err(|e| {
            PoolError::ConnectionFailed(format!("Failed to open database at {:?}: {}", self.path, e))
        })?;

        conn.busy_timeout(self.busy_timeout)
            .and_then(|_| {
                conn.execute_batch(
                    "PRAGMA journal_mode = WAL;
                     PRAGMA synchronous = NORMAL;
                     PRAGMA foreign_keys = ON;",
                )
            })
            .map_err(|e| PoolError::ConnectionFailed(format!("Failed to configure database: {}", e)))?;

        if self.verbose {
            conn.trace(Some(log_statement));
        }

        debug!(path = ?self.path, "Opened SQLite connection");
        Ok(conn)
    }

    fn close(&self, conn: Connection) {
        if let Err((_, e)) = conn.close() {
            warn!(error = %e, "Failed to close SQLite connection cleanly");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sqlite_pool_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = PoolConfig {
            path: dir.path().join("nested").join("catalog.sqlite"),
            idle_timeout: Duration::ZERO,
            ..Default::default()
        };

        let pool = SqlitePool::new(config.clone(), SqliteConnector::from_config(&config)).unwrap();
        let one: i64 = pool
            .with_connection(|conn| conn.query_row("SELECT 1", [], |row| row.get(0)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(one, 1);

        let mode: String = pool
            .with_connection(|conn| conn.query_row("PRAGMA journal_mode", [], |row| row.get(0)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        pool.close();
    }

    #[test]
    fn test_connect_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "file").unwrap();
        let connector = SqliteConnector::new(blocker.join("catalog.sqlite"));
        let result = connector.connect();
        assert!(matches!(result, Err(PoolError::ConnectionFailed(_))));
    }
}
