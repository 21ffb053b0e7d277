//! Connection pooling and circuit breaker module
//!
//! This module provides:
//! - A bounded connection pool with FIFO waiters and idle reaping
//! - A SQLite connector for the pool
//! - A three-state circuit breaker for catalog reads

pub mod circuit;
pub mod connection;
pub mod sqlite;

pub use circuit::{BreakerError, BreakerPermit, CatalogBreaker, CircuitBreakerConfig, CircuitState, CircuitStats};
pub use connection::{ConnectionPool, Connector, PoolConfig, PoolError, PoolStats, PooledConnection};
pub use sqlite::{SqliteConnector, SqlitePool};
