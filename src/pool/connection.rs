//! Bounded connection pool with FIFO waiters and idle reaping
//!
//! This module provides a generic pool of storage handles with:
//! - Lazy creation up to `max_connections`
//! - LIFO reuse of idle connections (the most recently released one is handed out first)
//! - A FIFO queue of waiters that `release` hands connections to directly
//! - Optional acquire timeout
//! - Periodic reaping of idle connections beyond the first

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Error types for connection pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Failed to open connection: {0}")]
    ConnectionFailed(String),

    #[error("Timed out after {0:?} waiting for a free connection")]
    AcquireTimeout(Duration),

    #[error("Connection pool is closed")]
    Closed,
}

/// Creates and destroys the raw connections a pool hands out
pub trait Connector: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Open a new connection. Errors propagate to the caller of `acquire`.
    fn connect(&self) -> Result<Self::Connection, PoolError>;

    /// Close a connection the pool no longer tracks
    fn close(&self, conn: Self::Connection) {
        drop(conn);
    }
}

/// Configuration for connection pool behavior
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections (idle + in use)
    pub max_connections: usize,

    /// Reaping period for idle connections; zero disables reaping
    pub idle_timeout: Duration,

    /// Database file path
    pub path: PathBuf,

    /// Log every statement executed on pooled connections
    pub verbose: bool,

    /// Give up waiting for a free connection after this long
    pub acquire_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            idle_timeout: Duration::from_secs(60),
            path: PathBuf::from("./database.sqlite"),
            verbose: false,
            acquire_timeout: None,
        }
    }
}

/// Statistics for a connection pool
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    /// Idle connections ready to be handed out
    pub available: usize,

    /// Connections currently checked out
    pub in_use: usize,

    /// Idle plus in use
    pub total: usize,

    /// Configured maximum
    pub max: usize,

    /// Reaping period in milliseconds
    pub idle_timeout_ms: u64,

    /// Callers queued for a connection
    pub waiting: usize,

    /// Connections opened since the pool was created
    pub total_created: u64,

    /// Acquisitions served from the idle list
    pub total_reused: u64,
}

struct Slot<C> {
    id: u64,
    conn: C,
    created_at: Instant,
    use_count: u64,
}

struct PoolState<C> {
    idle: Vec<Slot<C>>,
    in_use: HashSet<u64>,
    /// Connections being opened outside the lock
    opening: usize,
    waiters: VecDeque<oneshot::Sender<Slot<C>>>,
    closed: bool,
    next_id: u64,
    total_created: u64,
    total_reused: u64,
}

impl<C> PoolState<C> {
    fn total(&self) -> usize {
        self.idle.len() + self.in_use.len() + self.opening
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

struct PoolShared<M: Connector> {
    connector: M,
    config: PoolConfig,
    state: Mutex<PoolState<M::Connection>>,
}

impl<M: Connector> PoolShared<M> {
    /// Return a checked-out slot to the pool or to the oldest live waiter
    fn release_slot(&self, mut slot: Slot<M::Connection>) {
        let mut state = self.state.lock();

        if !state.in_use.remove(&slot.id) {
            drop(state);
            debug!(connection_id = slot.id, "Releasing untracked connection, closing it");
            self.connector.close(slot.conn);
            return;
        }

        while let Some(waiter) = state.waiters.pop_front() {
            state.in_use.insert(slot.id);
            slot.use_count += 1;
            match waiter.send(slot) {
                Ok(()) => {
                    state.total_reused += 1;
                    return;
                }
                Err(returned) => {
                    // Waiter gave up (timeout or cancelled)
                    slot = returned;
                    slot.use_count -= 1;
                    state.in_use.remove(&slot.id);
                }
            }
        }

        state.idle.push(slot);
    }

    /// Close every idle connection beyond the first
    fn reap_idle(&self) -> usize {
        let reaped: Vec<Slot<M::Connection>> = {
            let mut state = self.state.lock();
            if state.idle.len() <= 1 {
                return 0;
            }
            state.idle.drain(1..).collect()
        };

        let count = reaped.len();
        for slot in reaped {
            debug!(
                connection_id = slot.id,
                use_count = slot.use_count,
                age_secs = slot.created_at.elapsed().as_secs(),
                "Closed idle database connection"
            );
            self.connector.close(slot.conn);
        }
        count
    }
}

/// A connection checked out of the pool
///
/// Dereferences to the raw connection and returns it to the pool when dropped.
pub struct PooledConnection<M: Connector> {
    slot: Option<Slot<M::Connection>>,
    pool: Arc<PoolShared<M>>,
}

impl<M: Connector> std::fmt::Debug for PooledConnection<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id())
            .field("use_count", &self.use_count())
            .finish()
    }
}

impl<M: Connector> PooledConnection<M> {
    /// Pool-unique identifier of this connection
    pub fn id(&self) -> u64 {
        self.slot.as_ref().map(|s| s.id).unwrap_or_default()
    }

    /// How many times this connection has been handed out
    pub fn use_count(&self) -> u64 {
        self.slot.as_ref().map(|s| s.use_count).unwrap_or_default()
    }
}

impl<M: Connector> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        match &self.slot {
            Some(slot) => &slot.conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl<M: Connector> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.slot {
            Some(slot) => &mut slot.conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl<M: Connector> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.release_slot(slot);
        }
    }
}

enum Checkout<C> {
    Ready(Slot<C>),
    Open,
    Wait(oneshot::Receiver<Slot<C>>),
}

/// Bounded pool of storage connections
pub struct ConnectionPool<M: Connector> {
    shared: Arc<PoolShared<M>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl<M: Connector> ConnectionPool<M> {
    /// Create a pool, open the bootstrap connection and start idle reaping
    ///
    /// Reaping is skipped when `idle_timeout` is zero or no tokio runtime is running.
    pub fn new(config: PoolConfig, connector: M) -> Result<Self, PoolError> {
        let bootstrap = connector.connect()?;
        let now = Instant::now();

        let state = PoolState {
            idle: vec![Slot {
                id: 1,
                conn: bootstrap,
                created_at: now,
                use_count: 0,
            }],
            in_use: HashSet::new(),
            opening: 0,
            waiters: VecDeque::new(),
            closed: false,
            next_id: 1,
            total_created: 1,
            total_reused: 0,
        };

        let pool = Self {
            shared: Arc::new(PoolShared {
                connector,
                config,
                state: Mutex::new(state),
            }),
            reaper: Mutex::new(None),
        };

        pool.start_reaper();

        info!(
            max_connections = pool.shared.config.max_connections,
            idle_timeout_ms = pool.shared.config.idle_timeout.as_millis() as u64,
            "Connection pool created"
        );

        Ok(pool)
    }

    /// Pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Check out a connection, waiting in FIFO order if the pool is exhausted
    pub async fn acquire(&self) -> Result<PooledConnection<M>, PoolError> {
        let deadline = self
            .shared
            .config
            .acquire_timeout
            .map(|timeout| (Instant::now() + timeout, timeout));

        loop {
            let mut rx = match self.checkout()? {
                Checkout::Ready(slot) => return Ok(self.wrap(slot)),
                Checkout::Open => return self.open_connection(),
                Checkout::Wait(rx) => rx,
            };

            let received = match deadline {
                Some((at, timeout)) => match tokio::time::timeout_at(at, &mut rx).await {
                    Ok(received) => received,
                    Err(_) => {
                        // Refuse further hand-offs, then keep one that raced in
                        rx.close();
                        match rx.try_recv() {
                            Ok(slot) => Ok(slot),
                            Err(_) => {
                                warn!(timeout_ms = timeout.as_millis() as u64, "Timed out waiting for connection");
                                return Err(PoolError::AcquireTimeout(timeout));
                            }
                        }
                    }
                },
                None => (&mut rx).await,
            };

            match received {
                Ok(slot) => return Ok(self.wrap(slot)),
                Err(_) => {
                    if self.shared.state.lock().closed {
                        return Err(PoolError::Closed);
                    }
                    debug!("Woken without a connection, retrying acquire");
                }
            }
        }
    }

    /// Return a connection to the pool
    ///
    /// A connection this pool does not track is left alone; it goes back to
    /// its own pool when dropped.
    pub fn release(&self, mut conn: PooledConnection<M>) {
        if !Arc::ptr_eq(&self.shared, &conn.pool) {
            debug!(connection_id = conn.id(), "Ignoring release of a connection from another pool");
            return;
        }
        if let Some(slot) = conn.slot.take() {
            self.shared.release_slot(slot);
        }
    }

    /// Run `f` with a pooled connection, releasing it on every exit path
    pub async fn with_connection<T, F>(&self, f: F) -> Result<T, PoolError>
    where
        F: FnOnce(&mut M::Connection) -> T,
    {
        let mut conn = self.acquire().await?;
        Ok(f(&mut conn))
    }

    /// Close every idle connection beyond the first; returns how many were closed
    pub fn reap_idle(&self) -> usize {
        self.shared.reap_idle()
    }

    /// Shut the pool down
    ///
    /// Idle connections are closed now; checked-out connections are closed
    /// when their holders release them. Waiters fail with `PoolError::Closed`.
    pub fn close(&self) {
        if let Some(handle) = self.reaper.lock().take() {
            handle.abort();
        }

        let idle = {
            let mut state = self.shared.state.lock();
            if state.closed {
                debug!("Connection pool already closed");
                return;
            }
            state.closed = true;
            state.in_use.clear();
            state.waiters.clear();
            std::mem::take(&mut state.idle)
        };

        for slot in idle {
            self.shared.connector.close(slot.conn);
        }

        info!("Connection pool closed");
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        let available = state.idle.len();
        let in_use = state.in_use.len();

        PoolStats {
            available,
            in_use,
            total: available + in_use,
            max: self.shared.config.max_connections,
            idle_timeout_ms: self.shared.config.idle_timeout.as_millis() as u64,
            waiting: state.waiters.iter().filter(|w| !w.is_closed()).count(),
            total_created: state.total_created,
            total_reused: state.total_reused,
        }
    }

    fn checkout(&self) -> Result<Checkout<M::Connection>, PoolError> {
        let mut state = self.shared.state.lock();

        if state.closed {
            return Err(PoolError::Closed);
        }

        if let Some(mut slot) = state.idle.pop() {
            state.in_use.insert(slot.id);
            state.total_reused += 1;
            slot.use_count += 1;
            return Ok(Checkout::Ready(slot));
        }

        if state.total() < self.shared.config.max_connections {
            state.opening += 1;
            return Ok(Checkout::Open);
        }

        state.waiters.retain(|w| !w.is_closed());
        let (tx, rx) = oneshot::channel();
        state.waiters.push_back(tx);
        debug!(waiting = state.waiters.len(), "Pool exhausted, queueing for a connection");
        Ok(Checkout::Wait(rx))
    }

    /// Open a connection for a slot reserved by `checkout`
    fn open_connection(&self) -> Result<PooledConnection<M>, PoolError> {
        let result = self.shared.connector.connect();
        let mut state = self.shared.state.lock();
        state.opening -= 1;

        match result {
            Ok(conn) => {
                if state.closed {
                    drop(state);
                    self.shared.connector.close(conn);
                    return Err(PoolError::Closed);
                }
                let id = state.next_id();
                state.in_use.insert(id);
                state.total_created += 1;
                debug!(connection_id = id, total = state.total(), "New database connection created for pool");
                drop(state);

                Ok(self.wrap(Slot {
                    id,
                    conn,
                    created_at: Instant::now(),
                    use_count: 1,
                }))
            }
            Err(e) => {
                // The reserved slot is free again; let one waiter re-evaluate
                if let Some(waiter) = state.waiters.pop_front() {
                    drop(waiter);
                }
                warn!(error = %e, "Failed to open pooled connection");
                Err(e)
            }
        }
    }

    fn wrap(&self, slot: Slot<M::Connection>) -> PooledConnection<M> {
        PooledConnection {
            slot: Some(slot),
            pool: Arc::clone(&self.shared),
        }
    }

    fn start_reaper(&self) {
        let interval = self.shared.config.idle_timeout;
        if interval.is_zero() {
            debug!("Idle connection reaping disabled");
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No tokio runtime, idle connection reaping disabled");
            return;
        };

        let shared: Weak<PoolShared<M>> = Arc::downgrade(&self.shared);
        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                let reaped = shared.reap_idle();
                if reaped > 0 {
                    debug!(reaped, "Reaped idle connections");
                }
            }
        });

        *self.reaper.lock() = Some(handle);
    }
}

impl<M: Connector> Drop for ConnectionPool<M> {
    fn drop(&mut self) {
        if let Some(handle) = self.reaper.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingConnector {
        opened: AtomicUsize,
        closed: Arc<AtomicUsize>,
        fail: AtomicBool,
    }

    impl Connector for CountingConnector {
        type Connection = usize;

        fn connect(&self) -> Result<usize, PoolError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(PoolError::ConnectionFailed("backend down".to_string()));
            }
            Ok(self.opened.fetch_add(1, Ordering::SeqCst) + 1)
        }

        fn close(&self, _conn: usize) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config(max: usize) -> PoolConfig {
        PoolConfig {
            max_connections: max,
            idle_timeout: Duration::ZERO,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_paired_acquire_release_restores_stats() {
        let pool = ConnectionPool::new(config(3), CountingConnector::default()).unwrap();
        let before = pool.stats();
        assert_eq!(before.available, 1);

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let c = pool.acquire().await.unwrap();
        assert_eq!(pool.stats().in_use, 3);
        assert_eq!(pool.stats().total, 3);

        pool.release(b);
        drop(a);
        pool.release(c);

        let after = pool.stats();
        assert_eq!(after.in_use, 0);
        assert_eq!(after.available, 3);
        assert!(after.available >= before.available);
    }

    #[tokio::test]
    async fn test_idle_reuse_is_lifo() {
        let pool = ConnectionPool::new(config(3), CountingConnector::default()).unwrap();
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let a_id = a.id();
        let b_id = b.id();

        drop(a);
        drop(b);

        let next = pool.acquire().await.unwrap();
        assert_eq!(next.id(), b_id);
        assert_ne!(next.id(), a_id);
    }

    #[tokio::test]
    async fn test_second_acquire_waits_for_release() {
        let pool = Arc::new(ConnectionPool::new(config(1), CountingConnector::default()).unwrap());
        let first = pool.acquire().await.unwrap();
        let first_id = first.id();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire().await.map(|c| c.id()) })
        };

        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        assert_eq!(pool.stats().waiting, 1);

        pool.release(first);
        let second_id = waiter.await.unwrap().unwrap();
        assert_eq!(second_id, first_id);
        assert_eq!(pool.stats().in_use, 0);
    }

    #[tokio::test]
    async fn test_waiters_are_served_in_fifo_order() {
        let pool = Arc::new(ConnectionPool::new(config(1), CountingConnector::default()).unwrap());
        let held = pool.acquire().await.unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for n in 0..3 {
            let pool = Arc::clone(&pool);
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let conn = pool.acquire().await.unwrap();
                order.lock().push(n);
                drop(conn);
            }));
            // Make queue order deterministic
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        drop(held);
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_timeout() {
        let pool = ConnectionPool::new(
            PoolConfig {
                acquire_timeout: Some(Duration::from_millis(100)),
                ..config(1)
            },
            CountingConnector::default(),
        )
        .unwrap();

        let _held = pool.acquire().await.unwrap();
        let result = pool.acquire().await;
        assert!(matches!(result, Err(PoolError::AcquireTimeout(_))));
        assert_eq!(pool.stats().waiting, 0);
    }

    #[tokio::test]
    async fn test_with_connection_releases_on_panic() {
        let pool = Arc::new(ConnectionPool::new(config(2), CountingConnector::default()).unwrap());

        let task = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                pool.with_connection(|_conn| -> () { panic!("query blew up") })
                    .await
                    .unwrap();
            })
        };
        assert!(task.await.is_err());

        let stats = pool.stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.available, 1);
    }

    #[tokio::test]
    async fn test_with_connection_returns_value() {
        let pool = ConnectionPool::new(config(2), CountingConnector::default()).unwrap();
        let value = pool.with_connection(|conn| *conn * 10).await.unwrap();
        assert_eq!(value, 10);
        assert_eq!(pool.stats().in_use, 0);
    }

    #[tokio::test]
    async fn test_creation_failure_propagates() {
        let connector = CountingConnector::default();
        let pool = ConnectionPool::new(config(2), connector).unwrap();
        let _bootstrap = pool.acquire().await.unwrap();

        pool.shared.connector.fail.store(true, Ordering::SeqCst);
        let result = pool.acquire().await;
        assert!(matches!(result, Err(PoolError::ConnectionFailed(_))));

        let stats = pool.stats();
        assert_eq!(stats.in_use, 1);
        assert_eq!(stats.total, 1);
    }

    #[tokio::test]
    async fn test_release_to_foreign_pool_is_noop() {
        let pool_a = ConnectionPool::new(config(2), CountingConnector::default()).unwrap();
        let pool_b = ConnectionPool::new(config(2), CountingConnector::default()).unwrap();

        let conn = pool_a.acquire().await.unwrap();
        pool_b.release(conn);

        assert_eq!(pool_b.stats().available, 1);
        assert_eq!(pool_b.stats().in_use, 0);
        // The guard went back to its own pool when it was dropped
        assert_eq!(pool_a.stats().in_use, 0);
        assert_eq!(pool_a.stats().available, 1);
    }

    #[tokio::test]
    async fn test_reap_keeps_one_idle_connection() {
        let connector = CountingConnector::default();
        let closed = Arc::clone(&connector.closed);
        let pool = ConnectionPool::new(config(4), connector).unwrap();

        let conns = vec![
            pool.acquire().await.unwrap(),
            pool.acquire().await.unwrap(),
            pool.acquire().await.unwrap(),
        ];
        drop(conns);
        assert_eq!(pool.stats().available, 3);

        assert_eq!(pool.reap_idle(), 2);
        assert_eq!(pool.stats().available, 1);
        assert_eq!(closed.load(Ordering::SeqCst), 2);
        assert_eq!(pool.reap_idle(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_reaper_runs_on_interval() {
        let pool = ConnectionPool::new(
            PoolConfig {
                idle_timeout: Duration::from_secs(60),
                ..config(3)
            },
            CountingConnector::default(),
        )
        .unwrap();

        let conns = vec![pool.acquire().await.unwrap(), pool.acquire().await.unwrap()];
        drop(conns);
        assert_eq!(pool.stats().available, 2);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(pool.stats().available, 1);
    }

    #[tokio::test]
    async fn test_close_is_terminal() {
        let connector = CountingConnector::default();
        let closed = Arc::clone(&connector.closed);
        let pool = Arc::new(ConnectionPool::new(config(1), connector).unwrap());

        let held = pool.acquire().await.unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire().await.map(|c| c.id()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        pool.close();
        assert!(matches!(waiter.await.unwrap(), Err(PoolError::Closed)));
        assert!(matches!(pool.acquire().await, Err(PoolError::Closed)));

        // Checked-out connection is closed when it comes back
        drop(held);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().total, 0);

        pool.close();
    }

    #[test]
    fn test_pool_config_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
        assert!(config.acquire_timeout.is_none());
        assert!(!config.verbose);
    }
}
