//! Keyed, blocking connection pool for the relational adapters.
//!
//! # Responsibility
//! - Create a fixed number of physical connections eagerly.
//! - Hand each connection to exactly one caller at a time.
//! - Probe connections on release and replace dead ones.
//!
//! # Invariants
//! - For an open pool, `available + in_use == size` at all times; a slot
//!   whose replacement failed stays in the pool as vacant.
//! - A checked-out connection always returns to the pool when its guard is
//!   dropped, including on error paths.
//! - After `close`, no connection is handed out and outstanding guards
//!   refuse access.

use crate::config::{BackendKind, ConnectionConfig};
use crate::error::{ConnectionError, ConnectionErrorKind, DbmsResult};
use log::{info, warn};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Creates, probes and closes physical connections for one pool.
pub trait ConnectionManager: Send + Sync + 'static {
    type Connection: Send + 'static;

    fn backend(&self) -> BackendKind;

    fn connect(&self) -> DbmsResult<Self::Connection>;

    /// Cheap liveness probe run on release.
    fn is_alive(&self, conn: &mut Self::Connection) -> bool;

    fn close(&self, conn: Self::Connection) {
        drop(conn);
    }
}

enum Slot<C> {
    Ready(C),
    /// Replacement failed; the next acquirer reconnects.
    Vacant,
}

struct PoolState<C> {
    idle: VecDeque<Slot<C>>,
    in_use: usize,
    closed: bool,
}

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub size: usize,
    pub available: usize,
    pub in_use: usize,
}

pub struct Pool<M: ConnectionManager> {
    manager: M,
    size: usize,
    timeout: Duration,
    state: Mutex<PoolState<M::Connection>>,
    released: Condvar,
}

impl<M: ConnectionManager> Pool<M> {
    /// Opens exactly `size` connections; fails if any of them fails.
    pub fn new(manager: M, size: usize, timeout: Duration) -> DbmsResult<Arc<Self>> {
        let size = size.max(1);
        let mut idle = VecDeque::with_capacity(size);
        for _ in 0..size {
            match manager.connect() {
                Ok(conn) => idle.push_back(Slot::Ready(conn)),
                Err(err) => {
                    for slot in idle.drain(..) {
                        if let Slot::Ready(conn) = slot {
                            manager.close(conn);
                        }
                    }
                    return Err(err);
                }
            }
        }

        Ok(Arc::new(Self {
            manager,
            size,
            timeout,
            state: Mutex::new(PoolState {
                idle,
                in_use: 0,
                closed: false,
            }),
            released: Condvar::new(),
        }))
    }

    pub fn manager(&self) -> &M {
        &self.manager
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.state.lock();
        PoolStatus {
            size: self.size,
            available: state.idle.len(),
            in_use: state.in_use,
        }
    }

    /// Blocks until a connection is free or the pool timeout elapses.
    pub fn acquire(self: &Arc<Self>) -> DbmsResult<PooledConnection<M>> {
        self.acquire_timeout(self.timeout)
    }

    pub fn acquire_timeout(self: &Arc<Self>, timeout: Duration) -> DbmsResult<PooledConnection<M>> {
        let deadline = Instant::now() + timeout;
        let slot = {
            let mut state = self.state.lock();
            loop {
                if state.closed {
                    return Err(self
                        .error(ConnectionErrorKind::PoolClosed, "acquire after close")
                        .into());
                }
                if let Some(slot) = state.idle.pop_front() {
                    state.in_use += 1;
                    break slot;
                }
                if self.released.wait_until(&mut state, deadline).timed_out()
                    && state.idle.is_empty()
                {
                    warn!(
                        "event=pool_acquire module=pool status=error backend={} error_code=pool_timeout timeout_ms={}",
                        self.manager.backend(),
                        timeout.as_millis()
                    );
                    return Err(self
                        .error(
                            ConnectionErrorKind::PoolTimeout,
                            format!("no connection became available within {timeout:?}"),
                        )
                        .into());
                }
            }
        };

        let conn = match slot {
            Slot::Ready(conn) => conn,
            Slot::Vacant => match self.manager.connect() {
                Ok(conn) => conn,
                Err(err) => {
                    self.put_back(Slot::Vacant);
                    return Err(self
                        .error(ConnectionErrorKind::ReplacementFailed, err.to_string())
                        .into());
                }
            },
        };

        Ok(PooledConnection {
            pool: Arc::clone(self),
            conn: Some(conn),
        })
    }

    fn release(&self, mut conn: M::Connection) {
        if self.is_closed() {
            self.manager.close(conn);
            self.finish_closed_release();
            return;
        }

        let slot = if self.manager.is_alive(&mut conn) {
            Slot::Ready(conn)
        } else {
            warn!(
                "event=pool_release module=pool status=error backend={} error_code=dead_connection",
                self.manager.backend()
            );
            self.manager.close(conn);
            match self.manager.connect() {
                Ok(fresh) => Slot::Ready(fresh),
                Err(err) => {
                    warn!(
                        "event=pool_replace module=pool status=error backend={} error_code=replacement_failed error={}",
                        self.manager.backend(),
                        err
                    );
                    Slot::Vacant
                }
            }
        };
        self.put_back(slot);
    }

    fn put_back(&self, slot: Slot<M::Connection>) {
        let mut state = self.state.lock();
        state.in_use = state.in_use.saturating_sub(1);
        if state.closed {
            drop(state);
            if let Slot::Ready(conn) = slot {
                self.manager.close(conn);
            }
            return;
        }
        state.idle.push_back(slot);
        drop(state);
        self.released.notify_one();
    }

    fn finish_closed_release(&self) {
        let mut state = self.state.lock();
        state.in_use = state.in_use.saturating_sub(1);
    }

    /// Closes every idle connection and marks the pool closed.
    pub fn close(&self) {
        let drained: Vec<_> = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.idle.drain(..).collect()
        };
        self.released.notify_all();
        for slot in drained {
            if let Slot::Ready(conn) = slot {
                self.manager.close(conn);
            }
        }
    }

    fn error(&self, kind: ConnectionErrorKind, detail: impl Into<String>) -> ConnectionError {
        ConnectionError::new(self.manager.backend(), kind, detail)
    }
}

/// Scoped checkout; returns the connection to the pool on drop.
pub struct PooledConnection<M: ConnectionManager> {
    pool: Arc<Pool<M>>,
    conn: Option<M::Connection>,
}

impl<M: ConnectionManager> PooledConnection<M> {
    pub fn get(&self) -> DbmsResult<&M::Connection> {
        self.check_open()?;
        self.conn
            .as_ref()
            .ok_or_else(|| self.closed_error().into())
    }

    pub fn get_mut(&mut self) -> DbmsResult<&mut M::Connection> {
        self.check_open()?;
        let closed = self.closed_error();
        self.conn.as_mut().ok_or_else(|| closed.into())
    }

    fn check_open(&self) -> DbmsResult<()> {
        if self.pool.is_closed() {
            return Err(self.closed_error().into());
        }
        Ok(())
    }

    fn closed_error(&self) -> ConnectionError {
        self.pool
            .error(ConnectionErrorKind::PoolClosed, "connection used after pool close")
    }
}

impl<M: ConnectionManager> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

/// Registry key: backend plus server address and database, or just the
/// database path for SQLite.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub backend: BackendKind,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: String,
}

impl PoolKey {
    pub fn new(backend: BackendKind, config: &ConnectionConfig) -> Self {
        if backend == BackendKind::Sqlite {
            return Self {
                backend,
                host: None,
                port: None,
                database: config.database.clone(),
            };
        }
        Self {
            backend,
            host: Some(config.host.clone()),
            port: config.port_for(backend),
            database: config.database.clone(),
        }
    }
}

impl Display for PoolKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match (&self.host, self.port) {
            (Some(host), Some(port)) => {
                write!(f, "{}:{host}:{port}:{}", self.backend, self.database)
            }
            (Some(host), None) => write!(f, "{}:{host}:{}", self.backend, self.database),
            _ => write!(f, "{}:{}", self.backend, self.database),
        }
    }
}

struct RegistryEntry {
    pool: Arc<dyn Any + Send + Sync>,
    close: Box<dyn Fn() + Send + Sync>,
}

/// All pools owned by one `Dbms` handle.
#[derive(Default)]
pub struct PoolRegistry {
    pools: Mutex<HashMap<PoolKey, RegistryEntry>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the pool for `key`, or returns the existing one unchanged.
    pub fn initialize_pool<M, F>(
        &self,
        key: PoolKey,
        size: usize,
        timeout: Duration,
        manager: F,
    ) -> DbmsResult<Arc<Pool<M>>>
    where
        M: ConnectionManager,
        F: FnOnce() -> M,
    {
        let mut pools = self.pools.lock();
        if let Some(entry) = pools.get(&key) {
            return Arc::clone(&entry.pool).downcast::<Pool<M>>().map_err(|_| {
                ConnectionError::new(
                    key.backend,
                    ConnectionErrorKind::ConnectFailed,
                    format!("pool `{key}` is registered with a different driver"),
                )
                .into()
            });
        }

        let started_at = Instant::now();
        let pool = Pool::new(manager(), size, timeout)?;
        let closer = Arc::clone(&pool);
        pools.insert(
            key.clone(),
            RegistryEntry {
                pool: Arc::clone(&pool) as Arc<dyn Any + Send + Sync>,
                close: Box::new(move || closer.close()),
            },
        );
        info!(
            "event=pool_init module=pool status=ok key={} size={} duration_ms={}",
            key,
            pool.size(),
            started_at.elapsed().as_millis()
        );
        Ok(pool)
    }

    pub fn get<M: ConnectionManager>(&self, key: &PoolKey) -> Option<Arc<Pool<M>>> {
        let pools = self.pools.lock();
        pools
            .get(key)
            .and_then(|entry| Arc::clone(&entry.pool).downcast::<Pool<M>>().ok())
    }

    /// Closes and forgets the pool for `key`.
    pub fn close(&self, key: &PoolKey) -> bool {
        let entry = self.pools.lock().remove(key);
        match entry {
            Some(entry) => {
                (entry.close)();
                info!("event=pool_close module=pool status=ok key={key}");
                true
            }
            None => false,
        }
    }

    /// Closes every pool and empties the registry.
    pub fn close_all(&self) {
        let entries: Vec<_> = self.pools.lock().drain().collect();
        for (key, entry) in entries {
            (entry.close)();
            info!("event=pool_close module=pool status=ok key={key}");
        }
    }

    pub fn len(&self) -> usize {
        self.pools.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DbmsError;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Counter {
        opened: Arc<AtomicUsize>,
        alive: Arc<AtomicBool>,
        fail_connect: Arc<AtomicBool>,
    }

    impl Counter {
        fn new() -> Self {
            Self {
                opened: Arc::new(AtomicUsize::new(0)),
                alive: Arc::new(AtomicBool::new(true)),
                fail_connect: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl ConnectionManager for Counter {
        type Connection = usize;

        fn backend(&self) -> BackendKind {
            BackendKind::Sqlite
        }

        fn connect(&self) -> DbmsResult<usize> {
            if self.fail_connect.load(Ordering::SeqCst) {
                return Err(ConnectionError::new(
                    BackendKind::Sqlite,
                    ConnectionErrorKind::ConnectFailed,
                    "refused",
                )
                .into());
            }
            Ok(self.opened.fetch_add(1, Ordering::SeqCst))
        }

        fn is_alive(&self, _conn: &mut usize) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
    }

    fn assert_invariant<M: ConnectionManager>(pool: &Pool<M>) {
        let status = pool.status();
        assert_eq!(status.available + status.in_use, status.size);
    }

    #[test]
    fn creates_size_connections_eagerly() {
        let manager = Counter::new();
        let opened = Arc::clone(&manager.opened);
        let pool = Pool::new(manager, 3, Duration::from_millis(50)).unwrap();
        assert_eq!(opened.load(Ordering::SeqCst), 3);
        assert_eq!(
            pool.status(),
            PoolStatus {
                size: 3,
                available: 3,
                in_use: 0
            }
        );
    }

    #[test]
    fn acquire_times_out_when_exhausted() {
        let pool = Pool::new(Counter::new(), 1, Duration::from_millis(30)).unwrap();
        let _held = pool.acquire().unwrap();
        let err = pool.acquire().err().expect("second acquire must time out");
        assert!(matches!(
            err,
            DbmsError::Connection(ConnectionError {
                kind: ConnectionErrorKind::PoolTimeout,
                ..
            })
        ));
        assert_invariant(&pool);
    }

    #[test]
    fn dead_connection_is_replaced_on_release() {
        let manager = Counter::new();
        let alive = Arc::clone(&manager.alive);
        let opened = Arc::clone(&manager.opened);
        let pool = Pool::new(manager, 1, Duration::from_millis(50)).unwrap();

        alive.store(false, Ordering::SeqCst);
        drop(pool.acquire().unwrap());
        assert_eq!(opened.load(Ordering::SeqCst), 2);
        assert_invariant(&pool);

        alive.store(true, Ordering::SeqCst);
        let guard = pool.acquire().unwrap();
        assert_eq!(*guard.get().unwrap(), 1);
    }

    #[test]
    fn failed_replacement_leaves_vacant_slot() {
        let manager = Counter::new();
        let alive = Arc::clone(&manager.alive);
        let fail = Arc::clone(&manager.fail_connect);
        let pool = Pool::new(manager, 1, Duration::from_millis(50)).unwrap();

        alive.store(false, Ordering::SeqCst);
        fail.store(true, Ordering::SeqCst);
        drop(pool.acquire().unwrap());
        assert_invariant(&pool);

        let err = pool.acquire().err().expect("vacant slot cannot reconnect");
        assert!(matches!(
            err,
            DbmsError::Connection(ConnectionError {
                kind: ConnectionErrorKind::ReplacementFailed,
                ..
            })
        ));
        assert_invariant(&pool);

        fail.store(false, Ordering::SeqCst);
        alive.store(true, Ordering::SeqCst);
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn close_invalidates_outstanding_guards() {
        let pool = Pool::new(Counter::new(), 2, Duration::from_millis(50)).unwrap();
        let mut guard = pool.acquire().unwrap();
        pool.close();
        assert!(guard.get_mut().is_err());
        assert!(pool.acquire().is_err());
        drop(guard);
        assert_eq!(pool.status().in_use, 0);
    }

    #[test]
    fn registry_reuses_pool_for_same_key() {
        let registry = PoolRegistry::new();
        let key = PoolKey::new(BackendKind::Sqlite, &ConnectionConfig::new("app.db"));
        let first = registry
            .initialize_pool(key.clone(), 2, Duration::from_millis(50), Counter::new)
            .unwrap();
        let second = registry
            .initialize_pool(key.clone(), 5, Duration::from_millis(50), Counter::new)
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.size(), 2);

        registry.close_all();
        assert!(registry.is_empty());
        assert!(first.is_closed());
    }

    #[test]
    fn pool_key_uses_path_for_sqlite_and_address_for_servers() {
        let config = ConnectionConfig::new("shop").with_host("db.internal");
        assert_eq!(PoolKey::new(BackendKind::Sqlite, &config).to_string(), "sqlite:shop");
        assert_eq!(
            PoolKey::new(BackendKind::PostgreSql, &config).to_string(),
            "postgresql:db.internal:5432:shop"
        );
    }
}
