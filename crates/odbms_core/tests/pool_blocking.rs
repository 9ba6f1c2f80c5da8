use odbms_core::adapter::SqliteDriver;
use odbms_core::{
    BackendKind, ConnectionConfig, ConnectionError, ConnectionErrorKind, ConnectionManager,
    DbmsError, DbmsResult, Pool, PoolKey, PoolRegistry,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

struct Tokens {
    opened: AtomicUsize,
}

impl ConnectionManager for Tokens {
    type Connection = usize;

    fn backend(&self) -> BackendKind {
        BackendKind::PostgreSql
    }

    fn connect(&self) -> DbmsResult<usize> {
        Ok(self.opened.fetch_add(1, Ordering::SeqCst))
    }

    fn is_alive(&self, _conn: &mut usize) -> bool {
        true
    }
}

fn tokens() -> Tokens {
    Tokens {
        opened: AtomicUsize::new(0),
    }
}

#[test]
fn exhausted_pool_blocks_until_a_release() {
    let pool = Pool::new(tokens(), 2, Duration::from_secs(2)).unwrap();
    let first = pool.acquire().unwrap();
    let second = pool.acquire().unwrap();
    assert_eq!(pool.status().in_use, 2);

    let (sent, received) = mpsc::channel();
    let waiter = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || {
            let started = Instant::now();
            let guard = pool.acquire();
            sent.send(()).unwrap();
            (guard.map(|guard| *guard.get().unwrap()), started.elapsed())
        })
    };

    assert!(received.recv_timeout(Duration::from_millis(150)).is_err());
    drop(first);

    let (token, waited) = waiter.join().unwrap();
    assert_eq!(token.unwrap(), 0);
    assert!(waited >= Duration::from_millis(100));
    assert!(waited < Duration::from_secs(2));

    drop(second);
    let status = pool.status();
    assert_eq!(status.available + status.in_use, status.size);
    assert_eq!(status.available, 2);
}

#[test]
fn waiter_times_out_without_a_release() {
    let pool = Pool::new(tokens(), 1, Duration::from_millis(80)).unwrap();
    let _held = pool.acquire().unwrap();

    let waiter = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || pool.acquire().err())
    };
    let err = waiter.join().unwrap().expect("acquire should time out");
    assert!(matches!(
        err,
        DbmsError::Connection(ConnectionError {
            kind: ConnectionErrorKind::PoolTimeout,
            ..
        })
    ));
}

#[test]
fn invariant_holds_under_concurrent_checkouts() {
    let pool = Pool::new(tokens(), 3, Duration::from_secs(5)).unwrap();
    let workers: Vec<_> = (0..8)
        .map(|_| {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                for _ in 0..25 {
                    let guard = pool.acquire().unwrap();
                    let status = pool.status();
                    assert_eq!(status.available + status.in_use, status.size);
                    drop(guard);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    let status = pool.status();
    assert_eq!((status.available, status.in_use), (3, 0));
    assert_eq!(pool.manager().opened.load(Ordering::SeqCst), 3);
}

#[test]
fn registry_keeps_one_sqlite_pool_per_path() {
    let dir = tempfile::tempdir().unwrap();
    let config = ConnectionConfig::new(dir.path().join("pool.db").to_string_lossy());
    let registry = PoolRegistry::new();
    let key = PoolKey::new(BackendKind::Sqlite, &config);

    let driver = SqliteDriver::new(&config);
    let pool = registry
        .initialize_pool(key.clone(), 2, Duration::from_secs(1), move || driver)
        .unwrap();
    let same = registry
        .get::<SqliteDriver>(&key)
        .expect("pool should be registered");
    assert!(Arc::ptr_eq(&pool, &same));

    let mut guard = pool.acquire().unwrap();
    guard
        .get_mut()
        .unwrap()
        .execute_batch("CREATE TABLE t (x INTEGER)")
        .unwrap();
    drop(guard);

    registry.close_all();
    assert!(registry.is_empty());
    assert!(pool.acquire().is_err());
}
