use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex};

use postgres::{Client, NoTls};

#[derive(Debug, Clone)]
pub struct SqlConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: String,
    pub pool_size: usize,
}

impl Default for SqlConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 5432,
            user: "breakwater".into(),
            password: String::new(),
            dbname: "breakwater".into(),
            pool_size: 10,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PoolError {
    /// `try_acquire` found no free handle.
    #[error("no free SQL handle available")]
    Exhausted,
    /// The pool was closed while a caller was waiting.
    #[error("SQL pool is closed")]
    Closed,
}

struct State {
    queue: VecDeque<Client>,
    closed: bool,
}

struct Shared {
    state: Mutex<State>,
    available: Condvar,
}

/// Bounded pool of long-lived blocking SQL handles.
///
/// The condvar stands in for a counting semaphore whose value equals the
/// number of free handles: free handles in the queue plus handles held
/// by guards always sum to the configured size.
#[derive(Clone)]
pub struct SqlConnPool {
    shared: Arc<Shared>,
    size: usize,
}

impl SqlConnPool {
    /// Open `cfg.pool_size` connections eagerly. Any connection failure
    /// aborts the whole init.
    pub fn connect(cfg: &SqlConfig) -> Result<Self, postgres::Error> {
        assert!(cfg.pool_size > 0);
        let mut queue = VecDeque::with_capacity(cfg.pool_size);
        for _ in 0..cfg.pool_size {
            let client = postgres::Config::new()
                .host(&cfg.host)
                .port(cfg.port)
                .user(&cfg.user)
                .password(&cfg.password)
                .dbname(&cfg.dbname)
                .connect(NoTls)?;
            queue.push_back(client);
        }
        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    queue,
                    closed: false,
                }),
                available: Condvar::new(),
            }),
            size: cfg.pool_size,
        })
    }

    /// Take a handle, blocking while none are free. The guard returns
    /// the handle on drop on every exit path.
    pub fn acquire(&self) -> Result<SqlConnGuard, PoolError> {
        let mut state = self.shared.state.lock().unwrap();
        loop {
            if state.closed {
                return Err(PoolError::Closed);
            }
            if let Some(client) = state.queue.pop_front() {
                return Ok(SqlConnGuard {
                    client: Some(client),
                    shared: self.shared.clone(),
                });
            }
            state = self.shared.available.wait(state).unwrap();
        }
    }

    /// Nonblocking variant of `acquire`.
    pub fn try_acquire(&self) -> Result<SqlConnGuard, PoolError> {
        let mut state = self.shared.state.lock().unwrap();
        if state.closed {
            return Err(PoolError::Closed);
        }
        match state.queue.pop_front() {
            Some(client) => Ok(SqlConnGuard {
                client: Some(client),
                shared: self.shared.clone(),
            }),
            None => Err(PoolError::Exhausted),
        }
    }

    pub fn free_count(&self) -> usize {
        self.shared.state.lock().unwrap().queue.len()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Drop every free handle and refuse further acquisitions. Handles
    /// still held by guards are dropped when those guards release.
    pub fn close_all(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.closed = true;
        state.queue.clear();
        drop(state);
        self.shared.available.notify_all();
    }
}

/// Scoped acquisition of one SQL handle.
pub struct SqlConnGuard {
    client: Option<Client>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for SqlConnGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlConnGuard").finish_non_exhaustive()
    }
}

impl Deref for SqlConnGuard {
    type Target = Client;
    fn deref(&self) -> &Client {
        self.client.as_ref().unwrap()
    }
}

impl DerefMut for SqlConnGuard {
    fn deref_mut(&mut self) -> &mut Client {
        self.client.as_mut().unwrap()
    }
}

impl Drop for SqlConnGuard {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            let mut state = self.shared.state.lock().unwrap();
            if !state.closed {
                state.queue.push_back(client);
                drop(state);
                self.shared.available.notify_one();
            }
        }
    }
}

// Pool behavior against a live database; run with a local postgres and
// `cargo test -- --ignored`.
#[cfg(test)]
mod tests {
    use super::*;

    fn local_cfg() -> SqlConfig {
        SqlConfig {
            host: "127.0.0.1".into(),
            user: std::env::var("PGUSER").unwrap_or_else(|_| "postgres".into()),
            password: std::env::var("PGPASSWORD").unwrap_or_default(),
            dbname: std::env::var("PGDATABASE").unwrap_or_else(|_| "postgres".into()),
            pool_size: 4,
            ..Default::default()
        }
    }

    #[test]
    #[ignore] // requires a reachable postgres
    fn free_plus_held_equals_size() {
        let pool = SqlConnPool::connect(&local_cfg()).unwrap();
        assert_eq!(pool.free_count(), 4);

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(pool.free_count(), 2);

        drop(a);
        assert_eq!(pool.free_count(), 3);
        drop(b);
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    #[ignore] // requires a reachable postgres
    fn try_acquire_reports_exhaustion() {
        let mut cfg = local_cfg();
        cfg.pool_size = 1;
        let pool = SqlConnPool::connect(&cfg).unwrap();

        let held = pool.try_acquire().unwrap();
        assert_eq!(pool.try_acquire().unwrap_err(), PoolError::Exhausted);
        drop(held);
        assert!(pool.try_acquire().is_ok());
    }

    #[test]
    #[ignore] // requires a reachable postgres
    fn close_all_rejects_new_acquisitions() {
        let pool = SqlConnPool::connect(&local_cfg()).unwrap();
        pool.close_all();
        assert_eq!(pool.acquire().unwrap_err(), PoolError::Closed);
        assert_eq!(pool.free_count(), 0);
    }
}
