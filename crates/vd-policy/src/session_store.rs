//! Session State Stores
//!
//! Per-session policy state (routing counters, history windows) lives behind
//! `SessionStateStore` so it can sit in-process or in Redis. Entries carry a
//! TTL; in-process stores are swept by the node's lifecycle task, Redis
//! expires keys itself.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};

use vd_config::{SessionStoreBackend, SessionStoreConfig};

use crate::Result;

#[async_trait]
pub trait SessionStateStore<T>: Send + Sync
where
    T: Send + Sync + 'static,
{
    async fn get(&self, session_id: &str) -> Result<Option<T>>;

    /// Insert or replace; refreshes the entry's TTL
    async fn put(&self, session_id: &str, value: T) -> Result<()>;

    async fn remove(&self, session_id: &str) -> Result<()>;
}

/// Stores that need an external nudge to drop expired entries
pub trait ExpirySweep: Send + Sync {
    /// Drop expired entries, returning how many were removed
    fn sweep_expired(&self) -> usize;
}

// ============================================================================
// In-process
// ============================================================================

struct Entry<T> {
    value: T,
    expires_at: Instant,
}

pub struct MemorySessionStore<T> {
    entries: DashMap<String, Entry<T>>,
    ttl: Duration,
}

impl<T> MemorySessionStore<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl<T> SessionStateStore<T> for MemorySessionStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn get(&self, session_id: &str) -> Result<Option<T>> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(session_id) {
            if entry.expires_at > now {
                return Ok(Some(entry.value.clone()));
            }
        } else {
            return Ok(None);
        }
        self.entries.remove_if(session_id, |_, e| e.expires_at <= now);
        Ok(None)
    }

    async fn put(&self, session_id: &str, value: T) -> Result<()> {
        self.entries.insert(
            session_id.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(())
    }

    async fn remove(&self, session_id: &str) -> Result<()> {
        self.entries.remove(session_id);
        Ok(())
    }
}

impl<T: Send + Sync> ExpirySweep for MemorySessionStore<T> {
    fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires_at > now);
        before.saturating_sub(self.entries.len())
    }
}

// ============================================================================
// Redis
// ============================================================================

pub struct RedisSessionStore<T> {
    conn: ConnectionManager,
    namespace: String,
    ttl_secs: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> RedisSessionStore<T> {
    pub fn new(conn: ConnectionManager, namespace: impl Into<String>, ttl: Duration) -> Self {
        Self {
            conn,
            namespace: namespace.into(),
            ttl_secs: ttl.as_secs().max(1),
            _marker: PhantomData,
        }
    }

    fn key(&self, session_id: &str) -> String {
        format!("{}:{}", self.namespace, session_id)
    }
}

#[async_trait]
impl<T> SessionStateStore<T> for RedisSessionStore<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, session_id: &str) -> Result<Option<T>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.key(session_id)).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, session_id: &str, value: T) -> Result<()> {
        let json = serde_json::to_string(&value)?;
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(self.key(session_id), json, self.ttl_secs).await?;
        Ok(())
    }

    async fn remove(&self, session_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(self.key(session_id)).await?;
        Ok(())
    }
}

// ============================================================================
// Factory
// ============================================================================

enum Backend {
    Memory,
    Redis(ConnectionManager),
}

/// Builds namespaced stores on the configured backend and remembers the
/// in-process ones, plus every lock map it handed out, so a single sweep
/// covers them all.
pub struct StoreFactory {
    backend: Backend,
    prefix: String,
    ttl: Duration,
    sweepers: Mutex<Vec<Arc<dyn ExpirySweep>>>,
    lock_maps: Mutex<Vec<Arc<SessionLocks>>>,
}

impl StoreFactory {
    pub fn memory(ttl: Duration) -> Self {
        Self {
            backend: Backend::Memory,
            prefix: "vdag:session".to_string(),
            ttl,
            sweepers: Mutex::new(Vec::new()),
            lock_maps: Mutex::new(Vec::new()),
        }
    }

    pub async fn redis(url: &str, prefix: impl Into<String>, ttl: Duration) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            backend: Backend::Redis(conn),
            prefix: prefix.into(),
            ttl,
            sweepers: Mutex::new(Vec::new()),
            lock_maps: Mutex::new(Vec::new()),
        })
    }

    pub async fn from_config(config: &SessionStoreConfig, redis_url: &str) -> Result<Self> {
        let ttl = Duration::from_secs(config.ttl_secs);
        match config.backend {
            SessionStoreBackend::Memory => Ok(Self::memory(ttl)),
            SessionStoreBackend::Redis => {
                info!(prefix = %config.key_prefix, ttl_secs = config.ttl_secs, "Using Redis session store");
                Self::redis(redis_url, config.key_prefix.clone(), ttl).await
            }
        }
    }

    pub fn build<T>(&self, namespace: &str) -> Arc<dyn SessionStateStore<T>>
    where
        T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        match &self.backend {
            Backend::Memory => {
                let store = Arc::new(MemorySessionStore::<T>::new(self.ttl));
                self.sweepers.lock().push(store.clone());
                store
            }
            Backend::Redis(conn) => Arc::new(RedisSessionStore::<T>::new(
                conn.clone(),
                format!("{}:{}", self.prefix, namespace),
                self.ttl,
            )),
        }
    }

    /// Per-session lock map whose idle entries are pruned by `sweep_expired`
    pub fn session_locks(&self) -> Arc<SessionLocks> {
        let locks = Arc::new(SessionLocks::new());
        self.lock_maps.lock().push(locks.clone());
        locks
    }

    /// Drop expired state and idle locks; returns the state entries removed
    pub fn sweep_expired(&self) -> usize {
        let sweepers = self.sweepers.lock().clone();
        let removed: usize = sweepers.iter().map(|s| s.sweep_expired()).sum();

        let lock_maps = self.lock_maps.lock().clone();
        let pruned: usize = lock_maps.iter().map(|l| l.prune_idle()).sum();

        if removed > 0 || pruned > 0 {
            debug!(removed = removed, pruned_locks = pruned, "Swept expired session state");
        }
        removed
    }
}

// ============================================================================
// Per-session locks
// ============================================================================

/// Single-flight guard for session read-modify-write cycles
#[derive(Default)]
pub struct SessionLocks {
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Forget a finished session's lock. Call while holding its guard, after
    /// the last write; the entry is kept if another task is already waiting on it.
    pub fn release(&self, session_id: &str) {
        self.locks.remove_if(session_id, |_, lock| Arc::strong_count(lock) <= 2);
    }

    /// Drop locks nobody holds or waits on, returning how many went
    pub fn prune_idle(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before.saturating_sub(self.locks.len())
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
