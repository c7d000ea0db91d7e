//! Connection Cache - resolves a destination to a live transport handle
//!
//! - Cached handles are probed with a no-op ping before reuse
//! - A failed probe evicts the entry and reconnects
//! - Reconnects retry up to `max_retries` with a fixed delay, then give up
//!   with `None` and the ordered failure reasons in the log
//! - Port 0 selects the direct request/response transport
//!
//! Each (host, port) entry has its own async mutex, so workers racing to
//! evict and reconnect the same destination serialize on that entry only.

use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use vd_config::ConnectionCacheConfig;
use vd_queue::{DirectClient, DirectClientConfig, MemoryBroker, PacketSink, RedisListQueue};

use crate::metrics;

/// Produces transport handles for a destination
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> vd_queue::Result<Arc<dyn PacketSink>>;
}

/// Redis lists for queue destinations, HTTP for port 0
pub struct TransportConnector {
    direct: DirectClientConfig,
}

impl TransportConnector {
    pub fn new(direct: DirectClientConfig) -> Self {
        Self { direct }
    }
}

#[async_trait]
impl Connector for TransportConnector {
    async fn connect(&self, host: &str, port: u16) -> vd_queue::Result<Arc<dyn PacketSink>> {
        if port == 0 {
            let client = DirectClient::new(host, self.direct.clone())?;
            return Ok(Arc::new(client));
        }
        let queue = RedisListQueue::connect(&RedisListQueue::url_for(host, port)).await?;
        Ok(Arc::new(queue))
    }
}

/// Every destination resolves to one in-process broker
pub struct BrokerConnector {
    broker: Arc<MemoryBroker>,
}

impl BrokerConnector {
    pub fn new(broker: Arc<MemoryBroker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl Connector for BrokerConnector {
    async fn connect(&self, _host: &str, _port: u16) -> vd_queue::Result<Arc<dyn PacketSink>> {
        self.broker.ping().await?;
        Ok(self.broker.clone())
    }
}

type Slot = Arc<Mutex<Option<Arc<dyn PacketSink>>>>;

pub struct ConnectionCache {
    connector: Arc<dyn Connector>,
    entries: DashMap<(String, u16), Slot>,
    max_retries: u32,
    retry_delay: Duration,
}

impl ConnectionCache {
    pub fn new(connector: Arc<dyn Connector>, max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            connector,
            entries: DashMap::new(),
            max_retries: max_retries.max(1),
            retry_delay,
        }
    }

    pub fn from_config(connector: Arc<dyn Connector>, config: &ConnectionCacheConfig) -> Self {
        Self::new(
            connector,
            config.max_retries,
            Duration::from_millis(config.retry_delay_ms),
        )
    }

    /// Live handle for the destination, or `None` once retries are exhausted
    pub async fn get(&self, node_id: &str, host: &str, port: u16) -> Option<Arc<dyn PacketSink>> {
        let slot = self
            .entries
            .entry((host.to_string(), port))
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone();
        let mut cached = slot.lock().await;

        if let Some(handle) = cached.as_ref() {
            match handle.ping().await {
                Ok(()) => return Some(handle.clone()),
                Err(e) => {
                    warn!(node_id = %node_id, host = %host, port = port, error = %e, "Cached connection failed probe, reconnecting");
                    *cached = None;
                }
            }
        }

        let mut failures = Vec::new();
        for attempt in 1..=self.max_retries {
            match self.connector.connect(host, port).await {
                Ok(handle) => {
                    metrics::connection_attempt(true);
                    if attempt > 1 {
                        info!(node_id = %node_id, host = %host, port = port, attempt = attempt, "Reconnected");
                    } else {
                        debug!(node_id = %node_id, host = %host, port = port, "Connected");
                    }
                    *cached = Some(handle.clone());
                    return Some(handle);
                }
                Err(e) => {
                    metrics::connection_attempt(false);
                    failures.push(format!("attempt {}: {}", attempt, e));
                    if attempt < self.max_retries {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }

        error!(
            node_id = %node_id,
            host = %host,
            port = port,
            failures = ?failures,
            "Connection attempts exhausted"
        );
        None
    }

    /// Evict one destination; returns whether it was cached
    pub fn remove(&self, host: &str, port: u16) -> bool {
        self.entries.remove(&(host.to_string(), port)).is_some()
    }

    pub fn clear(&self) {
        let count = self.entries.len();
        self.entries.clear();
        info!(evicted = count, "Connection cache cleared");
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use serde_json::json;
    use vd_common::Packet;

    /// Counts attempts and fails a configurable number of them
    struct FlakyConnector {
        broker: Arc<MemoryBroker>,
        attempts: AtomicU32,
        failures_left: AtomicU32,
    }

    impl FlakyConnector {
        fn new(broker: Arc<MemoryBroker>, failures: u32) -> Arc<Self> {
            Arc::new(Self {
                broker,
                attempts: AtomicU32::new(0),
                failures_left: AtomicU32::new(failures),
            })
        }
    }

    #[async_trait]
    impl Connector for FlakyConnector {
        async fn connect(&self, _host: &str, _port: u16) -> vd_queue::Result<Arc<dyn PacketSink>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(vd_queue::QueueError::Unavailable("refused".into()));
            }
            self.broker.ping().await?;
            Ok(self.broker.clone())
        }
    }

    fn cache(connector: Arc<FlakyConnector>, retries: u32) -> ConnectionCache {
        ConnectionCache::new(connector, retries, Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_reuses_live_handle() {
        let broker = MemoryBroker::new();
        let connector = FlakyConnector::new(broker.clone(), 0);
        let cache = cache(connector.clone(), 3);

        assert!(cache.get("node-b", "redis-b", 6379).await.is_some());
        assert!(cache.get("node-b", "redis-b", 6379).await.is_some());
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_retries_until_connected() {
        let broker = MemoryBroker::new();
        let connector = FlakyConnector::new(broker.clone(), 2);
        let cache = cache(connector.clone(), 5);

        let handle = cache.get("node-b", "redis-b", 6379).await.unwrap();
        handle.push("q", &Packet::new("s", 1, json!({}))).await.unwrap();
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(broker.len("q"), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_none() {
        let broker = MemoryBroker::new();
        broker.set_offline(true);
        let connector = FlakyConnector::new(broker.clone(), 0);
        let cache = cache(connector.clone(), 3);

        assert!(cache.get("node-b", "redis-b", 6379).await.is_none());
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failed_probe_evicts_and_reconnects() {
        let broker = MemoryBroker::new();
        let connector = FlakyConnector::new(broker.clone(), 0);
        let cache = cache(connector.clone(), 2);

        assert!(cache.get("node-b", "redis-b", 6379).await.is_some());

        broker.set_offline(true);
        assert!(cache.get("node-b", "redis-b", 6379).await.is_none());

        broker.set_offline(false);
        assert!(cache.get("node-b", "redis-b", 6379).await.is_some());
        // 1 initial + 2 exhausted + 1 recovery
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let broker = MemoryBroker::new();
        let connector = FlakyConnector::new(broker, 0);
        let cache = cache(connector.clone(), 1);

        cache.get("a", "host-a", 6379).await;
        cache.get("b", "host-b", 0).await;
        assert!(cache.remove("host-a", 6379));
        assert!(!cache.remove("host-a", 6379));
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_gets_share_one_connection() {
        let broker = MemoryBroker::new();
        let connector = FlakyConnector::new(broker, 0);
        let cache = Arc::new(cache(connector.clone(), 1));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get("n", "h", 6379).await.is_some() })
            })
            .collect();
        for h in handles {
            assert!(h.await.unwrap());
        }
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
    }
}
