//! vDAG Queue Transports
//!
//! Every node owns one named inbound queue. This crate provides:
//! - `QueueConsumer`: the blocking pop side a node's runtime loop reads from
//! - `PacketSink`: the push side a node uses to reach a downstream queue
//! - `codec`: the length-prefixed frame every transport stores
//! - Redis list transport (`RPUSH` / `BLPOP`)
//! - In-memory broker for single-process graphs and tests
//! - Direct request/response client for port-0 destinations

use std::time::Duration;
use async_trait::async_trait;
use vd_common::Packet;

pub mod codec;
pub mod direct;
pub mod memory;
pub mod redis_queue;

pub use codec::{decode_packet, encode_packet};
pub use direct::{DirectClient, DirectClientConfig};
pub use memory::{MemoryBroker, MemoryQueueConsumer};
pub use redis_queue::{RedisListQueue, RedisQueueConsumer};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Frame error: {0}")]
    Frame(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Destination rejected packet: HTTP {status}")]
    Rejected { status: u16 },

    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    #[error("Consumer stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// Pop side of a node's inbound queue
#[async_trait]
pub trait QueueConsumer: Send + Sync {
    /// Queue name this consumer reads
    fn identifier(&self) -> &str;

    /// Block up to `timeout` for the next packet; `Ok(None)` on timeout
    async fn pop(&self, timeout: Duration) -> Result<Option<Packet>>;

    /// Stop consuming; subsequent pops return `QueueError::Stopped`
    async fn stop(&self);
}

/// Push side of a transport. One handle may serve many queues on the same host.
#[async_trait]
pub trait PacketSink: Send + Sync {
    async fn push(&self, queue: &str, packet: &Packet) -> Result<()>;

    /// Cheap liveness probe used before a cached handle is reused
    async fn ping(&self) -> Result<()>;
}
