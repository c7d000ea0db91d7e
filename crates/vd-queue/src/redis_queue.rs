//! Redis list transport: producers `RPUSH` frames, the owning node `BLPOP`s them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::debug;
use vd_common::Packet;

use crate::codec::{decode_packet, encode_packet};
use crate::{PacketSink, QueueConsumer, QueueError, Result};

/// Push handle for one Redis endpoint
#[derive(Clone)]
pub struct RedisListQueue {
    endpoint: String,
    conn: ConnectionManager,
}

impl RedisListQueue {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        debug!(endpoint = %url, "Connected Redis list queue");
        Ok(Self {
            endpoint: url.to_string(),
            conn,
        })
    }

    /// `redis://host:port` for a destination descriptor
    pub fn url_for(host: &str, port: u16) -> String {
        format!("redis://{}:{}", host, port)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl PacketSink for RedisListQueue {
    async fn push(&self, queue: &str, packet: &Packet) -> Result<()> {
        let frame = encode_packet(packet)?;
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(queue, frame.to_vec()).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong != "PONG" {
            return Err(QueueError::Unavailable(format!("unexpected PING reply: {}", pong)));
        }
        Ok(())
    }
}

/// Blocking consumer of a node's inbound list. Owns its own connection so a
/// long `BLPOP` never stalls pushes issued by the same process.
pub struct RedisQueueConsumer {
    queue: String,
    conn: ConnectionManager,
    stopped: AtomicBool,
}

impl RedisQueueConsumer {
    pub async fn connect(url: &str, queue: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            queue: queue.into(),
            conn,
            stopped: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl QueueConsumer for RedisQueueConsumer {
    fn identifier(&self) -> &str {
        &self.queue
    }

    async fn pop(&self, timeout: Duration) -> Result<Option<Packet>> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(QueueError::Stopped);
        }
        let mut conn = self.conn.clone();
        let popped: Option<(String, Vec<u8>)> = conn.blpop(&self.queue, timeout.as_secs_f64()).await?;
        match popped {
            Some((_, frame)) => decode_packet(&frame).map(Some),
            None => Ok(None),
        }
    }

    async fn stop(&self) {
        debug!(queue = %self.queue, "Stopping Redis consumer");
        self.stopped.store(true, Ordering::SeqCst);
    }
}
