//! In-process broker with the same frame format as the Redis transport.
//!
//! Used when every node of a graph runs in one process, and by tests that need
//! a transport whose availability can be switched off.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use vd_common::Packet;

use crate::codec::{decode_packet, encode_packet};
use crate::{PacketSink, QueueConsumer, QueueError, Result};

#[derive(Default)]
struct MemoryQueue {
    frames: Mutex<VecDeque<Bytes>>,
    notify: Notify,
}

impl MemoryQueue {
    fn pop_frame(&self) -> Option<Bytes> {
        self.frames.lock().pop_front()
    }
}

#[derive(Default)]
pub struct MemoryBroker {
    queues: DashMap<String, Arc<MemoryQueue>>,
    offline: AtomicBool,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn queue(&self, name: &str) -> Arc<MemoryQueue> {
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryQueue::default()))
            .clone()
    }

    pub fn consumer(self: &Arc<Self>, name: impl Into<String>) -> MemoryQueueConsumer {
        let name = name.into();
        MemoryQueueConsumer {
            queue: self.queue(&name),
            name,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn len(&self, name: &str) -> usize {
        self.queues.get(name).map(|q| q.frames.lock().len()).unwrap_or(0)
    }

    pub fn is_empty(&self, name: &str) -> bool {
        self.len(name) == 0
    }

    /// Remove and decode everything currently queued under `name`
    pub fn drain(&self, name: &str) -> Result<Vec<Packet>> {
        let Some(queue) = self.queues.get(name).map(|q| q.clone()) else {
            return Ok(Vec::new());
        };
        let frames: Vec<Bytes> = queue.frames.lock().drain(..).collect();
        frames.iter().map(|f| decode_packet(f)).collect()
    }

    /// Simulate the broker going away: pings and pushes fail until restored
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable("memory broker offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PacketSink for MemoryBroker {
    async fn push(&self, queue: &str, packet: &Packet) -> Result<()> {
        self.check_online()?;
        let frame = encode_packet(packet)?;
        let q = self.queue(queue);
        q.frames.lock().push_back(frame);
        q.notify.notify_one();
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.check_online()
    }
}

pub struct MemoryQueueConsumer {
    name: String,
    queue: Arc<MemoryQueue>,
    stopped: AtomicBool,
}

#[async_trait]
impl QueueConsumer for MemoryQueueConsumer {
    fn identifier(&self) -> &str {
        &self.name
    }

    async fn pop(&self, timeout: Duration) -> Result<Option<Packet>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return Err(QueueError::Stopped);
            }
            // Register interest before checking, so a push between the check
            // and the wait still wakes us.
            let notified = self.queue.notify.notified();
            if let Some(frame) = self.queue.pop_frame() {
                return decode_packet(&frame).map(Some);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.queue.notify.notify_waiters();
    }
}
