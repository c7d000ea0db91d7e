//! Session-keyed streaming side channel.
//!
//! Node logic publishes partial output into the hub; WebSocket clients that
//! connected with the same session id receive it. Nothing here touches the
//! queue path, and publishing with no subscriber is a no-op.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

pub const END_OF_STREAM: &str = "[END_OF_STREAM]";

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFrame {
    pub delta: String,
}

impl StreamFrame {
    pub fn is_end(&self) -> bool {
        self.delta == END_OF_STREAM
    }
}

#[derive(Default)]
pub struct StreamHub {
    sessions: DashMap<String, broadcast::Sender<StreamFrame>>,
}

impl StreamHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, session_id: &str) -> broadcast::Receiver<StreamFrame> {
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Returns whether anyone was listening
    pub fn publish_delta(&self, session_id: &str, delta: impl Into<String>) -> bool {
        let Some(tx) = self.sessions.get(session_id) else {
            return false;
        };
        tx.send(StreamFrame { delta: delta.into() }).is_ok()
    }

    /// Send the end marker and forget the session
    pub fn end(&self, session_id: &str) {
        if let Some((_, tx)) = self.sessions.remove(session_id) {
            let _ = tx.send(StreamFrame {
                delta: END_OF_STREAM.to_string(),
            });
            debug!(session_id = %session_id, "Stream ended");
        }
    }

    /// Forget a session once its last subscriber has gone
    pub fn release(&self, session_id: &str) {
        if self.sessions.remove_if(session_id, |_, tx| tx.receiver_count() == 0).is_some() {
            debug!(session_id = %session_id, "Stream released without end marker");
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }
}
