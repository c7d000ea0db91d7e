//! Session History Compactor
//!
//! Pre-policy that keeps a bounded, de-duplicated window of recent turns per
//! session and periodically folds it into a running summary via an external
//! summarizer. Every forwarded packet gets `context: { summary, recentTurns }`.
//!
//! Packets flagged `underReview` (a self-retry in flight) skip ingestion so a
//! rejected candidate never enters history or advances the cadence.

use std::collections::VecDeque;
use std::sync::Arc;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use vd_common::{Packet, Turn};

use crate::inference::InferenceClient;
use crate::session_store::{SessionLocks, SessionStateStore};
use crate::{Policy, PolicyContext, PolicyDecision, PolicyDeps, PolicyError, PolicySpec, Result};

const POLICY_NAME: &str = "history-compactor";
const STORE_NAMESPACE: &str = "history";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactorSettings {
    pub window_size: usize,
    /// Ingested turns between summarizations
    pub cadence: u32,
    /// Whitespace tokens the window must hold before summarizing
    pub min_tokens: usize,
    pub summarizer_model: String,
}

impl Default for CompactorSettings {
    fn default() -> Self {
        Self {
            window_size: 8,
            cadence: 4,
            min_tokens: 200,
            summarizer_model: "summarizer".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WindowEntry {
    turn: Turn,
    signature: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HistoryWindow {
    entries: VecDeque<WindowEntry>,
    pub messages_since_last_compaction: u32,
    pub last_compacted_summary: Option<String>,
}

impl HistoryWindow {
    /// Append unless an identical turn is already in the window
    pub fn ingest(&mut self, role: &str, text: &str, capacity: usize) -> bool {
        let signature = signature(role, text);
        if self.entries.iter().any(|e| e.signature == signature) {
            return false;
        }
        self.entries.push_back(WindowEntry {
            turn: Turn::new(role, text),
            signature,
        });
        while self.entries.len() > capacity.max(1) {
            self.entries.pop_front();
        }
        self.messages_since_last_compaction += 1;
        true
    }

    pub fn turns(&self) -> Vec<Turn> {
        self.entries.iter().map(|e| e.turn.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whitespace-token approximation of the window's size
    pub fn token_count(&self) -> usize {
        self.entries
            .iter()
            .map(|e| e.turn.text.split_whitespace().count())
            .sum()
    }
}

/// SHA-256 over the role and whitespace-normalized text
pub fn signature(role: &str, text: &str) -> String {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut hasher = Sha256::new();
    hasher.update(role.as_bytes());
    hasher.update([0u8]);
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

pub struct HistoryCompactor {
    settings: CompactorSettings,
    store: Arc<dyn SessionStateStore<HistoryWindow>>,
    locks: Arc<SessionLocks>,
    summarizer: Arc<dyn InferenceClient>,
}

impl HistoryCompactor {
    pub fn new(
        settings: CompactorSettings,
        store: Arc<dyn SessionStateStore<HistoryWindow>>,
        summarizer: Arc<dyn InferenceClient>,
    ) -> Result<Self> {
        if settings.window_size == 0 || settings.cadence == 0 {
            return Err(PolicyError::invalid_settings(
                POLICY_NAME,
                "window_size and cadence must be positive",
            ));
        }
        Ok(Self {
            settings,
            store,
            locks: Arc::new(SessionLocks::new()),
            summarizer,
        })
    }

    pub fn from_spec(spec: &PolicySpec, deps: &PolicyDeps) -> Result<Self> {
        let settings: CompactorSettings = if spec.settings.is_null() {
            CompactorSettings::default()
        } else {
            serde_json::from_value(spec.settings.clone())
                .map_err(|e| PolicyError::invalid_settings(POLICY_NAME, e.to_string()))?
        };
        Ok(Self::new(settings, deps.stores.build(STORE_NAMESPACE), deps.inference.clone())?
            .with_locks(deps.stores.session_locks()))
    }

    /// Share a lock map, typically one the store factory sweeps
    pub fn with_locks(mut self, locks: Arc<SessionLocks>) -> Self {
        self.locks = locks;
        self
    }

    fn summary_prompt(&self, window: &HistoryWindow) -> String {
        let mut prompt = String::from("Update the running summary of this conversation.\n\n");
        if let Some(previous) = &window.last_compacted_summary {
            prompt.push_str("Previous summary:\n");
            prompt.push_str(previous);
            prompt.push_str("\n\n");
        }
        prompt.push_str("Recent turns:\n");
        for turn in window.turns() {
            prompt.push_str(&format!("{}: {}\n", turn.role, turn.text));
        }
        prompt.push_str("\nReply with the updated summary only.");
        prompt
    }

    /// Summarize if the cadence and size thresholds are both met
    async fn maybe_compact(&self, session_id: &str, window: &mut HistoryWindow) -> bool {
        if window.messages_since_last_compaction < self.settings.cadence
            || window.token_count() < self.settings.min_tokens
        {
            return false;
        }

        let prompt = self.summary_prompt(window);
        match self.summarizer.infer(&self.settings.summarizer_model, &prompt).await {
            Ok(summary) => {
                info!(
                    session_id = %session_id,
                    turns = window.len(),
                    tokens = window.token_count(),
                    "Compacted session history"
                );
                window.last_compacted_summary = Some(summary.trim().to_string());
                window.messages_since_last_compaction = 0;
                true
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Summarizer failed, keeping previous summary");
                false
            }
        }
    }
}

#[async_trait]
impl Policy for HistoryCompactor {
    async fn evaluate(&self, _params: &Value, input: Packet, _ctx: &PolicyContext) -> Result<PolicyDecision> {
        if input.payload.get("underReview").and_then(Value::as_bool).unwrap_or(false) {
            debug!(session_id = %input.session_id, "Under review, skipping history ingestion");
            return Ok(PolicyDecision::Forward(input));
        }

        let _guard = self.locks.acquire(&input.session_id).await;
        let mut window = self.store.get(&input.session_id).await?.unwrap_or_default();

        // the receiver's own last turn happened before the turn it is answering
        if let Some(own) = input.payload.get("receiverLastTurn") {
            if let (Some(role), Some(text)) = (
                own.get("role").and_then(Value::as_str),
                own.get("text").and_then(Value::as_str),
            ) {
                window.ingest(role, text, self.settings.window_size);
            }
        }
        if let (Some(role), Some(text)) = (
            input.payload.get("role").and_then(Value::as_str),
            input.payload.get("text").and_then(Value::as_str),
        ) {
            if !text.trim().is_empty() {
                window.ingest(role, text, self.settings.window_size);
            }
        }

        let compacted = self.maybe_compact(&input.session_id, &mut window).await;

        let mut payload = match input.payload.clone() {
            Value::Object(map) => map,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("input".into(), other);
                map
            }
        };
        payload.insert(
            "context".into(),
            json!({
                "summary": window.last_compacted_summary,
                "recentTurns": window.turns(),
            }),
        );
        if compacted {
            payload.insert("compaction".into(), json!({ "compacted": true }));
        } else if window.messages_since_last_compaction > 0 {
            payload.insert(
                "compactionPending".into(),
                json!({ "messagesSinceLastCompaction": window.messages_since_last_compaction }),
            );
        }

        let packet = input.with_payload(Value::Object(payload));
        self.store.put(&input.session_id, window).await?;
        self.locks.release(&input.session_id);
        Ok(PolicyDecision::Forward(packet))
    }

    async fn manage(&self, action: &str, data: Value) -> Result<Value> {
        let session_id = data
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| PolicyError::BadRequest("sessionId is required".to_string()));
        match action {
            "window" => {
                let session_id = session_id?;
                let window = self.store.get(session_id).await?;
                Ok(json!({ "sessionId": session_id, "window": window }))
            }
            "reset" => {
                let session_id = session_id?;
                let _guard = self.locks.acquire(session_id).await;
                self.store.remove(session_id).await?;
                self.locks.release(session_id);
                Ok(json!({ "sessionId": session_id, "reset": true }))
            }
            other => Err(PolicyError::UnsupportedAction(other.to_string())),
        }
    }
}
