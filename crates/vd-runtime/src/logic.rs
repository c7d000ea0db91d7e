//! Business-logic collaborator
//!
//! `NodeLogic` is what a node actually does with a packet. Only `on_data` is
//! required; the other hooks default to identity / no-op.

use std::sync::Arc;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tracing::{debug, info};

use vd_common::{HealthStatus, Packet, WorkItem};
use vd_policy::InferenceClient;

use crate::streaming::StreamHub;

#[derive(Debug, thiserror::Error)]
pub enum LogicError {
    #[error("Preprocessing failed: {0}")]
    Preprocess(String),

    #[error("Processing failed: {0}")]
    Processing(String),

    #[error("Update rejected: {0}")]
    Update(String),

    #[error("Unsupported management action: {0}")]
    UnsupportedAction(String),
}

#[async_trait]
pub trait NodeLogic: Send + Sync {
    /// Split one packet into the logical inputs `on_data` runs on
    async fn on_preprocess(&self, packet: &Packet) -> Result<Vec<WorkItem>, LogicError> {
        Ok(vec![WorkItem::from_packet(packet)])
    }

    /// Produce the output payload for one item; `None` means no output
    async fn on_data(&self, item: WorkItem) -> Result<Option<Value>, LogicError>;

    /// Apply runtime parameters and echo what was applied
    async fn on_update(&self, params: Value) -> Result<Value, LogicError> {
        Ok(params)
    }

    async fn health(&self) -> HealthStatus {
        HealthStatus::Up
    }

    async fn management(&self, action: &str, _data: Value) -> Result<Value, LogicError> {
        Err(LogicError::UnsupportedAction(action.to_string()))
    }
}

/// Forwards every payload unchanged
pub struct EchoLogic;

#[async_trait]
impl NodeLogic for EchoLogic {
    async fn on_data(&self, item: WorkItem) -> Result<Option<Value>, LogicError> {
        Ok(Some(item.payload))
    }
}

/// Runtime-adjustable knobs of `InferenceLogic`
#[derive(Debug, Clone)]
struct InferenceParams {
    model_id: String,
    system_prompt: Option<String>,
    stream: bool,
}

/// Default logic for conversational nodes: build a prompt from the incoming
/// turn and its context, ask the model, stream the answer, emit `{ text }`.
pub struct InferenceLogic {
    client: Arc<dyn InferenceClient>,
    streams: Arc<StreamHub>,
    params: RwLock<InferenceParams>,
}

impl InferenceLogic {
    pub fn new(client: Arc<dyn InferenceClient>, streams: Arc<StreamHub>, model_id: impl Into<String>) -> Self {
        Self {
            client,
            streams,
            params: RwLock::new(InferenceParams {
                model_id: model_id.into(),
                system_prompt: None,
                stream: true,
            }),
        }
    }

    fn build_prompt(&self, payload: &Value) -> String {
        let mut prompt = String::new();
        if let Some(system) = &self.params.read().system_prompt {
            prompt.push_str(system);
            prompt.push_str("\n\n");
        }
        if payload.get("forceFinalize").and_then(Value::as_bool).unwrap_or(false) {
            prompt.push_str("The conversation has reached its limit. Give your final verdict now.\n\n");
        }
        if let Some(summary) = payload.pointer("/context/summary").and_then(Value::as_str) {
            prompt.push_str("Summary so far:\n");
            prompt.push_str(summary);
            prompt.push_str("\n\n");
        }
        let turns = payload
            .pointer("/context/recentTurns")
            .or_else(|| payload.get("history"))
            .and_then(Value::as_array);
        if let Some(turns) = turns {
            prompt.push_str("Recent turns:\n");
            for turn in turns {
                let role = turn.get("role").and_then(Value::as_str).unwrap_or("?");
                let text = turn.get("text").and_then(Value::as_str).unwrap_or("");
                prompt.push_str(&format!("{}: {}\n", role, text));
            }
            prompt.push('\n');
        }
        if let Some(options) = payload.get("options").and_then(Value::as_array) {
            let options: Vec<&str> = options.iter().filter_map(Value::as_str).collect();
            prompt.push_str(&format!("Options: {}\n", options.join(" | ")));
        }
        if let Some(format) = payload.get("replyFormat").and_then(Value::as_str) {
            prompt.push_str(format);
            prompt.push('\n');
        }
        match payload.get("text").and_then(Value::as_str) {
            Some(text) => prompt.push_str(text),
            None => prompt.push_str(&payload.to_string()),
        }
        prompt
    }
}

#[async_trait]
impl NodeLogic for InferenceLogic {
    async fn on_data(&self, item: WorkItem) -> Result<Option<Value>, LogicError> {
        let prompt = self.build_prompt(&item.payload);
        let (model_id, stream) = {
            let params = self.params.read();
            (params.model_id.clone(), params.stream)
        };

        let text = self
            .client
            .infer(&model_id, &prompt)
            .await
            .map_err(|e| LogicError::Processing(e.to_string()))?;

        if stream {
            for chunk in text.split_inclusive(' ') {
                self.streams.publish_delta(&item.session_id, chunk);
            }
            self.streams.end(&item.session_id);
        }

        debug!(session_id = %item.session_id, chars = text.len(), "Inference complete");
        Ok(Some(json!({ "text": text, "model": model_id })))
    }

    async fn on_update(&self, params: Value) -> Result<Value, LogicError> {
        let mut current = self.params.write();
        if let Some(model) = params.get("modelId") {
            current.model_id = model
                .as_str()
                .ok_or_else(|| LogicError::Update("modelId must be a string".into()))?
                .to_string();
        }
        if let Some(system) = params.get("systemPrompt") {
            current.system_prompt = system.as_str().map(str::to_string);
        }
        if let Some(stream) = params.get("stream") {
            current.stream = stream
                .as_bool()
                .ok_or_else(|| LogicError::Update("stream must be a boolean".into()))?;
        }
        info!(model_id = %current.model_id, stream = current.stream, "Inference parameters updated");
        Ok(json!({
            "modelId": current.model_id,
            "systemPrompt": current.system_prompt,
            "stream": current.stream,
        }))
    }

    async fn management(&self, action: &str, _data: Value) -> Result<Value, LogicError> {
        match action {
            "parameters" => {
                let params = self.params.read();
                Ok(json!({
                    "modelId": params.model_id,
                    "systemPrompt": params.system_prompt,
                    "stream": params.stream,
                }))
            }
            other => Err(LogicError::UnsupportedAction(other.to_string())),
        }
    }
}
