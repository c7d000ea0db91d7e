use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use utoipa::ToSchema;

pub mod graph;

pub use graph::{AssignmentTable, NodeOutputs, OutputDescriptor, RoutingError, RoutingGraph, FINAL_KEY};

/// Separates a compiled sub-graph identifier from the rest of a session id
pub const SUBGRAPH_SEPARATOR: &str = "::";

// ============================================================================
// Core Packet Types
// ============================================================================

/// The unit of work that flows between vDAG nodes.
///
/// Only `payload` and `routing_graph` may be rewritten by a hop; everything
/// else is fixed by the producer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Packet {
    pub session_id: String,
    pub sequence_number: u64,
    pub payload: serde_json::Value,
    /// Serialized routing graph; `None` means "use the node's default output"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_graph: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Packet {
    pub fn new(session_id: impl Into<String>, sequence_number: u64, payload: serde_json::Value) -> Self {
        Self {
            session_id: session_id.into(),
            sequence_number,
            payload,
            routing_graph: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_routing_graph(mut self, graph: impl Into<String>) -> Self {
        self.routing_graph = Some(graph.into());
        self
    }

    /// Sub-graph this packet belongs to, derived from a `<subgraph>::<rest>` session id
    pub fn subgraph_id(&self) -> Option<&str> {
        self.session_id
            .split_once(SUBGRAPH_SEPARATOR)
            .map(|(graph, _)| graph)
            .filter(|graph| !graph.is_empty())
    }

    /// Copy of this packet carrying a different payload
    pub fn with_payload(&self, payload: serde_json::Value) -> Self {
        Self {
            payload,
            ..self.clone()
        }
    }

    /// Parse the embedded routing graph, if any
    pub fn graph(&self) -> Result<Option<RoutingGraph>, RoutingError> {
        self.routing_graph
            .as_deref()
            .map(RoutingGraph::parse)
            .transpose()
    }

    /// Copy of this packet whose routing graph has been rewritten by `rewrite`.
    ///
    /// The rewrite sees a freshly parsed graph, so the original packet (and any
    /// other packet sharing the same serialized graph) is never touched.
    pub fn rewrite_graph<F>(&self, rewrite: F) -> Result<Self, RoutingError>
    where
        F: FnOnce(&RoutingGraph) -> Result<RoutingGraph, RoutingError>,
    {
        let graph = self.graph()?.ok_or(RoutingError::MissingGraph)?;
        let rewritten = rewrite(&graph)?;
        Ok(Self {
            routing_graph: Some(rewritten.to_json()?),
            ..self.clone()
        })
    }
}

/// One logical input handed to node business logic
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub session_id: String,
    pub payload: serde_json::Value,
}

impl WorkItem {
    pub fn from_packet(packet: &Packet) -> Self {
        Self {
            session_id: packet.session_id.clone(),
            payload: packet.payload.clone(),
        }
    }
}

// ============================================================================
// Conversation Types
// ============================================================================

/// A single conversational turn exchanged between roles
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Turn {
    pub role: String,
    pub text: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn new(role: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

// ============================================================================
// Health & Metrics Types
// ============================================================================

/// Worker pool dispatch strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Shared-memory workers on the node's runtime
    Tasks,
    /// Each worker owns an OS thread and a private runtime
    Isolated,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub mode: DispatchMode,
    pub sticky: bool,
    pub workers: u32,
    pub queue_capacity_per_worker: u32,
    pub queued: u32,
    pub active_workers: u32,
    pub accepted_total: u64,
    pub rejected_total: u64,
    pub rate_limit_per_minute: Option<u32>,
    pub is_rate_limited: bool,
}

/// Overall node health as reported on the admin surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Up,
    Degraded,
}
