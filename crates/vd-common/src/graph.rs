//! Routing Graph Model
//!
//! The packet-carried description of where a packet goes next. Two shapes are
//! accepted on the wire:
//! - Flat: `node label -> [outputs]`, used by simple pipelines
//! - Nested: `sub-graph id -> node label -> [outputs]`, used when a job crosses
//!   several independently compiled sub-graphs. A `final` entry inside a
//!   sub-graph is the terminal hand-off once a node's own outputs are empty.
//!
//! Every rewrite returns a new graph; nothing here mutates a graph that a
//! caller still holds.

use std::collections::{BTreeMap, HashMap};
use serde::{Deserialize, Serialize};

/// Sentinel node label for a sub-graph's terminal hand-off
pub const FINAL_KEY: &str = "final";

#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("Packet carries no routing graph")]
    MissingGraph,

    #[error("Node '{0}' missing from routing graph")]
    MissingNode(String),

    #[error("Sub-graph '{0}' missing from routing graph")]
    MissingSubgraph(String),

    #[error("Nested routing graph used without a sub-graph identifier")]
    SubgraphRequired,

    #[error("Unknown node label: {0}")]
    UnknownLabel(String),

    #[error("Unknown node id: {0}")]
    UnknownNodeId(String),

    #[error("Malformed routing graph: {0}")]
    Malformed(String),
}

/// One downstream destination
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct OutputDescriptor {
    pub transport_host: String,
    /// Port `0` selects the direct request/response transport
    pub transport_port: u16,
    pub queue_name: String,
    pub node_id: String,
}

impl OutputDescriptor {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        queue_name: impl Into<String>,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            transport_host: host.into(),
            transport_port: port,
            queue_name: queue_name.into(),
            node_id: node_id.into(),
        }
    }

    pub fn is_direct(&self) -> bool {
        self.transport_port == 0
    }
}

/// Outputs per node label. Ordered so serialization is deterministic.
pub type NodeOutputs = BTreeMap<String, Vec<OutputDescriptor>>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum RoutingGraph {
    Flat(NodeOutputs),
    Nested(BTreeMap<String, NodeOutputs>),
}

impl RoutingGraph {
    pub fn parse(raw: &str) -> Result<Self, RoutingError> {
        serde_json::from_str(raw).map_err(|e| RoutingError::Malformed(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, RoutingError> {
        serde_json::to_string(self).map_err(|e| RoutingError::Malformed(e.to_string()))
    }

    /// Resolve the outputs for `label`.
    ///
    /// In the nested form an empty output list falls back to the sub-graph's
    /// `final` entry (or to nothing when the sub-graph has no `final`).
    pub fn outputs_for(&self, label: &str, subgraph: Option<&str>) -> Result<Vec<OutputDescriptor>, RoutingError> {
        match self {
            RoutingGraph::Flat(nodes) => nodes
                .get(label)
                .cloned()
                .ok_or_else(|| RoutingError::MissingNode(label.to_string())),
            RoutingGraph::Nested(graphs) => {
                let nodes = Self::subgraph(graphs, subgraph)?;
                let own = nodes
                    .get(label)
                    .ok_or_else(|| RoutingError::MissingNode(label.to_string()))?;
                if !own.is_empty() {
                    return Ok(own.clone());
                }
                Ok(nodes.get(FINAL_KEY).cloned().unwrap_or_default())
            }
        }
    }

    /// Labels present for the given sub-graph (or the flat graph)
    pub fn labels(&self, subgraph: Option<&str>) -> Vec<String> {
        match self {
            RoutingGraph::Flat(nodes) => nodes.keys().cloned().collect(),
            RoutingGraph::Nested(graphs) => Self::subgraph(graphs, subgraph)
                .map(|nodes| nodes.keys().cloned().collect())
                .unwrap_or_default(),
        }
    }

    /// Overwrite `label`'s outputs with the nodes assigned to `targets`
    pub fn set_destination_nodes<S: AsRef<str>>(
        &self,
        label: &str,
        subgraph: Option<&str>,
        targets: &[S],
        table: &AssignmentTable,
    ) -> Result<RoutingGraph, RoutingError> {
        let outputs = table.resolve_labels(targets)?;
        self.replace_outputs(label, subgraph, outputs)
    }

    /// Overwrite `label`'s outputs with explicit node ids, skipping label resolution
    pub fn set_destination_blocks<S: AsRef<str>>(
        &self,
        label: &str,
        subgraph: Option<&str>,
        node_ids: &[S],
        table: &AssignmentTable,
    ) -> Result<RoutingGraph, RoutingError> {
        let outputs = table.resolve_blocks(node_ids)?;
        self.replace_outputs(label, subgraph, outputs)
    }

    /// Clear `label`'s outputs, terminating the packet's path at this node
    pub fn finalize(&self, label: &str, subgraph: Option<&str>) -> Result<RoutingGraph, RoutingError> {
        self.replace_outputs(label, subgraph, Vec::new())
    }

    fn replace_outputs(
        &self,
        label: &str,
        subgraph: Option<&str>,
        outputs: Vec<OutputDescriptor>,
    ) -> Result<RoutingGraph, RoutingError> {
        let mut copy = self.clone();
        let slot = match &mut copy {
            RoutingGraph::Flat(nodes) => nodes.get_mut(label),
            RoutingGraph::Nested(graphs) => {
                let key = subgraph.ok_or(RoutingError::SubgraphRequired)?;
                graphs
                    .get_mut(key)
                    .ok_or_else(|| RoutingError::MissingSubgraph(key.to_string()))?
                    .get_mut(label)
            }
        };
        let slot = slot.ok_or_else(|| RoutingError::MissingNode(label.to_string()))?;
        *slot = outputs;
        Ok(copy)
    }

    fn subgraph<'a>(
        graphs: &'a BTreeMap<String, NodeOutputs>,
        subgraph: Option<&str>,
    ) -> Result<&'a NodeOutputs, RoutingError> {
        let key = subgraph.ok_or(RoutingError::SubgraphRequired)?;
        graphs
            .get(key)
            .ok_or_else(|| RoutingError::MissingSubgraph(key.to_string()))
    }
}

/// Resolves node labels to node ids, and node ids to physical destinations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssignmentTable {
    labels: HashMap<String, String>,
    blocks: HashMap<String, OutputDescriptor>,
}

impl AssignmentTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign `label` to the node described by `descriptor`
    pub fn assign(&mut self, label: impl Into<String>, descriptor: OutputDescriptor) {
        self.labels.insert(label.into(), descriptor.node_id.clone());
        self.insert_block(descriptor);
    }

    /// Register a node without a label
    pub fn insert_block(&mut self, descriptor: OutputDescriptor) {
        self.blocks.insert(descriptor.node_id.clone(), descriptor);
    }

    pub fn node_id_for(&self, label: &str) -> Option<&str> {
        self.labels.get(label).map(String::as_str)
    }

    pub fn descriptor_for(&self, node_id: &str) -> Option<&OutputDescriptor> {
        self.blocks.get(node_id)
    }

    pub fn resolve_labels<S: AsRef<str>>(&self, labels: &[S]) -> Result<Vec<OutputDescriptor>, RoutingError> {
        labels
            .iter()
            .map(|label| {
                let label = label.as_ref();
                let node_id = self
                    .node_id_for(label)
                    .ok_or_else(|| RoutingError::UnknownLabel(label.to_string()))?;
                self.descriptor_for(node_id)
                    .cloned()
                    .ok_or_else(|| RoutingError::UnknownNodeId(node_id.to_string()))
            })
            .collect()
    }

    pub fn resolve_blocks<S: AsRef<str>>(&self, node_ids: &[S]) -> Result<Vec<OutputDescriptor>, RoutingError> {
        node_ids
            .iter()
            .map(|id| {
                self.descriptor_for(id.as_ref())
                    .cloned()
                    .ok_or_else(|| RoutingError::UnknownNodeId(id.as_ref().to_string()))
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}
