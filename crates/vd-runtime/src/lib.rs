//! vDAG Node Runtime
//!
//! This crate provides the per-node machinery:
//! - NodeRuntime: dequeue, pre-policy, business logic, post-policy, fan-out
//! - ConnectionCache: destination handles with probe and bounded reconnect
//! - WorkerPool: bounded per-worker queues with sticky or random assignment
//! - NodeLogic: the business-logic collaborator contract
//! - StreamHub: session-keyed side channel for partial results
//! - Lifecycle: background sweeps and stats logging

pub mod error;
pub mod connection_cache;
pub mod pool;
pub mod logic;
pub mod node;
pub mod streaming;
pub mod lifecycle;
pub mod metrics;

pub use error::RuntimeError;
pub use connection_cache::{BrokerConnector, ConnectionCache, Connector, TransportConnector};
pub use pool::{Job, WorkerPool};
pub use logic::{EchoLogic, InferenceLogic, LogicError, NodeLogic};
pub use node::{DropReason, NodeRuntime, NodeSettings, PacketOutcome};
pub use streaming::{StreamFrame, StreamHub, END_OF_STREAM};
pub use lifecycle::{LifecycleConfig, LifecycleManager};

pub type Result<T> = std::result::Result<T, RuntimeError>;
