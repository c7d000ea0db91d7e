//! vDAG Policies
//!
//! Policies are the pluggable decision units a node runs around its business
//! logic. This crate provides:
//! - `Policy`: the evaluate/manage contract, plus a registry that builds each
//!   (name, version, settings, parameters) tuple once and caches it
//! - Session state stores (in-process with TTL sweep, or Redis)
//! - `InferenceClient`: the narrow interface to external evaluators/summarizers
//! - `CyclicRouter`: bounded two-role cycles supervised by an arbiter
//! - `HistoryCompactor`: rolling, de-duplicated turn windows with periodic summaries
//! - `Passthrough`: identity policy

pub mod error;
pub mod policy;
pub mod session_store;
pub mod inference;
pub mod cyclic;
pub mod compactor;
pub mod passthrough;

pub use error::PolicyError;
pub use policy::{
    Policy, PolicyContext, PolicyDecision, PolicyDeps, PolicyFactory, PolicyHandle,
    PolicyRegistry, PolicySpec,
};
pub use session_store::{
    ExpirySweep, MemorySessionStore, RedisSessionStore, SessionLocks, SessionStateStore, StoreFactory,
};
pub use inference::{HttpInferenceClient, HttpInferenceConfig, InferenceClient};
pub use cyclic::{ArbiterDecision, CyclicRouter, CyclicRouterSettings, RoleBinding, SessionRoutingState};
pub use compactor::{CompactorSettings, HistoryCompactor, HistoryWindow};
pub use passthrough::Passthrough;

pub type Result<T> = std::result::Result<T, PolicyError>;
