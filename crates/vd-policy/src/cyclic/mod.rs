//! Bounded Cyclic Router
//!
//! A post-policy that lets two peer roles alternate turns under an arbiter:
//! - Peer nodes: per-session counters, evaluator-gated advancement, self-retry
//!   with a budget, escalation to the arbiter
//! - Arbiter node: decision parsing, continuation, and a one-shot forced
//!   finalization handshake once a hard cap is reached
//!
//! Routing graphs are only ever rewritten (never merged), so each hop leaves
//! with exactly one destination set.

mod decision;
mod router;
mod state;

use serde::{Deserialize, Serialize};

pub use decision::{parse_decision, ArbiterDecision, REPLY_FORMAT};
pub use router::CyclicRouter;
pub use state::SessionRoutingState;

/// A peer role and the node label that plays it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleBinding {
    pub name: String,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CyclicRouterSettings {
    pub roles: Vec<RoleBinding>,
    pub arbiter_label: String,
    pub evaluator_model: String,
    pub quality_threshold: f64,
    pub max_consecutive_by_same_role: u32,
    /// Escalate every N total rounds; 0 disables
    pub judge_interval_rounds: u32,
    pub max_router_retries: u32,
    pub max_rounds: u32,
    pub judge_continuation_cap: u32,
    /// Turns carried in the sidecar of an advancing packet
    pub sidecar_window: usize,
}

impl Default for CyclicRouterSettings {
    fn default() -> Self {
        Self {
            roles: Vec::new(),
            arbiter_label: "arbiter".to_string(),
            evaluator_model: "evaluator".to_string(),
            quality_threshold: 0.5,
            max_consecutive_by_same_role: 3,
            judge_interval_rounds: 4,
            max_router_retries: 2,
            max_rounds: 12,
            judge_continuation_cap: 3,
            sidecar_window: 4,
        }
    }
}

impl CyclicRouterSettings {
    pub fn role(&self, name: &str) -> Option<&RoleBinding> {
        self.roles.iter().find(|r| r.name == name)
    }

    pub fn role_for_label(&self, label: &str) -> Option<&RoleBinding> {
        self.roles.iter().find(|r| r.label == label)
    }

    pub fn opponent_of(&self, name: &str) -> Option<&RoleBinding> {
        if self.role(name).is_none() {
            return None;
        }
        self.roles.iter().find(|r| r.name != name)
    }

    pub fn role_names(&self) -> Vec<String> {
        self.roles.iter().map(|r| r.name.clone()).collect()
    }
}
