use async_trait::async_trait;
use serde_json::{json, Value};
use vd_common::Packet;

use crate::{Policy, PolicyContext, PolicyDecision, Result};

/// Forwards every packet unchanged
pub struct Passthrough;

#[async_trait]
impl Policy for Passthrough {
    async fn evaluate(&self, _params: &Value, input: Packet, _ctx: &PolicyContext) -> Result<PolicyDecision> {
        Ok(PolicyDecision::Forward(input))
    }

    async fn manage(&self, action: &str, _data: Value) -> Result<Value> {
        Ok(json!({ "policy": "passthrough", "action": action, "result": "noop" }))
    }
}
