//! Request and response bodies of the admin surface

use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use vd_common::HealthStatus;
use vd_config::PolicyStage;

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub node_label: String,
    pub node_id: String,
    pub version: String,
    pub processed_total: u64,
    pub dropped_total: u64,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ManagementRequest {
    pub action: String,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub data: Value,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ManagementResponse {
    pub success: bool,
    #[schema(value_type = Object)]
    pub result: Value,
}

impl ManagementResponse {
    pub fn ok(result: Value) -> Self {
        Self { success: true, result }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PolicyManagementRequest {
    pub subgraph: String,
    #[schema(value_type = String, example = "post")]
    pub stage: PolicyStage,
    pub action: String,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub data: Value,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub accepted: bool,
    pub session_id: String,
}

/// First frame a streaming client sends
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamConnect {
    pub session_id: String,
    #[serde(default)]
    pub connect: bool,
}
