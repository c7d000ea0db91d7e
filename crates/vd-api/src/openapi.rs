use utoipa::OpenApi;

use crate::error::ErrorBody;
use crate::model::{HealthResponse, ManagementRequest, ManagementResponse, PolicyManagementRequest, SubmitResponse};

/// Node Admin API OpenAPI Documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "vDAG Node API",
        version = "1.0.0",
        description = "Administration and direct-submit endpoints of a vDAG node"
    ),
    tags(
        (name = "node", description = "Node logic and packet intake"),
        (name = "policies", description = "Policy management"),
        (name = "monitoring", description = "Health and monitoring")
    ),
    paths(
        super::health_handler,
        super::set_parameters_handler,
        super::management_handler,
        super::policy_management_handler,
        super::pool_stats_handler,
        super::submit_handler,
    ),
    components(schemas(
        HealthResponse,
        ManagementRequest,
        ManagementResponse,
        PolicyManagementRequest,
        SubmitResponse,
        ErrorBody,
        vd_common::PoolStats,
        vd_common::DispatchMode,
        vd_common::HealthStatus,
    ))
)]
pub struct ApiDoc;
