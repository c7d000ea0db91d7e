//! Policy Error Types

use thiserror::Error;
use vd_common::RoutingError;

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("Unknown policy: {0}")]
    UnknownPolicy(String),

    #[error("Invalid settings for {policy}: {message}")]
    InvalidSettings { policy: String, message: String },

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Session store error: {0}")]
    Store(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported management action: {0}")]
    UnsupportedAction(String),

    #[error("Bad management request: {0}")]
    BadRequest(String),
}

impl PolicyError {
    pub fn invalid_settings(policy: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidSettings {
            policy: policy.into(),
            message: message.into(),
        }
    }
}

impl From<redis::RedisError> for PolicyError {
    fn from(e: redis::RedisError) -> Self {
        Self::Store(e.to_string())
    }
}

impl From<reqwest::Error> for PolicyError {
    fn from(e: reqwest::Error) -> Self {
        Self::Inference(e.to_string())
    }
}
