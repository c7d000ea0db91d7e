//! Runtime Error Types

use thiserror::Error;
use vd_common::RoutingError;
use vd_policy::PolicyError;
use vd_queue::QueueError;

use crate::logic::LogicError;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("Node logic error: {0}")]
    Logic(#[from] LogicError),

    #[error("Worker pool error: {message}")]
    Pool { message: String },

    #[error("No output destination for node {label}")]
    NoDestination { label: String },

    #[error("Runtime is shutting down")]
    ShuttingDown,
}

impl RuntimeError {
    pub fn pool(message: impl Into<String>) -> Self {
        Self::Pool { message: message.into() }
    }
}
