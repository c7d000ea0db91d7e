//! Metric names and recording helpers.
//!
//! Everything goes through the `metrics` facade; when no recorder is installed
//! the calls are no-ops.

use std::time::Duration;
use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};

pub const PACKETS_RECEIVED: &str = "vdag_packets_received_total";
pub const PACKETS_DROPPED: &str = "vdag_packets_dropped_total";
pub const DELIVERIES: &str = "vdag_deliveries_total";
pub const PHASE_DURATION: &str = "vdag_phase_duration_seconds";
pub const POOL_REJECTED: &str = "vdag_pool_rejected_total";
pub const CONNECTION_ATTEMPTS: &str = "vdag_connection_attempts_total";

/// Packet lifecycle phase timed by the node runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    PreProcess,
    BusinessLogic,
    PostProcess,
    EndToEnd,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::PreProcess => "pre_process",
            Phase::BusinessLogic => "business_logic",
            Phase::PostProcess => "post_process",
            Phase::EndToEnd => "end_to_end",
        }
    }
}

/// Register descriptions with whatever recorder is installed
pub fn describe() {
    describe_counter!(PACKETS_RECEIVED, "Packets dequeued or submitted to this node");
    describe_counter!(PACKETS_DROPPED, "Packets dropped before delivery, by reason");
    describe_counter!(DELIVERIES, "Per-destination delivery attempts, by result");
    describe_histogram!(PHASE_DURATION, Unit::Seconds, "Time spent in each packet phase");
    describe_counter!(POOL_REJECTED, "Jobs rejected by the worker pool");
    describe_counter!(CONNECTION_ATTEMPTS, "Transport connection attempts, by result");
}

pub fn packet_received() {
    counter!(PACKETS_RECEIVED).increment(1);
}

pub fn packet_dropped(reason: &'static str) {
    counter!(PACKETS_DROPPED, "reason" => reason).increment(1);
}

pub fn delivery(success: bool) {
    let result = if success { "success" } else { "failure" };
    counter!(DELIVERIES, "result" => result).increment(1);
}

pub fn phase(phase: Phase, elapsed: Duration) {
    histogram!(PHASE_DURATION, "phase" => phase.as_str()).record(elapsed.as_secs_f64());
}

pub fn pool_rejected() {
    counter!(POOL_REJECTED).increment(1);
}

pub fn connection_attempt(success: bool) {
    let result = if success { "success" } else { "failure" };
    counter!(CONNECTION_ATTEMPTS, "result" => result).increment(1);
}
