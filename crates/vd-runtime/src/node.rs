//! NodeRuntime - the per-node packet loop
//!
//! Per packet:
//! 1. Pre-policy of the packet's sub-graph (if one is bound)
//! 2. Business logic, once per logical item
//! 3. Post-policy per output (the only place the routing graph changes)
//! 4. Destination resolution for this node's label
//! 5. Delivery through the connection cache, one destination at a time
//!
//! `process` returns a typed outcome; only `record` decides how a drop is
//! logged and counted.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use vd_common::{AssignmentTable, HealthStatus, OutputDescriptor, Packet, PoolStats};
use vd_config::PolicyStage;
use vd_policy::{PolicyContext, PolicyDecision, PolicyRegistry};
use vd_queue::{QueueConsumer, QueueError};

use crate::connection_cache::ConnectionCache;
use crate::error::RuntimeError;
use crate::logic::NodeLogic;
use crate::metrics::{self, Phase};
use crate::pool::WorkerPool;
use crate::Result;

const DEQUEUE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Why a packet produced no delivery at all
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    Policy(String),
    Routing(String),
    Logic(String),
    Backpressure,
}

impl DropReason {
    pub fn label(&self) -> &'static str {
        match self {
            DropReason::Policy(_) => "policy",
            DropReason::Routing(_) => "routing",
            DropReason::Logic(_) => "logic",
            DropReason::Backpressure => "backpressure",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketOutcome {
    /// `sent == 0 && failed == 0` is a terminal hop (no destinations)
    Delivered { sent: usize, failed: usize },
    Dropped { reason: DropReason },
}

#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub label: String,
    pub node_id: String,
    pub pop_timeout: Duration,
    /// Destination for packets that carry no routing graph
    pub default_output: Option<OutputDescriptor>,
}

impl NodeSettings {
    pub fn new(label: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            node_id: node_id.into(),
            pop_timeout: Duration::from_secs(5),
            default_output: None,
        }
    }

    pub fn with_default_output(mut self, output: OutputDescriptor) -> Self {
        self.default_output = Some(output);
        self
    }

    pub fn with_pop_timeout(mut self, timeout: Duration) -> Self {
        self.pop_timeout = timeout;
        self
    }
}

#[derive(Default)]
struct Tally {
    sent: usize,
    failed: usize,
    first_drop: Option<DropReason>,
}

impl Tally {
    fn drop_once(&mut self, reason: DropReason) {
        if self.first_drop.is_none() {
            self.first_drop = Some(reason);
        }
    }

    fn into_outcome(self) -> PacketOutcome {
        match self.first_drop {
            Some(reason) if self.sent == 0 && self.failed == 0 => PacketOutcome::Dropped { reason },
            _ => PacketOutcome::Delivered {
                sent: self.sent,
                failed: self.failed,
            },
        }
    }
}

pub struct NodeRuntime {
    settings: NodeSettings,
    consumer: Arc<dyn QueueConsumer>,
    logic: Arc<dyn NodeLogic>,
    policies: Arc<PolicyRegistry>,
    assignments: Arc<AssignmentTable>,
    cache: Arc<ConnectionCache>,
    pool: Option<Arc<WorkerPool>>,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    processed: AtomicU64,
    dropped: AtomicU64,
}

impl NodeRuntime {
    pub fn new(
        settings: NodeSettings,
        consumer: Arc<dyn QueueConsumer>,
        logic: Arc<dyn NodeLogic>,
        policies: Arc<PolicyRegistry>,
        assignments: Arc<AssignmentTable>,
        cache: Arc<ConnectionCache>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            settings,
            consumer,
            logic,
            policies,
            assignments,
            cache,
            pool: None,
            running: AtomicBool::new(true),
            shutdown_tx,
            processed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn with_pool(mut self, pool: Arc<WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn label(&self) -> &str {
        &self.settings.label
    }

    pub fn node_id(&self) -> &str {
        &self.settings.node_id
    }

    pub fn policies(&self) -> &Arc<PolicyRegistry> {
        &self.policies
    }

    pub fn connection_cache(&self) -> &Arc<ConnectionCache> {
        &self.cache
    }

    pub fn pool_stats(&self) -> Option<PoolStats> {
        self.pool.as_ref().map(|p| p.get_stats())
    }

    pub fn processed_total(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    /// Dequeue loop; returns once shut down or the consumer stops
    pub async fn start(self: Arc<Self>) -> Result<()> {
        info!(
            node_label = %self.settings.label,
            node_id = %self.settings.node_id,
            queue = %self.consumer.identifier(),
            pooled = self.pool.is_some(),
            "Starting node runtime"
        );
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!(queue = %self.consumer.identifier(), "Node runtime shutting down");
                    break;
                }
                result = self.consumer.pop(self.settings.pop_timeout) => {
                    match result {
                        Ok(Some(packet)) => {
                            self.dispatch(packet).await;
                        }
                        Ok(None) => {}
                        Err(QueueError::Stopped) => {
                            info!(queue = %self.consumer.identifier(), "Consumer stopped");
                            break;
                        }
                        Err(e) => {
                            error!(error = %e, queue = %self.consumer.identifier(), "Error dequeuing");
                            tokio::time::sleep(DEQUEUE_ERROR_BACKOFF).await;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Accept one packet from the queue or the direct transport. With a pool
    /// the packet is assigned (and may be rejected); otherwise it runs inline.
    pub async fn dispatch(self: &Arc<Self>, packet: Packet) -> bool {
        metrics::packet_received();
        if !self.running.load(Ordering::SeqCst) {
            self.record(&packet.session_id, PacketOutcome::Dropped { reason: DropReason::Backpressure });
            return false;
        }

        let Some(pool) = self.pool.clone() else {
            let session_id = packet.session_id.clone();
            let outcome = self.process(packet).await;
            self.record(&session_id, outcome);
            return true;
        };

        let session_id = packet.session_id.clone();
        let runtime = self.clone();
        let job = Box::pin(async move {
            let session_id = packet.session_id.clone();
            let outcome = runtime.process(packet).await;
            runtime.record(&session_id, outcome);
        });
        if pool.assign(job, &session_id) {
            true
        } else {
            self.record(&session_id, PacketOutcome::Dropped { reason: DropReason::Backpressure });
            false
        }
    }

    /// Run one packet through policies, logic and delivery
    pub async fn process(&self, packet: Packet) -> PacketOutcome {
        let started = Instant::now();
        let subgraph = packet.subgraph_id().map(str::to_string);
        let ctx = PolicyContext::new(self.settings.label.clone(), subgraph.clone(), self.assignments.clone());
        let mut tally = Tally::default();

        let phase_start = Instant::now();
        let pre = subgraph.as_deref().and_then(|g| self.policies.resolve(g, PolicyStage::Pre));
        let inputs = match pre {
            Some(handle) => match handle.evaluate_or_default(packet, &ctx).await {
                PolicyDecision::Drop { reason } => {
                    return PacketOutcome::Dropped { reason: DropReason::Policy(reason) };
                }
                decision => decision.into_packets(),
            },
            None => vec![packet],
        };
        metrics::phase(Phase::PreProcess, phase_start.elapsed());

        let post = subgraph.as_deref().and_then(|g| self.policies.resolve(g, PolicyStage::Post));

        for input in inputs {
            let phase_start = Instant::now();
            let outputs = self.run_logic(&input).await;
            metrics::phase(Phase::BusinessLogic, phase_start.elapsed());

            let outputs = match outputs {
                Ok(outputs) => outputs,
                Err(reason) => {
                    tally.drop_once(reason);
                    continue;
                }
            };

            for payload in outputs {
                let output = input.with_payload(payload);
                let phase_start = Instant::now();
                let packets = match &post {
                    Some(handle) => match handle.evaluate_or_default(output, &ctx).await {
                        PolicyDecision::Drop { reason } => {
                            debug!(session_id = %input.session_id, reason = %reason, "Post-policy dropped output");
                            tally.drop_once(DropReason::Policy(reason));
                            continue;
                        }
                        decision => decision.into_packets(),
                    },
                    None => vec![output],
                };
                metrics::phase(Phase::PostProcess, phase_start.elapsed());

                for packet in packets {
                    match self.destinations(&packet, subgraph.as_deref()) {
                        Ok(destinations) => self.deliver(&packet, &destinations, &mut tally).await,
                        Err(e) => {
                            warn!(
                                session_id = %packet.session_id,
                                node_label = %self.settings.label,
                                error = %e,
                                "Unroutable output"
                            );
                            tally.drop_once(DropReason::Routing(e.to_string()));
                        }
                    }
                }
            }
        }

        metrics::phase(Phase::EndToEnd, started.elapsed());
        tally.into_outcome()
    }

    /// Items from `on_preprocess`, each through `on_data`. Item failures are
    /// skipped; a packet whose every item failed is a logic drop.
    async fn run_logic(&self, input: &Packet) -> std::result::Result<Vec<Value>, DropReason> {
        let items = self.logic.on_preprocess(input).await.map_err(|e| {
            warn!(session_id = %input.session_id, error = %e, "Preprocessing failed");
            DropReason::Logic(e.to_string())
        })?;

        let item_count = items.len();
        let mut outputs = Vec::with_capacity(item_count);
        let mut last_error = None;
        for item in items {
            match self.logic.on_data(item).await {
                Ok(Some(payload)) => outputs.push(payload),
                Ok(None) => {}
                Err(e) => {
                    warn!(session_id = %input.session_id, error = %e, "Business logic failed for item");
                    last_error = Some(e.to_string());
                }
            }
        }

        match last_error {
            Some(message) if outputs.is_empty() => Err(DropReason::Logic(message)),
            _ => Ok(outputs),
        }
    }

    /// Destinations for this node's label; no graph means the default output
    fn destinations(&self, packet: &Packet, subgraph: Option<&str>) -> Result<Vec<OutputDescriptor>> {
        match packet.graph()? {
            Some(graph) => Ok(graph.outputs_for(&self.settings.label, subgraph)?),
            None => self
                .settings
                .default_output
                .clone()
                .map(|d| vec![d])
                .ok_or_else(|| RuntimeError::NoDestination {
                    label: self.settings.label.clone(),
                }),
        }
    }

    async fn deliver(&self, packet: &Packet, destinations: &[OutputDescriptor], tally: &mut Tally) {
        for dest in destinations {
            let Some(handle) = self
                .cache
                .get(&dest.node_id, &dest.transport_host, dest.transport_port)
                .await
            else {
                metrics::delivery(false);
                tally.failed += 1;
                continue;
            };

            match handle.push(&dest.queue_name, packet).await {
                Ok(()) => {
                    metrics::delivery(true);
                    tally.sent += 1;
                    debug!(
                        session_id = %packet.session_id,
                        node_id = %dest.node_id,
                        queue = %dest.queue_name,
                        "Delivered"
                    );
                }
                Err(e) => {
                    metrics::delivery(false);
                    tally.failed += 1;
                    warn!(
                        session_id = %packet.session_id,
                        node_id = %dest.node_id,
                        queue = %dest.queue_name,
                        error = %e,
                        "Delivery failed, evicting connection"
                    );
                    self.cache.remove(&dest.transport_host, dest.transport_port);
                }
            }
        }
    }

    fn record(&self, session_id: &str, outcome: PacketOutcome) {
        match outcome {
            PacketOutcome::Delivered { sent, failed } => {
                self.processed.fetch_add(1, Ordering::SeqCst);
                if failed > 0 {
                    warn!(session_id = %session_id, sent = sent, failed = failed, "Partial delivery");
                } else {
                    debug!(session_id = %session_id, sent = sent, "Packet processed");
                }
            }
            PacketOutcome::Dropped { reason } => {
                self.dropped.fetch_add(1, Ordering::SeqCst);
                metrics::packet_dropped(reason.label());
                warn!(session_id = %session_id, reason = ?reason, "Packet dropped");
            }
        }
    }

    pub async fn update_parameters(&self, params: Value) -> Result<Value> {
        Ok(self.logic.on_update(params).await?)
    }

    pub async fn management(&self, action: &str, data: Value) -> Result<Value> {
        Ok(self.logic.management(action, data).await?)
    }

    pub async fn health(&self) -> HealthStatus {
        if !self.running.load(Ordering::SeqCst) {
            return HealthStatus::Degraded;
        }
        self.logic.health().await
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the loop, the consumer and the pool
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(node_label = %self.settings.label, "Node runtime shutting down...");
        let _ = self.shutdown_tx.send(());
        self.consumer.stop().await;
        if let Some(pool) = &self.pool {
            pool.shutdown().await;
        }
        info!(
            processed = self.processed_total(),
            dropped = self.dropped_total(),
            "Node runtime shutdown complete"
        );
    }
}
