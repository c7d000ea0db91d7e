//! Lifecycle Manager - background tasks for a running node
//!
//! Handles:
//! - TTL sweeps of in-process session state
//! - Periodic worker pool stats logging
//! - Graceful shutdown coordination

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::node::NodeRuntime;

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Interval for expiring idle session state
    pub session_sweep_interval: Duration,
    /// Interval for pool stats logging
    pub pool_stats_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            session_sweep_interval: Duration::from_secs(60),
            pool_stats_interval: Duration::from_secs(30),
        }
    }
}

pub struct LifecycleManager {
    shutdown_tx: broadcast::Sender<()>,
}

impl LifecycleManager {
    /// Start all lifecycle tasks
    pub fn start(runtime: Arc<NodeRuntime>, config: LifecycleConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        // Session state sweeper
        {
            let stores = runtime.policies().stores().clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = config.session_sweep_interval;

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let removed = stores.sweep_expired();
                            if removed > 0 {
                                info!(removed = removed, "Expired idle session state");
                            }
                        }
                        _ = shutdown_rx.recv() => {
                            info!("Session sweeper shutting down");
                            break;
                        }
                    }
                }
            });
        }

        // Pool stats logger
        if runtime.pool_stats().is_some() {
            let runtime = runtime.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = config.pool_stats_interval;

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                let mut last_rejected = 0u64;

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let Some(stats) = runtime.pool_stats() else { continue };
                            if stats.rejected_total > last_rejected {
                                warn!(
                                    rejected = stats.rejected_total - last_rejected,
                                    queued = stats.queued,
                                    active_workers = stats.active_workers,
                                    rate_limited = stats.is_rate_limited,
                                    "Worker pool is shedding load"
                                );
                            } else {
                                debug!(
                                    queued = stats.queued,
                                    active_workers = stats.active_workers,
                                    accepted = stats.accepted_total,
                                    "Worker pool stats"
                                );
                            }
                            last_rejected = stats.rejected_total;
                        }
                        _ = shutdown_rx.recv() => {
                            info!("Pool stats logger shutting down");
                            break;
                        }
                    }
                }
            });
        }

        info!("Lifecycle manager started");
        Self { shutdown_tx }
    }

    /// Signal shutdown to all lifecycle tasks
    pub async fn shutdown(&self) {
        info!("Lifecycle manager shutting down...");
        let _ = self.shutdown_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LifecycleConfig::default();
        assert_eq!(config.session_sweep_interval, Duration::from_secs(60));
        assert_eq!(config.pool_stats_interval, Duration::from_secs(30));
    }
}
