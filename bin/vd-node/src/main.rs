//! vDAG Node
//!
//! One process per graph node: consumes its inbound queue, runs policies and
//! business logic, forwards results to the next nodes, and serves the admin
//! API plus a Prometheus scrape endpoint.
//!
//! ## Configuration
//!
//! | Source | Purpose |
//! |--------|---------|
//! | `--config` / `VDAG_CONFIG` | TOML file; defaults apply when absent |
//! | `VDAG_*` | Per-field overrides, see `vd-config` |
//! | `--api-port`, `--metrics-port` | Port overrides on top of the file |
//! | `RUST_LOG` | Log filter, `info` by default |
//! | `VDAG_LOG_FORMAT=json` | JSON log lines |

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use clap::Parser;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use vd_api::{create_router, AppState};
use vd_config::{QueueBackend, VdagConfig};
use vd_policy::{HttpInferenceClient, HttpInferenceConfig, InferenceClient, PolicyDeps, PolicyRegistry, StoreFactory};
use vd_queue::{DirectClientConfig, MemoryBroker, QueueConsumer, RedisQueueConsumer};
use vd_runtime::{
    BrokerConnector, ConnectionCache, Connector, InferenceLogic, LifecycleConfig, LifecycleManager, NodeRuntime,
    NodeSettings, StreamHub, TransportConnector, WorkerPool,
};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// vDAG node process
#[derive(Parser, Debug)]
#[command(name = "vd-node")]
#[command(about = "Runs one node of a virtual DAG")]
struct Args {
    /// Path to the node's TOML configuration
    #[arg(long, env = "VDAG_CONFIG")]
    config: Option<PathBuf>,

    /// Admin API port (overrides [api].port)
    #[arg(long)]
    api_port: Option<u16>,

    /// Metrics server port (overrides [metrics].port)
    #[arg(long)]
    metrics_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_tracing();

    info!("Starting vDAG node");

    // 1. Configuration
    let mut config = VdagConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    if let Some(port) = args.api_port {
        config.api.port = port;
    }
    if let Some(port) = args.metrics_port {
        config.metrics.port = port;
    }

    // 2. Metrics recorder
    let prometheus = if config.metrics.enabled {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("failed to install Prometheus recorder")?;
        vd_runtime::metrics::describe();
        Some(handle)
    } else {
        None
    };

    // 3. Policies
    let stores = StoreFactory::from_config(&config.session_store, &config.queue.redis_url)
        .await
        .context("failed to build session store")?;
    let inference: Arc<dyn InferenceClient> = Arc::new(
        HttpInferenceClient::new(HttpInferenceConfig::from(&config.inference))
            .context("failed to build inference client")?,
    );
    let policies = Arc::new(PolicyRegistry::with_builtins(PolicyDeps {
        inference: inference.clone(),
        stores: Arc::new(stores),
    }));
    policies
        .bind_all(&config.policies)
        .context("failed to bind policies")?;

    // 4. Transport: inbound consumer and outbound connector
    let (consumer, connector): (Arc<dyn QueueConsumer>, Arc<dyn Connector>) = match config.queue.backend {
        QueueBackend::Redis => {
            let consumer = RedisQueueConsumer::connect(&config.queue.redis_url, config.node.inbound_queue.clone())
                .await
                .context("failed to connect inbound queue")?;
            let direct = DirectClientConfig {
                request_timeout: Duration::from_millis(config.connection_cache.direct_timeout_ms),
                ..DirectClientConfig::default()
            };
            let consumer: Arc<dyn QueueConsumer> = Arc::new(consumer);
            let connector: Arc<dyn Connector> = Arc::new(TransportConnector::new(direct));
            (consumer, connector)
        }
        QueueBackend::Memory => {
            warn!("Memory queue backend selected; only this process can reach the node");
            let broker = MemoryBroker::new();
            let consumer: Arc<dyn QueueConsumer> = Arc::new(broker.consumer(config.node.inbound_queue.clone()));
            let connector: Arc<dyn Connector> = Arc::new(BrokerConnector::new(broker));
            (consumer, connector)
        }
    };
    let cache = Arc::new(ConnectionCache::from_config(connector, &config.connection_cache));

    // 5. Runtime
    let streams = Arc::new(StreamHub::new());
    let logic = Arc::new(InferenceLogic::new(inference, streams.clone(), config.inference.model_id.clone()));

    let mut settings = NodeSettings::new(config.node.label.clone(), config.node.node_id.clone())
        .with_pop_timeout(Duration::from_secs(config.queue.pop_timeout_secs));
    if let Some(output) = config.default_output() {
        settings = settings.with_default_output(output);
    }

    let mut runtime = NodeRuntime::new(
        settings,
        consumer,
        logic,
        policies,
        Arc::new(config.assignment_table()),
        cache,
    );
    if config.worker_pool.enabled {
        let pool = WorkerPool::start(config.worker_pool.clone()).context("failed to start worker pool")?;
        runtime = runtime.with_pool(Arc::new(pool));
    }
    let runtime = Arc::new(runtime);

    let lifecycle = LifecycleManager::start(
        runtime.clone(),
        LifecycleConfig {
            session_sweep_interval: Duration::from_secs(config.session_store.sweep_interval_secs),
            ..LifecycleConfig::default()
        },
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // 6. Admin API
    let app = create_router(AppState::new(runtime.clone(), streams))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));

    let api_addr = format!("{}:{}", config.api.host, config.api.port);
    let api_listener = TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind {}", api_addr))?;
    info!(addr = %api_addr, "Admin API listening");
    let api_handle = {
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                result = axum::serve(api_listener, app) => {
                    if let Err(e) = result {
                        error!("API server error: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("API server shutting down");
                }
            }
        })
    };

    // 7. Metrics server
    let metrics_handle = match prometheus {
        Some(handle) => {
            let metrics_addr = format!("0.0.0.0:{}", config.metrics.port);
            let listener = TcpListener::bind(&metrics_addr)
                .await
                .with_context(|| format!("failed to bind {}", metrics_addr))?;
            info!("Metrics server listening on http://{}/metrics", metrics_addr);
            let metrics_app = Router::new().route("/metrics", get(move || render_metrics(handle.clone())));
            let mut shutdown_rx = shutdown_tx.subscribe();
            Some(tokio::spawn(async move {
                tokio::select! {
                    result = axum::serve(listener, metrics_app) => {
                        if let Err(e) = result {
                            error!("Metrics server error: {}", e);
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Metrics server shutting down");
                    }
                }
            }))
        }
        None => None,
    };

    // 8. Dequeue loop
    let runtime_handle = {
        let runtime = runtime.clone();
        tokio::spawn(async move {
            if let Err(e) = runtime.start().await {
                error!("Node runtime error: {}", e);
            }
        })
    };

    info!(
        node_label = %config.node.label,
        node_id = %config.node.node_id,
        inbound_queue = %config.node.inbound_queue,
        pool = config.worker_pool.enabled,
        "vDAG node started. Press Ctrl+C to shutdown."
    );

    shutdown_signal().await;
    info!("Shutdown signal received...");

    // Graceful shutdown
    lifecycle.shutdown().await;
    runtime.shutdown().await;
    let _ = shutdown_tx.send(());

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, runtime_handle).await.is_err() {
        warn!("Node runtime did not stop within {:?}", SHUTDOWN_TIMEOUT);
    }
    let _ = api_handle.await;
    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    info!("vDAG node shutdown complete");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
    let json = std::env::var("VDAG_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn render_metrics(handle: PrometheusHandle) -> String {
    handle.render()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
