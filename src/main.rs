use kanari::controller::analyzer::Analyzer;
use kanari::controller::bootstrap::KubeInitializer;
use kanari::controller::engine::RolloutEngine;
use kanari::controller::events::KubeEventRecorder;
use kanari::controller::metrics::PrometheusGateway;
use kanari::controller::registry::{run_watcher, Registry};
use kanari::controller::router::KubeRouteGateway;
use kanari::controller::store::KubeCanaryStore;
use kanari::controller::ticker::Ticker;
use kanari::controller::workload::KubeWorkloadGateway;
use kanari::server::{run_health_server, shutdown_channel, wait_for_signal, ReadinessState};
use kube::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Default port for health endpoints
const DEFAULT_HEALTH_PORT: u16 = 8080;

/// Default tick period in seconds
const DEFAULT_TICK_INTERVAL_SECS: u64 = 10;

/// Default Prometheus address for metric analysis
const DEFAULT_METRICS_SERVER: &str = "http://prometheus:9090";

/// Get the health server port from env (default: 8080)
fn health_port() -> u16 {
    std::env::var("KANARI_HEALTH_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_HEALTH_PORT)
}

/// Get the tick period from env (default: 10s)
fn tick_interval() -> Duration {
    let secs = std::env::var("KANARI_TICK_INTERVAL")
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|secs| *secs > 0)
        .unwrap_or(DEFAULT_TICK_INTERVAL_SECS);
    Duration::from_secs(secs)
}

/// Get the Prometheus address from env (default: http://prometheus:9090)
fn metrics_server() -> String {
    std::env::var("KANARI_METRICS_SERVER")
        .unwrap_or_else(|_| DEFAULT_METRICS_SERVER.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting KANARI canary rollout controller");

    let (shutdown, shutdown_signal) = shutdown_channel();
    let readiness = ReadinessState::new();

    let client = match Client::try_default().await {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "Failed to create Kubernetes client");
            return Err(e.into());
        }
    };
    info!("Connected to Kubernetes cluster");

    // Probe server
    let probe_readiness = readiness.clone();
    let health_handle = tokio::spawn(async move {
        if let Err(e) = run_health_server(health_port(), probe_readiness).await {
            warn!(error = %e, "health server failed");
        }
    });

    // Active canary registry, maintained by the watch loop
    let registry = Arc::new(Registry::new());
    let watcher_handle = tokio::spawn(run_watcher(client.clone(), Arc::clone(&registry)));

    let metrics_address = metrics_server();
    info!(address = %metrics_address, "Prometheus client configured");

    let engine = Arc::new(RolloutEngine::new(
        Arc::new(KubeWorkloadGateway::new(client.clone())),
        Arc::new(KubeRouteGateway::new(client.clone())),
        Arc::new(KubeCanaryStore::new(client.clone())),
        Analyzer::new(Arc::new(PrometheusGateway::new(metrics_address))),
        Arc::new(KubeEventRecorder::new(client.clone())),
        Arc::new(KubeInitializer::new(client)),
    ));

    let interval = tick_interval();
    let ticker = Ticker::new(engine, Arc::clone(&registry), interval);

    readiness.set_ready();
    info!(interval_secs = interval.as_secs(), "Controller ready, starting tick loop");

    tokio::select! {
        _ = ticker.run(shutdown_signal) => {
            info!("tick loop ended");
        }
        result = wait_for_signal() => {
            match result {
                Ok(signal) => info!(signal = signal, "Initiating graceful shutdown"),
                Err(e) => error!(error = %e, "signal handler failed, shutting down"),
            }
            readiness.set_not_ready();
        }
    }

    shutdown.trigger();
    watcher_handle.abort();
    health_handle.abort();

    info!("KANARI controller shut down");
    Ok(())
}
