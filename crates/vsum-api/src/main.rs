//! Axum API server binary hosting the queue coordinator.

use std::net::SocketAddr;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vsum_api::{create_router, metrics, ApiConfig, AppState};
use vsum_queue::{connect_store, QueueConfig};
use vsum_stages::{HttpAccessGate, StageClientConfig, StageSet};
use vsum_worker::{Coordinator, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    init_tracing();

    // rustls 0.23+ needs a process-wide crypto provider
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("rustls crypto provider was already installed");
    }

    info!("Starting vsum-server");

    let api_config = ApiConfig::from_env();
    let queue_config = QueueConfig::from_env();
    let worker_config = WorkerConfig::from_env();
    let stage_config = StageClientConfig::from_env();
    info!(
        host = %api_config.host,
        port = api_config.port,
        backend = %queue_config.backend,
        workers = worker_config.max_concurrent_jobs,
        "Loaded configuration"
    );

    let store = connect_store(&queue_config).await;
    let stages = StageSet::http(&stage_config).context("failed to build stage clients")?;
    let gate = HttpAccessGate::from_config(&stage_config).context("failed to build access gate")?;

    let coordinator = Coordinator::builder(queue_config, worker_config, store, stages)
        .access_gate(gate)
        .supported_formats(stage_config.supported_formats.clone())
        .build();

    match coordinator.rehydrate().await {
        Ok(report) => info!(
            restored = report.restored,
            requeued = report.requeued,
            interrupted = report.interrupted,
            rate_windows = report.rate_windows,
            "Rehydrated queue from store"
        ),
        Err(e) => warn!(error = %e, "Rehydration failed, starting with an empty queue"),
    }
    coordinator.start();

    let metrics_handle = if api_config.metrics_enabled {
        match metrics::init_metrics() {
            Ok(handle) => {
                info!("Prometheus metrics enabled at /metrics");
                Some(handle)
            }
            Err(e) => {
                warn!(error = %e, "Failed to install metrics recorder");
                None
            }
        }
    } else {
        None
    };

    let app = create_router(AppState::new(api_config.clone(), coordinator.clone()), metrics_handle);

    let addr: SocketAddr = api_config
        .bind_address()
        .parse()
        .with_context(|| format!("invalid bind address {}", api_config.bind_address()))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    let abandoned = coordinator.shutdown().await;
    info!(unflushed_writes = abandoned, "Server shutdown complete");
    Ok(())
}

fn init_tracing() {
    // Colored output for dev, JSON for production
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::from_default_env()
        .add_directive("vsum=info".parse().expect("static directive"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(true).with_target(true).with_thread_ids(false))
            .with(env_filter)
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
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
    info!("Received shutdown signal, draining");
}
