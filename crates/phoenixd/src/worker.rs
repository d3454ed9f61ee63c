//! Worker role - the network-facing service
//!
//! A minimal HTTP app. The supervisor only cares that it runs until it is
//! killed; SIGTERM/SIGINT shut it down gracefully.

use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub struct WorkerState {
    pub start_time: Instant,
}

type WorkerStateArc = Arc<WorkerState>;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub pid: u32,
    pub uptime_seconds: u64,
}

pub fn router() -> Router {
    let state = Arc::new(WorkerState {
        start_time: Instant::now(),
    });

    Router::new()
        .route("/", get(index))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn index() -> &'static str {
    "Hello World"
}

async fn health_check(State(state): State<WorkerStateArc>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        pid: std::process::id(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

/// Serve until SIGTERM or SIGINT
pub async fn serve(bind_address: &str, port: u16) -> Result<()> {
    let addr = format!("{}:{}", bind_address, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("  Listening on http://{}", addr);

    axum::serve(listener, router())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Worker shut down gracefully");
    Ok(())
}

/// Entry point of the `worker` role
pub fn start(bind_address: &str, port: u16) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(serve(bind_address, port))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to register SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("SIGINT received, shutting down"),
        _ = terminate => info!("SIGTERM received, shutting down"),
    }
}
