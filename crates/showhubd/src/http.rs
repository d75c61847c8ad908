//! Read-only HTTP side channel (spec §6, SPEC_FULL §4.13). Exposes driver
//! health and hub readiness for load balancers and operator dashboards; it
//! never accepts a mutating command — every write still goes over the
//! message socket. `/systems-check` is the one exception: it triggers the
//! same routine `/system/check` does on the socket and hands the result
//! back inline, so an operator UI doesn't also need to be a socket client.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::hub::Hub;

#[derive(Clone)]
struct AppState {
    hub: Arc<Hub>,
    start_time: Instant,
}

#[derive(Serialize)]
struct DriverSummary {
    name: String,
    prefix: String,
    connected: bool,
}

#[derive(Serialize)]
struct StatusResponse {
    uptime_secs: u64,
    message_count: u64,
    ready: bool,
    drivers: Vec<DriverSummary>,
}

#[derive(Serialize)]
struct DriverHealth {
    name: String,
    state: String,
    attempts: u32,
    last_seen_ms: Option<u64>,
}

#[derive(Serialize)]
struct HealthResponse {
    drivers: Vec<DriverHealth>,
}

/// Bind and run the side channel until `shutdown_signal` resolves. Returns
/// once the listener has drained in-flight requests.
pub async fn run(hub: Arc<Hub>, port: u16) -> anyhow::Result<()> {
    let state = AppState { hub, start_time: Instant::now() };

    let app = Router::new()
        .route("/status", get(status))
        .route("/health", get(health))
        .route("/systems-check", post(systems_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "http side channel listening");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
    Ok(())
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let drivers = state
        .hub
        .driver_statuses()
        .await
        .into_iter()
        .map(|d| DriverSummary { name: d.name, prefix: d.prefix, connected: d.connected })
        .collect();

    Json(StatusResponse {
        uptime_secs: state.start_time.elapsed().as_secs(),
        message_count: state.hub.message_count(),
        ready: state.hub.is_ready().await,
        drivers,
    })
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let drivers = state
        .hub
        .driver_statuses()
        .await
        .into_iter()
        .map(|d| DriverHealth {
            name: d.name,
            state: format!("{:?}", d.state),
            attempts: d.attempts,
            last_seen_ms: d.last_seen_ms,
        })
        .collect();
    Json(HealthResponse { drivers })
}

async fn systems_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.hub.systems_check_json().await)
}

async fn shutdown_signal() {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("http side channel received SIGINT, shutting down");
        }
        _ = async {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
                sigterm.recv().await;
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("http side channel received SIGTERM, shutting down");
        }
    }
}
