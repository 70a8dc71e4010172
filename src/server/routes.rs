//! HTTP routes for the share server.

use axum::{
    extract::State as AxumState,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

use crate::config::RuntimeMode;
use crate::state::StateStore;

/// Shared application state.
pub struct AppState {
    pub store: StateStore,
    pub mode: RuntimeMode,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

/// Body of `GET /api/status`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub pid: u32,
    pub port: u16,
    pub ts_port: u16,
    pub url: String,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub shares: usize,
    pub projects: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel_hostname: Option<String>,
}

/// Build the router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/status", get(status_handler))
        .with_state(state)
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn status_handler(AxumState(app): AxumState<Arc<AppState>>) -> impl IntoResponse {
    let state = match app.store.read() {
        Ok(state) => state,
        Err(e) => {
            warn!(error = %e, "Status request could not read state");
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };

    Json(StatusResponse {
        pid: app.pid,
        port: state.port,
        ts_port: state.ts_port,
        url: state.public_url(),
        dry_run: app.mode.is_dry_run(),
        started_at: app.started_at,
        shares: state.shares.len(),
        projects: state.projects.len(),
        tunnel_hostname: state.named_tunnel.map(|tunnel| tunnel.hostname),
    })
    .into_response()
}
