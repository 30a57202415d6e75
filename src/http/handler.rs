//! Axum router for the operational endpoints.
//!
//! Routes:
//! - `GET  /metrics` - Prometheus metrics
//! - `GET  /healthz` - Result of the most recent reconciliation pass

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::engine::{PassError, PassResult};
use crate::error::Classify;
use crate::metrics::MetricsRegistry;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub metrics: MetricsRegistry,
    pub status: Arc<PassStatus>,
}

/// Summary of the last finished pass, served by `/healthz`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LastPass {
    pub finished_at: String,
    pub ok: bool,
    pub dry_run: bool,
    pub applied: usize,
    pub skipped: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<&'static str>,
}

#[derive(Debug, Default)]
pub struct PassStatus {
    last: RwLock<Option<LastPass>>,
}

impl PassStatus {
    pub fn record(&self, outcome: &Result<PassResult, PassError>) {
        let result = match outcome {
            Ok(result) => Some(result),
            Err(e) => e.result(),
        };
        let summary = result.map(PassResult::summary).unwrap_or_default();
        let last = LastPass {
            finished_at: chrono::Utc::now().to_rfc3339(),
            ok: outcome.is_ok(),
            dry_run: result.is_some_and(|r| r.dry_run),
            applied: summary.applied,
            skipped: summary.skipped,
            failed: summary.failed,
            error: outcome.as_ref().err().map(|e| e.to_string()),
            error_class: outcome.as_ref().err().map(|e| e.class().as_str()),
        };
        *self.last.write().unwrap_or_else(|e| e.into_inner()) = Some(last);
    }

    pub fn snapshot(&self) -> Option<LastPass> {
        self.last.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

/// Serve the router on `0.0.0.0:port` until `shutdown` fires.
pub async fn run_http_server(state: AppState, port: u16, shutdown: CancellationToken) -> Result<()> {
    let listen_addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {listen_addr}"))?;

    info!(%listen_addr, "metrics server listening");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("metrics server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_pass: Option<LastPass>,
}

/// `GET /healthz`
///
/// Always 200 while the process runs; `status` is `starting` before the
/// first pass, then `ok` or `degraded`.
async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let last_pass = state.status.snapshot();
    let status = match &last_pass {
        None => "starting",
        Some(p) if p.ok => "ok",
        Some(_) => "degraded",
    };
    Json(HealthResponse { status, last_pass })
}

/// `GET /metrics`
async fn handle_metrics(State(state): State<AppState>) -> Response {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "metrics encoding failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}
