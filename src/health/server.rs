//! HTTP endpoint serving `GET /health`.
//!
//! Responds with the JSON [`HealthReport`]: `200` for healthy and degraded,
//! `503` for unhealthy.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{HealthReport, HealthReporter, HealthStatus};
use crate::error::Result;

#[derive(Clone)]
struct HealthState {
    reporter: Arc<HealthReporter>,
    deadline: Duration,
}

/// Build the router
pub fn router(reporter: Arc<HealthReporter>, deadline: Duration) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(HealthState { reporter, deadline })
}

async fn health(State(state): State<HealthState>) -> Response {
    let report: HealthReport = state.reporter.check_health(state.deadline).await;
    let code = match report.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(report)).into_response()
}

/// Serve until `token` is cancelled
///
/// # Errors
///
/// Returns `BridgeError::Io` if the listener fails.
pub async fn serve(
    listener: TcpListener,
    reporter: Arc<HealthReporter>,
    deadline: Duration,
    token: CancellationToken,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Health endpoint listening on http://{}/health", addr);
    }

    axum::serve(listener, router(reporter, deadline))
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;

    info!("Health endpoint stopped");
    Ok(())
}
