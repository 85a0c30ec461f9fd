//! HTTP status API.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use std::time::SystemTime;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::aggregator::Aggregator;
use crate::api::StatusReport;
use crate::error::MonitorError;

/// Path of the status endpoint.
pub const STATUS_PATH: &str = "/api/status";

/// Router exposing the aggregator's status view.
pub fn router(hub: Aggregator) -> Router {
    Router::new()
        .route(STATUS_PATH, get(status))
        .fallback(|| async { (StatusCode::NOT_FOUND, "Not found") })
        .with_state(hub)
}

async fn status(State(hub): State<Aggregator>) -> Result<Json<StatusReport>, MonitorError> {
    let records = hub.snapshot().await?;
    debug!(records = records.len(), "serving status");
    Ok(Json(StatusReport::from_snapshot(records, SystemTime::now())))
}

impl IntoResponse for MonitorError {
    fn into_response(self) -> Response {
        let code = match self {
            MonitorError::HubClosed => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (code, self.to_string()).into_response()
    }
}

/// Serve the status API on `listener` until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    hub: Aggregator,
    shutdown: CancellationToken,
) -> Result<(), MonitorError> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "status API listening");
    }

    axum::serve(listener, router(hub))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| MonitorError::Http(e.to_string()))
}
