use std::path::PathBuf;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use motion_watch_common::status::StatusReport;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::pipeline::{ControlError, PipelineHandle};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct StatusBody {
    #[serde(flatten)]
    report: StatusReport,
    /// Same one-liner the logs show, e.g. `Idle (camera lost: end of stream)`.
    text: String,
}

impl From<StatusReport> for StatusBody {
    fn from(report: StatusReport) -> Self {
        let text = report.text();
        Self { report, text }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct SaveDirRequest {
    path: PathBuf,
}

fn error_response(status: StatusCode, e: ControlError) -> Response {
    (status, Json(ErrorBody { error: e.to_string() })).into_response()
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /status
async fn status(State(handle): State<PipelineHandle>) -> Json<StatusBody> {
    Json(handle.status().into())
}

/// POST /start: open the camera and begin watching
async fn start(State(handle): State<PipelineHandle>) -> Response {
    match handle.start().await {
        Ok(report) => Json(StatusBody::from(report)).into_response(),
        Err(e) => {
            warn!(error = %e, "start request failed");
            error_response(StatusCode::SERVICE_UNAVAILABLE, e)
        }
    }
}

/// POST /stop: finalize any segment and release the camera
async fn stop(State(handle): State<PipelineHandle>) -> Response {
    match handle.stop().await {
        Ok(report) => Json(StatusBody::from(report)).into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e),
    }
}

/// PUT /save-dir
/// Body: { "path": "/mnt/clips" }
async fn set_save_dir(
    State(handle): State<PipelineHandle>,
    Json(body): Json<SaveDirRequest>,
) -> Response {
    match handle.set_save_dir(body.path).await {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e @ ControlError::Rejected(_)) => {
            warn!(error = %e, "save directory rejected");
            error_response(StatusCode::BAD_REQUEST, e)
        }
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e),
    }
}

pub fn router(handle: PipelineHandle) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/start", post(start))
        .route("/stop", post(stop))
        .route("/save-dir", put(set_save_dir))
        .layer(TraceLayer::new_for_http())
        .with_state(handle)
}

/// Serve the control API on `listen` until the process exits.
pub async fn serve(listen: &str, handle: PipelineHandle) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!(addr = %listener.local_addr()?, "control API listening");
    axum::serve(listener, router(handle)).await
}
