//! HTTP transport for the compile pipeline.
//!
//! | Route            | Handler                                         |
//! |------------------|-------------------------------------------------|
//! | `GET /`          | landing message                                 |
//! | `GET /health`    | liveness probe                                  |
//! | `POST /compile`  | validate request, run pipeline, return result   |

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::ServerSection;
use crate::pipeline::{CompileRequest, Pipeline, PipelineResult, Stage};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub pipeline: Pipeline,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CompileBody {
    #[serde(alias = "instruction")]
    pub english_command: String,
    #[serde(alias = "target")]
    pub board: String,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

/// HTTP status for a pipeline outcome.
pub fn status_for(result: &PipelineResult) -> StatusCode {
    match result {
        PipelineResult::Success(_) => StatusCode::OK,
        PipelineResult::Failure(failure) => match failure.stage {
            Stage::Generate => StatusCode::BAD_GATEWAY,
            Stage::Parse | Stage::Build | Stage::Locate => StatusCode::UNPROCESSABLE_ENTITY,
            Stage::Stage | Stage::Encode => StatusCode::INTERNAL_SERVER_ERROR,
        },
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/health", get(health_check))
        .route("/compile", post(compile))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn home() -> Json<serde_json::Value> {
    Json(serde_json::json!({"message": "firmforge API is running"}))
}

async fn health_check() -> &'static str {
    "ok"
}

async fn compile(
    State(state): State<SharedState>,
    payload: Result<Json<CompileBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(body) = payload?;
    let request = CompileRequest::new(body.english_command, body.board);
    request.validate().map_err(ApiError::BadRequest)?;

    let result = state.pipeline.compile(&request).await;
    Ok((status_for(&result), Json(result)).into_response())
}

/// Start the HTTP server and run until Ctrl-C.
pub async fn start_server(pipeline: Pipeline, config: &ServerSection) -> Result<()> {
    let state = Arc::new(AppState { pipeline });
    let mut app = build_router(state);

    if config.cors {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!("firmforge listening on http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("shutting down");
}
