//! HTTP ingress.
//!
//! # Endpoints
//!
//! - `POST /webhook/{service}/{chat}` - a webhook delivery for one chat
//! - `HEAD /webhook/{service}/{chat}` - callback probe some providers send
//!   before registering a webhook
//! - `GET /health` - 200 if the server is running
//!
//! Every delivery the engine handled, including duplicates and payloads it
//! could not parse, is acknowledged with 200 so providers do not redeliver.
//! A deferred delivery is 202.

use std::future::Future;
use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::engine::{IngestOutcome, SyncEngine};
use crate::error::{Error, Result};
use crate::model::ChatId;

/// Shared application state, passed to handlers via axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    engine: Arc<SyncEngine>,
}

impl AppState {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self { engine }
    }
}

/// Builds the router with all endpoints.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::routing::{get, post};

    axum::Router::new()
        .route("/webhook/{service}/{chat}", post(webhook_handler).head(probe_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    info!(addr = ?listener.local_addr().ok(), "listening for webhooks");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

pub async fn health_handler() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}

async fn probe_handler(State(state): State<AppState>, Path((service, _chat)): Path<(String, i64)>) -> StatusCode {
    if state.engine.has_adapter(&service) {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn webhook_handler(
    State(state): State<AppState>,
    Path((service, chat)): Path<(String, i64)>,
    body: Bytes,
) -> std::result::Result<Response, ApiError> {
    let outcome = state.engine.ingest(ChatId(chat), &service, &body).await?;
    let status = match &outcome {
        IngestOutcome::Deferred(_) => StatusCode::ACCEPTED,
        IngestOutcome::UnknownService => StatusCode::NOT_FOUND,
        IngestOutcome::Synced(_)
        | IngestOutcome::Ignored
        | IngestOutcome::Rejected(_)
        | IngestOutcome::Dropped(_) => StatusCode::OK,
    };
    Ok((status, Json(json!({ "outcome": outcome.label() }))).into_response())
}

/// Engine failures that could not be acknowledged.
#[derive(Debug)]
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            // Provider retries later; the event was not lost on our side.
            Error::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        error!(error = %self.0, status = status.as_u16(), "webhook failed");
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}
