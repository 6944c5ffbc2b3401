//! HTTP surface — push endpoint and health check.
//!
//! The push transport redelivers anything not acknowledged with a 2xx, so
//! the status code is the retry signal: 204 for every terminal outcome
//! (including undecodable payloads, which would never succeed), 500 when a
//! retry can make progress.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

use crate::pipeline::handler::{HandleOutcome, NotificationHandler};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub handler: Arc<NotificationHandler>,
}

/// Build the Axum router with the push and health routes.
pub fn push_routes(handler: Arc<NotificationHandler>) -> Router {
    let state = AppState { handler };

    Router::new()
        .route("/health", get(health))
        .route("/pubsub/push", post(pubsub_push))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "bill-reconciler"
    }))
}

// ── Push ────────────────────────────────────────────────────────────────

async fn pubsub_push(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    match state.handler.handle_push(&body).await {
        Ok(outcome) => {
            match &outcome {
                HandleOutcome::Processed(report) => debug!(?report, "Push acknowledged"),
                other => debug!(outcome = ?other, "Push acknowledged"),
            }
            StatusCode::NO_CONTENT
        }
        Err(e) => {
            error!("Push handling failed, requesting redelivery: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
