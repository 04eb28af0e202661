//! Event intake over HTTP.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::json;

use herald_common::error::AppError;
use herald_common::types::Event;

use crate::middleware::auth::Publisher;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/events", post(submit_event))
}

/// POST /api/events: queue a domain event for rule evaluation.
///
/// Publisher tokens only. Waits while the pipeline is saturated rather than
/// dropping the event.
async fn submit_event(
    State(state): State<AppState>,
    Publisher(auth): Publisher,
    Json(event): Json<Event>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let event_id = event.id;
    tracing::debug!(
        event_id = %event_id,
        kind = %event.kind,
        publisher = %auth.user_id,
        "Event submitted"
    );

    state
        .pipeline
        .submit(event)
        .await
        .map_err(|e| AppError::Unavailable(e.to_string()))?;

    Ok((StatusCode::ACCEPTED, Json(json!({ "event_id": event_id }))))
}
