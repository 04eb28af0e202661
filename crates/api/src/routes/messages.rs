//! Read and click feedback for delivered messages.

use axum::extract::{Path, State};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::json;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_engine::analytics::Interaction;

use crate::middleware::auth::AuthUser;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/messages/{id}/read", post(mark_read))
        .route("/api/messages/{id}/click", post(mark_clicked))
}

async fn mark_read(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(message_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    record(&state, Interaction::Read, message_id, auth.user_id).await
}

async fn mark_clicked(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(message_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    record(&state, Interaction::Click, message_id, auth.user_id).await
}

async fn record(
    state: &AppState,
    interaction: Interaction,
    message_id: Uuid,
    user_id: Uuid,
) -> Result<Json<serde_json::Value>, AppError> {
    let updated = state
        .analytics
        .record_interaction(state.delivery_log.as_ref(), interaction, message_id, user_id)
        .await?;

    if updated == 0 {
        return Err(AppError::NotFound(format!(
            "No delivered message {} for this user",
            message_id
        )));
    }
    Ok(Json(json!({ "message_id": message_id, "updated": updated })))
}
