//! Subscription routes. Each user manages exactly one subscription.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};

use herald_common::error::AppError;
use herald_common::types::Subscription;
use herald_engine::subscription::{CreateSubscriptionParams, UpdateSubscriptionParams};

use crate::middleware::auth::AuthUser;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route(
        "/api/subscriptions",
        post(create_subscription)
            .get(get_subscription)
            .patch(update_subscription)
            .delete(disable_subscription),
    )
}

/// POST /api/subscriptions: create (or reactivate) the caller's subscription.
async fn create_subscription(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(params): Json<CreateSubscriptionParams>,
) -> Result<Json<Subscription>, AppError> {
    let subscription = state.subscriptions.create(auth.user_id, params).await?;
    Ok(Json(subscription))
}

/// GET /api/subscriptions
async fn get_subscription(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<Subscription>, AppError> {
    Ok(Json(state.subscriptions.get(auth.user_id).await?))
}

/// PATCH /api/subscriptions: change filters, channels, cap or quiet hours.
async fn update_subscription(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(params): Json<UpdateSubscriptionParams>,
) -> Result<Json<Subscription>, AppError> {
    let subscription = state.subscriptions.update(auth.user_id, params).await?;
    Ok(Json(subscription))
}

/// DELETE /api/subscriptions: soft-disable; the row is kept.
async fn disable_subscription(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<Subscription>, AppError> {
    Ok(Json(state.subscriptions.disable(auth.user_id).await?))
}
