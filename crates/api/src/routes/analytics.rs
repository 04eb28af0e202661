//! Delivery analytics.

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;

use herald_common::error::AppError;
use herald_common::types::DailyAnalytics;
use herald_engine::analytics::MAX_ANALYTICS_DAYS;

use crate::middleware::auth::AuthUser;
use crate::state::AppState;

const DEFAULT_DAYS: u32 = 7;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/analytics", get(get_analytics))
}

#[derive(Debug, Deserialize)]
struct AnalyticsQuery {
    days: Option<u32>,
}

/// GET /api/analytics?days=N: one entry per local day, oldest first.
async fn get_analytics(
    State(state): State<AppState>,
    _auth: AuthUser,
    Query(query): Query<AnalyticsQuery>,
) -> Result<Json<Vec<DailyAnalytics>>, AppError> {
    let days = query.days.unwrap_or(DEFAULT_DAYS);
    if days == 0 || days > MAX_ANALYTICS_DAYS {
        return Err(AppError::Validation(format!(
            "days must be between 1 and {}",
            MAX_ANALYTICS_DAYS
        )));
    }

    let today = Utc::now().with_timezone(&state.local_offset).date_naive();
    Ok(Json(state.analytics.daily(days, today)))
}
