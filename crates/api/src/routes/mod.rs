pub mod admin;
pub mod analytics;
pub mod events;
pub mod health;
pub mod live;
pub mod messages;
pub mod subscriptions;

use axum::Router;

use crate::state::AppState;

/// Build the complete API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(live::router())
        .merge(events::router())
        .merge(subscriptions::router())
        .merge(analytics::router())
        .merge(messages::router())
        .merge(admin::router())
        .with_state(state)
}
