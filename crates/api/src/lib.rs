//! Herald API: REST management routes and live websocket sessions.
//!
//! Endpoints:
//! - `GET  /health`: service status and connection counts
//! - `GET  /ws?token=<jwt>`: live notification channel
//! - `POST /api/events`: submit a domain event
//! - `POST|GET|PATCH|DELETE /api/subscriptions`: the caller's subscription
//! - `GET  /api/analytics?days=N`: daily delivery metrics
//! - `POST /api/messages/{id}/read|click`: recipient feedback
//! - `POST /api/admin/rules/reload`, `PUT /api/admin/templates/{id}`

pub mod middleware {
    pub mod auth;
}
pub mod routes;
pub mod session;
pub mod state;
