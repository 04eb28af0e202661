//! Websocket upgrade for the live notification channel.

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::response::Response;
use axum::routing::get;
use futures_util::StreamExt;

use crate::middleware::auth::AuthUser;
use crate::session::{SessionContext, serve_connection};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(upgrade))
}

/// GET /ws?token=<jwt>: authenticate, then hand the socket to a session.
async fn upgrade(State(state): State<AppState>, auth: AuthUser, ws: WebSocketUpgrade) -> Response {
    let ctx = SessionContext::from(&state);
    ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        serve_connection(sink, stream, ctx, auth.user_id).await;
    })
}
