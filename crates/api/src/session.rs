//! One live connection: handshake, outbound frames, heartbeats and client feedback.
//!
//! The session registers with the [`ConnectionRegistry`], writes the `system`
//! acknowledgement and only then marks the connection open, so no
//! notification can precede the ack. From there two halves run concurrently
//! until either one ends:
//! - the writer drains the outbound queue and sends a `ping` every heartbeat interval
//! - the reader refreshes liveness on any client traffic and handles `read`/`click`
//!
//! A close signal from the registry (heartbeat sweep or shutdown) stops both
//! halves at once.

use std::pin::pin;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, close_code};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, interval_at};
use uuid::Uuid;

use herald_engine::analytics::{AnalyticsAggregator, Interaction};
use herald_engine::store::DeliveryLog;
use herald_notifier::frame::{Frame, FrameType};
use herald_notifier::registry::{
    CloseReason, ConnectionId, ConnectionRegistry, ConnectionState, Registration,
};

use crate::state::AppState;

/// Replies the reader asks the writer to send.
const CONTROL_CAPACITY: usize = 8;

#[derive(Clone)]
pub struct SessionContext {
    pub registry: Arc<ConnectionRegistry>,
    pub analytics: Arc<AnalyticsAggregator>,
    pub delivery_log: Arc<dyn DeliveryLog>,
}

impl From<&AppState> for SessionContext {
    fn from(state: &AppState) -> Self {
        Self {
            registry: state.registry.clone(),
            analytics: state.analytics.clone(),
            delivery_log: state.delivery_log.clone(),
        }
    }
}

fn text(frame: &Frame) -> Message {
    Message::Text(frame.to_text().into())
}

/// Drive one connection for `user_id` until it closes.
pub async fn serve_connection<W, R>(sink: W, stream: R, ctx: SessionContext, user_id: Uuid)
where
    W: Sink<Message, Error = axum::Error>,
    R: Stream<Item = Result<Message, axum::Error>>,
{
    let mut sink = pin!(sink);
    let mut stream = pin!(stream);
    let registry = ctx.registry.clone();

    let Registration {
        id,
        mut outbound,
        mut closed,
        ..
    } = registry.register(user_id);

    if sink.send(text(&Frame::ack(id, user_id))).await.is_err() {
        registry.close(id, CloseReason::ClientClosed);
        return;
    }
    registry.open(id);
    tracing::info!(connection_id = %id, user_id = %user_id, "Live connection opened");

    let (control_tx, mut control_rx) = mpsc::channel::<Frame>(CONTROL_CAPACITY);
    let heartbeat = registry.heartbeat_interval();

    let reason = {
        let writer = async {
            let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);
            loop {
                let frame = tokio::select! {
                    _ = closed.changed() => return closed_reason(&registry, id),
                    queued = outbound.recv() => match queued {
                        Some(frame) => frame,
                        None => return closed_reason(&registry, id),
                    },
                    Some(reply) = control_rx.recv() => reply,
                    _ = ticker.tick() => Frame::ping(),
                };
                if sink.send(text(&frame)).await.is_err() {
                    return CloseReason::ClientClosed;
                }
            }
        };
        let reader = read_loop(&mut stream, &ctx, id, user_id, control_tx);

        tokio::select! {
            reason = writer => reason,
            reason = reader => reason,
        }
    };

    registry.close(id, reason);
    finish(&mut sink, reason).await;
    tracing::info!(
        connection_id = %id,
        user_id = %user_id,
        reason = ?reason,
        "Live connection closed"
    );
}

fn closed_reason(registry: &ConnectionRegistry, id: ConnectionId) -> CloseReason {
    match registry.state(id) {
        ConnectionState::Closing => CloseReason::Shutdown,
        _ => CloseReason::HeartbeatTimeout,
    }
}

async fn finish<W>(sink: &mut std::pin::Pin<&mut W>, reason: CloseReason)
where
    W: Sink<Message, Error = axum::Error>,
{
    let (code, why) = match reason {
        CloseReason::ClientClosed => return,
        CloseReason::ProtocolError => (close_code::PROTOCOL, "malformed frame"),
        CloseReason::HeartbeatTimeout => (close_code::POLICY, "heartbeat timeout"),
        CloseReason::Shutdown => (close_code::AWAY, "server shutting down"),
    };
    let close = Message::Close(Some(CloseFrame {
        code,
        reason: Utf8Bytes::from_static(why),
    }));
    // the peer may already be gone
    let _ = sink.send(close).await;
    let _ = sink.close().await;
}

async fn read_loop<R>(
    stream: &mut std::pin::Pin<&mut R>,
    ctx: &SessionContext,
    id: ConnectionId,
    user_id: Uuid,
    control: mpsc::Sender<Frame>,
) -> CloseReason
where
    R: Stream<Item = Result<Message, axum::Error>>,
{
    while let Some(incoming) = stream.next().await {
        let raw = match incoming {
            Ok(Message::Text(raw)) => raw,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                ctx.registry.touch(id);
                continue;
            }
            Ok(Message::Binary(_)) => {
                tracing::warn!(connection_id = %id, "Binary frame rejected");
                return CloseReason::ProtocolError;
            }
            Ok(Message::Close(_)) => return CloseReason::ClientClosed,
            Err(e) => {
                tracing::debug!(connection_id = %id, error = %e, "Socket read failed");
                return CloseReason::ClientClosed;
            }
        };

        ctx.registry.touch(id);
        let frame = match Frame::parse(raw.as_str()) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(connection_id = %id, error = %e, "Malformed client frame");
                return CloseReason::ProtocolError;
            }
        };

        match frame.kind {
            FrameType::Ping => {
                let _ = control.try_send(Frame::pong());
            }
            FrameType::Pong => {}
            FrameType::Error => {
                tracing::warn!(
                    connection_id = %id,
                    user_id = %user_id,
                    error = frame.error_text().unwrap_or("unspecified"),
                    "Client reported error"
                );
            }
            FrameType::Read | FrameType::Click => {
                let message_id = match frame.message_id() {
                    Ok(message_id) => message_id,
                    Err(e) => {
                        tracing::warn!(connection_id = %id, error = %e, "Malformed client frame");
                        return CloseReason::ProtocolError;
                    }
                };
                let interaction = if frame.kind == FrameType::Read {
                    Interaction::Read
                } else {
                    Interaction::Click
                };
                if let Err(e) = ctx
                    .analytics
                    .record_interaction(ctx.delivery_log.as_ref(), interaction, message_id, user_id)
                    .await
                {
                    tracing::warn!(
                        message_id = %message_id,
                        user_id = %user_id,
                        error = %e,
                        "Failed to record interaction"
                    );
                    let _ = control.try_send(Frame::error("interaction not recorded"));
                }
            }
            FrameType::System | FrameType::Notification => {
                tracing::debug!(connection_id = %id, kind = ?frame.kind, "Ignoring server-only frame");
            }
        }
    }

    CloseReason::ClientClosed
}
