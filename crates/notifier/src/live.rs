//! Live channel: delivers to the user's open connections through the registry.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use herald_common::types::{Channel, RenderedMessage};

use crate::adapter::{ChannelAdapter, SendOutcome, reason};
use crate::frame::Frame;
use crate::registry::ConnectionRegistry;

pub struct LiveChannelAdapter {
    registry: Arc<ConnectionRegistry>,
}

impl LiveChannelAdapter {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ChannelAdapter for LiveChannelAdapter {
    fn channel(&self) -> Channel {
        Channel::live()
    }

    async fn send(&self, user_id: Uuid, message: &RenderedMessage) -> SendOutcome {
        let accepted = self
            .registry
            .send_to_user(user_id, &Frame::notification(message));

        tracing::debug!(
            user_id = %user_id,
            message_id = %message.message_id,
            connections = accepted,
            "Live delivery"
        );

        if accepted > 0 {
            SendOutcome::delivered()
        } else {
            SendOutcome::failed(reason::NO_CONNECTION)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use herald_common::types::Priority;

    use crate::frame::FrameType;

    fn message() -> RenderedMessage {
        RenderedMessage {
            message_id: Uuid::new_v4(),
            title: "t".into(),
            body: "b".into(),
            priority: Priority::High,
            category: None,
            data: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn test_delivered_when_any_connection_open() {
        let registry = Arc::new(ConnectionRegistry::new(Duration::from_secs(30), 4));
        let adapter = LiveChannelAdapter::new(registry.clone());
        let user = Uuid::new_v4();

        let outcome = adapter.send(user, &message()).await;
        assert_eq!(outcome.reason.as_deref(), Some("no_connection"));

        let mut conn = registry.register(user);
        registry.open(conn.id);
        let msg = message();
        assert!(adapter.send(user, &msg).await.delivered);

        let frame = conn.outbound.recv().await.unwrap();
        assert_eq!(frame.kind, FrameType::Notification);
        assert_eq!(frame.data["message_id"], msg.message_id.to_string());
    }
}
