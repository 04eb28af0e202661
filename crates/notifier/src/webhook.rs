//! Generic HTTP webhook adapter for external gateways (mobile push, email).
//!
//! Each send is a JSON `POST` to the configured URL. Provider wire formats are
//! the gateway's concern; this adapter only maps transport results onto
//! [`SendOutcome`] reasons.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::json;
use uuid::Uuid;

use herald_common::types::{Channel, RenderedMessage};

use crate::adapter::{ChannelAdapter, SendOutcome, reason};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct WebhookAdapter {
    channel: Channel,
    url: String,
    client: reqwest::Client,
}

impl WebhookAdapter {
    pub fn new(channel: Channel, url: impl Into<String>) -> Result<Self, reqwest::Error> {
        Self::with_timeout(channel, url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        channel: Channel,
        url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            channel,
            url: url.into(),
            client,
        })
    }
}

/// Map a gateway response status to an outcome.
///
/// 404/410 mean the device token is gone, 403 that the user opted out at the
/// gateway, other 4xx that the target itself is invalid.
pub fn outcome_for_status(status: StatusCode) -> SendOutcome {
    match status.as_u16() {
        200..=299 => SendOutcome::delivered(),
        404 | 410 => SendOutcome::failed(reason::UNREGISTERED),
        403 => SendOutcome::failed(reason::UNSUBSCRIBED),
        429 => SendOutcome::http_status(429),
        400..=499 => SendOutcome::failed(reason::INVALID_TARGET),
        code => SendOutcome::http_status(code),
    }
}

fn outcome_for_error(err: &reqwest::Error) -> SendOutcome {
    if err.is_timeout() {
        SendOutcome::failed(reason::TIMEOUT)
    } else if err.is_connect() || err.is_request() {
        SendOutcome::failed(reason::NETWORK)
    } else {
        SendOutcome::failed(reason::UNAVAILABLE)
    }
}

#[async_trait]
impl ChannelAdapter for WebhookAdapter {
    fn channel(&self) -> Channel {
        self.channel.clone()
    }

    async fn send(&self, user_id: Uuid, message: &RenderedMessage) -> SendOutcome {
        let body = json!({
            "channel": self.channel,
            "user_id": user_id,
            "message": message,
        });

        let outcome = match self.client.post(&self.url).json(&body).send().await {
            Ok(response) => outcome_for_status(response.status()),
            Err(e) => {
                tracing::debug!(channel = %self.channel, error = %e, "Webhook request failed");
                outcome_for_error(&e)
            }
        };

        if let Some(failure) = &outcome.reason {
            tracing::debug!(
                channel = %self.channel,
                user_id = %user_id,
                message_id = %message.message_id,
                reason = %failure,
                "Webhook delivery failed"
            );
        }

        outcome
    }
}
