//! Channel adapter seam and failure classification.
//!
//! Every delivery medium (live connections, push gateways, email) implements
//! [`ChannelAdapter`]. The dispatcher only sees [`SendOutcome`]s and decides
//! retries from the failure reason, never from which adapter produced it.

use async_trait::async_trait;
use uuid::Uuid;

use herald_common::types::{Channel, RenderedMessage};

/// Failure reasons shared across adapters.
pub mod reason {
    pub const NETWORK: &str = "network";
    pub const TIMEOUT: &str = "timeout";
    pub const UNAVAILABLE: &str = "unavailable";
    pub const INVALID_TARGET: &str = "invalid_target";
    pub const UNREGISTERED: &str = "unregistered";
    pub const UNSUBSCRIBED: &str = "unsubscribed";
    /// Per-channel send queue was full.
    pub const RATE_LIMITED: &str = "rate_limited";
    /// The user has no open live connection.
    pub const NO_CONNECTION: &str = "no_connection";
    pub const TEMPLATE_NOT_FOUND: &str = "template_not_found";
    pub const UNSUPPORTED_CHANNEL: &str = "unsupported_channel";
}

/// Result of one send attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    pub delivered: bool,
    pub reason: Option<String>,
}

impl SendOutcome {
    pub fn delivered() -> Self {
        Self {
            delivered: true,
            reason: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            delivered: false,
            reason: Some(reason.into()),
        }
    }

    /// Failure reason for an HTTP status, e.g. `http_503`.
    pub fn http_status(status: u16) -> Self {
        Self::failed(format!("http_{}", status))
    }
}

/// How the dispatcher treats a failed send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Worth retrying after a short delay.
    Transient,
    /// Retrying cannot help; counts towards disabling the channel.
    Permanent,
}

impl FailureClass {
    /// Classify a failure reason.
    ///
    /// `http_429` and `http_5xx` are transient, other HTTP statuses permanent.
    /// Reasons outside the permanent set default to transient.
    pub fn classify(failure: &str) -> Self {
        if let Some(code) = failure.strip_prefix("http_") {
            return match code.parse::<u16>() {
                Ok(429) | Ok(500..=599) => FailureClass::Transient,
                _ => FailureClass::Permanent,
            };
        }

        match failure {
            reason::INVALID_TARGET | reason::UNREGISTERED | reason::UNSUBSCRIBED => {
                FailureClass::Permanent
            }
            _ => FailureClass::Transient,
        }
    }
}

/// A delivery medium.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Channel id this adapter serves.
    fn channel(&self) -> Channel;

    /// Deliver one rendered message to one user. Never panics on transport errors.
    async fn send(&self, user_id: Uuid, message: &RenderedMessage) -> SendOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_transient() {
        for r in ["network", "timeout", "unavailable", "no_connection", "http_429", "http_500", "http_503"] {
            assert_eq!(FailureClass::classify(r), FailureClass::Transient, "{r}");
        }
    }

    #[test]
    fn test_classify_permanent() {
        for r in ["invalid_target", "unregistered", "unsubscribed", "http_400", "http_404", "http_abc"] {
            assert_eq!(FailureClass::classify(r), FailureClass::Permanent, "{r}");
        }
    }

    #[test]
    fn test_outcome_constructors() {
        assert!(SendOutcome::delivered().delivered);
        let failed = SendOutcome::http_status(502);
        assert!(!failed.delivered);
        assert_eq!(failed.reason.as_deref(), Some("http_502"));
    }
}
