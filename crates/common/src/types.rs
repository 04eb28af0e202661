use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kinds of domain events accepted by the dispatch pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    News,
    Price,
    TechnicalSignal,
    Time,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::News => write!(f, "news"),
            EventKind::Price => write!(f, "price"),
            EventKind::TechnicalSignal => write!(f, "technical_signal"),
            EventKind::Time => write!(f, "time"),
        }
    }
}

/// An immutable domain event produced by news ingestion, price feeds,
/// technical analysis or the scheduler clock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub kind: EventKind,
    /// Kind-specific fields (relevance, instrument_code, change_pct, indicator, ...)
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default = "Utc::now")]
    pub occurred_at: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            payload,
            occurred_at: Utc::now(),
        }
    }

    pub fn at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }
}

/// Notification priority. `Urgent` overrides subscriber quiet hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
            Priority::Urgent => write!(f, "urgent"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

/// Delivery medium identifier, e.g. `live`, `apns`, `fcm`, `email`.
///
/// Channels are opaque to the dispatcher: each one maps to exactly one adapter.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Channel(String);

impl Channel {
    /// Identifier of the in-process live connection channel.
    pub const LIVE: &'static str = "live";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn live() -> Self {
        Self(Self::LIVE.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Channel {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A message template with `{{placeholder}}` variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub title_pattern: String,
    pub body_pattern: String,
    /// Declared placeholder names (informational; rendering never requires them).
    #[serde(default)]
    pub variables: Vec<String>,
}

/// Optional narrowing of who may receive a candidate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetScope {
    /// Explicit recipients (system-triggered direct messages).
    #[serde(default)]
    pub user_ids: Vec<Uuid>,
    #[serde(default)]
    pub instrument_codes: Vec<String>,
    #[serde(default)]
    pub sectors: Vec<String>,
    /// Only users with an open live connection at routing time.
    #[serde(default)]
    pub online_only: bool,
}

impl TargetScope {
    pub fn is_empty(&self) -> bool {
        self.user_ids.is_empty()
            && self.instrument_codes.is_empty()
            && self.sectors.is_empty()
            && !self.online_only
    }
}

/// Values extracted from an event for template substitution and routing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundVariables {
    pub values: serde_json::Map<String, serde_json::Value>,
    pub instrument_codes: Vec<String>,
}

impl BoundVariables {
    /// Render a bound value as text. Missing names and nulls render as "".
    pub fn render(&self, name: &str) -> String {
        match self.values.get(name) {
            None | Some(serde_json::Value::Null) => String::new(),
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(", "),
            Some(other) => other.to_string(),
        }
    }
}

/// An unrouted, rule-matched message awaiting recipient resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateNotification {
    /// Message id shared by every delivery of this candidate.
    pub id: Uuid,
    pub rule_id: String,
    pub template_id: String,
    pub priority: Priority,
    pub categories: Vec<String>,
    pub bound_variables: BoundVariables,
    pub target_scope: Option<TargetScope>,
    /// Held back from routing until this instant.
    #[serde(default)]
    pub schedule_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl CandidateNotification {
    /// Instrument codes used for routing: the scope's codes when it names any,
    /// otherwise the codes bound from the event.
    pub fn routing_instruments(&self) -> &[String] {
        match &self.target_scope {
            Some(scope) if !scope.instrument_codes.is_empty() => &scope.instrument_codes,
            _ => &self.bound_variables.instrument_codes,
        }
    }

    pub fn primary_category(&self) -> Option<&str> {
        self.categories.first().map(String::as_str)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.schedule_at.is_none_or(|at| at <= now)
    }

    pub fn online_only(&self) -> bool {
        self.target_scope.as_ref().is_some_and(|s| s.online_only)
    }
}

/// Per-channel enablement inside a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelPreference {
    pub channel: Channel,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Local time-of-day window during which only urgent notifications are delivered.
///
/// The window is half-open `[start, end)` and wraps midnight when `start > end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl QuietHours {
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            time >= self.start && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }
}

/// A user's notification subscription. Never deleted, only soft-disabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub device_channels: Vec<ChannelPreference>,
    pub category_filters: Vec<String>,
    pub instrument_filters: Vec<String>,
    pub sector_filters: Vec<String>,
    pub frequency_cap: u32,
    pub quiet_hours: Option<QuietHours>,
    pub delivered_today_count: u32,
    /// Local date `delivered_today_count` refers to.
    pub count_date: Option<NaiveDate>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Deliveries counted against the cap on `date`; a counter from an
    /// earlier day has been reset.
    pub fn delivered_on(&self, date: NaiveDate) -> u32 {
        if self.count_date == Some(date) {
            self.delivered_today_count
        } else {
            0
        }
    }

    pub fn enabled_channels(&self) -> impl Iterator<Item = &Channel> {
        self.device_channels
            .iter()
            .filter(|pref| pref.enabled)
            .map(|pref| &pref.channel)
    }
}

/// A resolved (user, channel) pair eligible to receive a candidate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryTarget {
    pub user_id: Uuid,
    pub channel: Channel,
}

/// A template rendered for one candidate, ready to hand to a channel adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedMessage {
    pub message_id: Uuid,
    pub title: String,
    pub body: String,
    pub priority: Priority,
    pub category: Option<String>,
    /// Bound event values, forwarded so clients can deep-link.
    pub data: serde_json::Value,
}

/// Append-only outcome of one delivery to one user on one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub message_id: Uuid,
    pub user_id: Uuid,
    pub channel: Channel,
    pub category: Option<String>,
    pub priority: Priority,
    /// 1 for the first send, incremented by each retry.
    pub attempt: u32,
    pub sent_at: DateTime<Utc>,
    pub delivered: bool,
    pub read: bool,
    pub clicked: bool,
    pub failure_reason: Option<String>,
}

impl DeliveryRecord {
    pub fn key(&self) -> DeliveryKey {
        DeliveryKey {
            message_id: self.message_id,
            user_id: self.user_id,
            channel: self.channel.clone(),
            attempt: self.attempt,
        }
    }
}

/// Idempotency key for analytics aggregation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeliveryKey {
    pub message_id: Uuid,
    pub user_id: Uuid,
    pub channel: Channel,
    pub attempt: u32,
}

/// Per-channel counters inside a daily aggregate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub sent: u64,
    pub delivered: u64,
    pub failed: u64,
}

/// Delivery metrics for one calendar day. Derived from delivery records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyAnalytics {
    pub date: NaiveDate,
    pub total_sent: u64,
    pub total_delivered: u64,
    pub total_read: u64,
    pub total_clicked: u64,
    pub category_counts: BTreeMap<String, u64>,
    /// delivered / sent
    pub success_rate: f64,
    /// read / delivered
    pub read_rate: f64,
    /// clicked / delivered
    pub click_rate: f64,
    pub channel_breakdown: BTreeMap<String, ChannelStats>,
}

impl DailyAnalytics {
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            total_sent: 0,
            total_delivered: 0,
            total_read: 0,
            total_clicked: 0,
            category_counts: BTreeMap::new(),
            success_rate: 0.0,
            read_rate: 0.0,
            click_rate: 0.0,
            channel_breakdown: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_quiet_hours_same_day_window() {
        let quiet = QuietHours {
            start: time(12, 0),
            end: time(14, 0),
        };
        assert!(quiet.contains(time(12, 0)));
        assert!(quiet.contains(time(13, 59)));
        assert!(!quiet.contains(time(14, 0)));
        assert!(!quiet.contains(time(11, 59)));
    }

    #[test]
    fn test_quiet_hours_wraps_midnight() {
        let quiet = QuietHours {
            start: time(22, 0),
            end: time(7, 0),
        };
        assert!(quiet.contains(time(23, 30)));
        assert!(quiet.contains(time(3, 0)));
        assert!(!quiet.contains(time(7, 0)));
        assert!(!quiet.contains(time(12, 0)));
    }

    #[test]
    fn test_bound_variables_render() {
        let mut values = serde_json::Map::new();
        values.insert("title".into(), serde_json::json!("Rate cut"));
        values.insert("relevance".into(), serde_json::json!(0.9));
        values.insert("tags".into(), serde_json::json!(["a", "b"]));
        values.insert("nothing".into(), serde_json::Value::Null);
        let vars = BoundVariables {
            values,
            instrument_codes: vec![],
        };
        assert_eq!(vars.render("title"), "Rate cut");
        assert_eq!(vars.render("relevance"), "0.9");
        assert_eq!(vars.render("tags"), "a, b");
        assert_eq!(vars.render("nothing"), "");
        assert_eq!(vars.render("missing"), "");
    }

    #[test]
    fn test_delivered_on_resets_for_new_day() {
        let today = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        let yesterday = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        let now = Utc::now();
        let mut sub = Subscription {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            device_channels: vec![],
            category_filters: vec![],
            instrument_filters: vec![],
            sector_filters: vec![],
            frequency_cap: 5,
            quiet_hours: None,
            delivered_today_count: 4,
            count_date: Some(today),
            active: true,
            created_at: now,
            updated_at: now,
        };
        assert_eq!(sub.delivered_on(today), 4);
        sub.count_date = Some(yesterday);
        assert_eq!(sub.delivered_on(today), 0);
    }

    #[test]
    fn test_priority_roundtrip_str() {
        assert_eq!("urgent".parse::<Priority>().unwrap(), Priority::Urgent);
        assert_eq!(Priority::High.to_string(), "high");
        assert!("critical".parse::<Priority>().is_err());
        assert!(Priority::Urgent > Priority::High);
    }
}
