//! Subscription matcher: resolves which subscribers receive a candidate.
//!
//! For each candidate:
//! 1. Restrict to explicitly addressed users when the target scope names any
//! 2. Apply category, instrument and sector filters
//! 3. Enforce the daily frequency cap and quiet hours (subscriber-local time)
//! 4. Emit one delivery target per enabled channel of each surviving subscription
//!
//! The cap check here runs against a snapshot and only prunes early. The
//! pipeline claims the actual slot with an atomic store reservation using
//! [`SubscriptionMatcher::daily_limit`].

use chrono::{DateTime, FixedOffset, Offset, Utc};

use herald_common::types::{CandidateNotification, DeliveryTarget, Priority, Subscription};

/// Policy knobs for the matcher.
#[derive(Debug, Clone, Copy)]
pub struct MatchPolicy {
    /// Urgent candidates also ignore the daily frequency cap.
    pub urgent_bypasses_frequency_cap: bool,
    /// Subscriber-local timezone for quiet hours and daily counters.
    pub local_offset: FixedOffset,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            urgent_bypasses_frequency_cap: false,
            local_offset: Utc.fix(),
        }
    }
}

/// Why a subscription was not selected. Only used for trace logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejection {
    Inactive,
    NotAddressed,
    Category,
    Instrument,
    Sector,
    FrequencyCap,
    QuietHours,
}

/// Stateless matcher over a subscription snapshot.
pub struct SubscriptionMatcher {
    policy: MatchPolicy,
}

impl SubscriptionMatcher {
    pub fn new(policy: MatchPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> MatchPolicy {
        self.policy
    }

    /// Deliveries per local day `sub` may receive for `candidate`.
    pub fn daily_limit(&self, candidate: &CandidateNotification, sub: &Subscription) -> u32 {
        let bypass =
            candidate.priority == Priority::Urgent && self.policy.urgent_bypasses_frequency_cap;
        if bypass { u32::MAX } else { sub.frequency_cap }
    }

    /// Resolve delivery targets for `candidate` among `subscriptions` at `now`.
    pub fn resolve(
        &self,
        candidate: &CandidateNotification,
        subscriptions: &[Subscription],
        now: DateTime<Utc>,
    ) -> Vec<DeliveryTarget> {
        let mut targets = Vec::new();

        for sub in subscriptions {
            if let Err(reason) = self.check(candidate, sub, now) {
                tracing::trace!(
                    candidate_id = %candidate.id,
                    user_id = %sub.user_id,
                    reason = ?reason,
                    "Subscription not selected"
                );
                continue;
            }

            targets.extend(sub.enabled_channels().map(|channel| DeliveryTarget {
                user_id: sub.user_id,
                channel: channel.clone(),
            }));
        }

        tracing::debug!(
            candidate_id = %candidate.id,
            subscriptions = subscriptions.len(),
            targets = targets.len(),
            "Resolved delivery targets"
        );

        targets
    }

    fn check(
        &self,
        candidate: &CandidateNotification,
        sub: &Subscription,
        now: DateTime<Utc>,
    ) -> Result<(), Rejection> {
        if !sub.active {
            return Err(Rejection::Inactive);
        }

        let scope = candidate.target_scope.as_ref();
        let addressed = scope.map(|s| s.user_ids.as_slice()).unwrap_or_default();

        if !addressed.is_empty() {
            if !addressed.contains(&sub.user_id) {
                return Err(Rejection::NotAddressed);
            }
        } else if !intersects(&sub.category_filters, &candidate.categories) {
            return Err(Rejection::Category);
        }

        if !sub.instrument_filters.is_empty()
            && !intersects(&sub.instrument_filters, candidate.routing_instruments())
        {
            return Err(Rejection::Instrument);
        }

        if let Some(sectors) = scope.map(|s| &s.sectors).filter(|s| !s.is_empty())
            && !sub.sector_filters.is_empty()
            && !intersects(&sub.sector_filters, sectors)
        {
            return Err(Rejection::Sector);
        }

        let local = now.with_timezone(&self.policy.local_offset);
        let urgent = candidate.priority == Priority::Urgent;

        if sub.delivered_on(local.date_naive()) >= self.daily_limit(candidate, sub) {
            return Err(Rejection::FrequencyCap);
        }

        if !urgent
            && sub
                .quiet_hours
                .is_some_and(|quiet| quiet.contains(local.time()))
        {
            return Err(Rejection::QuietHours);
        }

        Ok(())
    }
}

fn intersects(a: &[String], b: &[String]) -> bool {
    a.iter().any(|item| b.contains(item))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime, TimeZone};
    use herald_common::types::{
        BoundVariables, Channel, ChannelPreference, QuietHours, TargetScope,
    };
    use uuid::Uuid;

    fn subscription(categories: &[&str]) -> Subscription {
        let now = Utc::now();
        Subscription {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            device_channels: vec![ChannelPreference {
                channel: Channel::live(),
                enabled: true,
            }],
            category_filters: categories.iter().map(|c| c.to_string()).collect(),
            instrument_filters: vec![],
            sector_filters: vec![],
            frequency_cap: 10,
            quiet_hours: None,
            delivered_today_count: 0,
            count_date: None,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    fn candidate(priority: Priority, categories: &[&str]) -> CandidateNotification {
        CandidateNotification {
            id: Uuid::new_v4(),
            rule_id: "rule".into(),
            template_id: "news_breakout".into(),
            priority,
            categories: categories.iter().map(|c| c.to_string()).collect(),
            bound_variables: BoundVariables::default(),
            target_scope: None,
            schedule_at: None,
            expires_at: None,
            created_at: Utc::now(),
        }
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap()
    }

    fn matcher() -> SubscriptionMatcher {
        SubscriptionMatcher::new(MatchPolicy::default())
    }

    #[test]
    fn test_category_filter() {
        let news = subscription(&["news"]);
        let price = subscription(&["price"]);
        let empty = subscription(&[]);
        let targets = matcher().resolve(
            &candidate(Priority::High, &["news", "breaking"]),
            &[news.clone(), price, empty],
            noon(),
        );
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].user_id, news.user_id);
        assert_eq!(targets[0].channel, Channel::live());
    }

    #[test]
    fn test_one_target_per_enabled_channel() {
        let mut sub = subscription(&["news"]);
        sub.device_channels.push(ChannelPreference {
            channel: Channel::new("push"),
            enabled: true,
        });
        sub.device_channels.push(ChannelPreference {
            channel: Channel::new("email"),
            enabled: false,
        });
        let targets = matcher().resolve(&candidate(Priority::Low, &["news"]), &[sub], noon());
        let channels: Vec<_> = targets.iter().map(|t| t.channel.as_str()).collect();
        assert_eq!(channels, vec!["live", "push"]);
    }

    #[test]
    fn test_inactive_subscription_skipped() {
        let mut sub = subscription(&["news"]);
        sub.active = false;
        assert!(matcher()
            .resolve(&candidate(Priority::Urgent, &["news"]), &[sub], noon())
            .is_empty());
    }

    #[test]
    fn test_instrument_filter_prefers_scope_codes() {
        let mut sub = subscription(&["price"]);
        sub.instrument_filters = vec!["600519".into()];

        let mut c = candidate(Priority::Medium, &["price"]);
        c.bound_variables.instrument_codes = vec!["600519".into()];
        assert_eq!(matcher().resolve(&c, &[sub.clone()], noon()).len(), 1);

        c.target_scope = Some(TargetScope {
            instrument_codes: vec!["000001".into()],
            ..TargetScope::default()
        });
        assert!(matcher().resolve(&c, &[sub.clone()], noon()).is_empty());

        c.target_scope = None;
        c.bound_variables.instrument_codes.clear();
        assert!(matcher().resolve(&c, &[sub], noon()).is_empty());
    }

    #[test]
    fn test_sector_filter_applies_only_when_scope_names_sectors() {
        let mut sub = subscription(&["news"]);
        sub.sector_filters = vec!["banks".into()];

        let mut c = candidate(Priority::Low, &["news"]);
        assert_eq!(matcher().resolve(&c, &[sub.clone()], noon()).len(), 1);

        c.target_scope = Some(TargetScope {
            sectors: vec!["energy".into()],
            ..TargetScope::default()
        });
        assert!(matcher().resolve(&c, &[sub.clone()], noon()).is_empty());

        c.target_scope = Some(TargetScope {
            sectors: vec!["banks".into()],
            ..TargetScope::default()
        });
        assert_eq!(matcher().resolve(&c, &[sub], noon()).len(), 1);
    }

    #[test]
    fn test_direct_addressing_bypasses_categories() {
        let addressed = subscription(&[]);
        let other = subscription(&["system"]);
        let mut c = candidate(Priority::Medium, &["system"]);
        c.target_scope = Some(TargetScope {
            user_ids: vec![addressed.user_id],
            ..TargetScope::default()
        });
        let targets = matcher().resolve(&c, &[addressed.clone(), other], noon());
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].user_id, addressed.user_id);
    }

    #[test]
    fn test_frequency_cap_boundary() {
        let today = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        let mut below = subscription(&["news"]);
        below.frequency_cap = 5;
        below.delivered_today_count = 4;
        below.count_date = Some(today);

        let mut at_cap = below.clone();
        at_cap.user_id = Uuid::new_v4();
        at_cap.delivered_today_count = 5;

        let mut stale = at_cap.clone();
        stale.user_id = Uuid::new_v4();
        stale.count_date = NaiveDate::from_ymd_opt(2024, 3, 4);

        let targets = matcher().resolve(
            &candidate(Priority::High, &["news"]),
            &[below.clone(), at_cap.clone(), stale.clone()],
            noon(),
        );
        let users: Vec<_> = targets.iter().map(|t| t.user_id).collect();
        assert_eq!(users, vec![below.user_id, stale.user_id]);

        // urgent does not bypass the cap by default
        assert!(matcher()
            .resolve(&candidate(Priority::Urgent, &["news"]), &[at_cap.clone()], noon())
            .is_empty());

        let lenient = SubscriptionMatcher::new(MatchPolicy {
            urgent_bypasses_frequency_cap: true,
            ..MatchPolicy::default()
        });
        assert_eq!(
            lenient
                .resolve(&candidate(Priority::Urgent, &["news"]), &[at_cap], noon())
                .len(),
            1
        );
    }

    #[test]
    fn test_urgent_bypasses_quiet_hours() {
        let mut sub = subscription(&["news"]);
        sub.quiet_hours = Some(QuietHours {
            start: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(7, 0, 0).unwrap(),
        });
        let night = Utc.with_ymd_and_hms(2024, 3, 5, 23, 0, 0).unwrap();

        for priority in [Priority::Low, Priority::Medium, Priority::High] {
            assert!(matcher()
                .resolve(&candidate(priority, &["news"]), &[sub.clone()], night)
                .is_empty());
        }
        assert_eq!(
            matcher()
                .resolve(&candidate(Priority::Urgent, &["news"]), &[sub.clone()], night)
                .len(),
            1
        );
        assert_eq!(
            matcher()
                .resolve(&candidate(Priority::Low, &["news"]), &[sub], noon())
                .len(),
            1
        );
    }

    #[test]
    fn test_quiet_hours_use_local_offset() {
        let mut sub = subscription(&["news"]);
        sub.quiet_hours = Some(QuietHours {
            start: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(7, 0, 0).unwrap(),
        });
        // 15:00 UTC is 23:00 at UTC+8
        let afternoon = Utc.with_ymd_and_hms(2024, 3, 5, 15, 0, 0).unwrap();
        let east = SubscriptionMatcher::new(MatchPolicy {
            urgent_bypasses_frequency_cap: false,
            local_offset: FixedOffset::east_opt(8 * 3600).unwrap(),
        });
        assert!(east
            .resolve(&candidate(Priority::High, &["news"]), &[sub.clone()], afternoon)
            .is_empty());
        assert_eq!(
            matcher()
                .resolve(&candidate(Priority::High, &["news"]), &[sub], afternoon)
                .len(),
            1
        );
    }
}
