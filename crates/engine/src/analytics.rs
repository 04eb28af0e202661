//! Analytics aggregator: delivery outcomes rolled up into per-day metrics.
//!
//! Records are held keyed by `(message_id, user_id, channel, attempt)` so
//! re-ingesting the same record is a no-op. Daily rollups count every
//! `(message, user, channel)` once, using its highest attempt, so a send that
//! succeeded on its third attempt contributes one sent and one delivered.
//!
//! Records older than the longest reportable window are pruned by
//! [`spawn_retention`], together with the delivery log's in-memory copy.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{Channel, ChannelStats, DailyAnalytics, DeliveryKey, DeliveryRecord};

use crate::store::DeliveryLog;

/// Longest window `daily` will report on.
pub const MAX_ANALYTICS_DAYS: u32 = 366;

/// Recipient feedback on a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interaction {
    Read,
    Click,
}

/// Oldest send still needed to answer `daily` at `now`.
pub fn retention_cutoff(now: DateTime<Utc>) -> DateTime<Utc> {
    now - Duration::days(i64::from(MAX_ANALYTICS_DAYS) + 1)
}

#[derive(Default)]
struct Records {
    by_key: BTreeMap<DeliveryKey, DeliveryRecord>,
    by_recipient: HashMap<(Uuid, Uuid), HashSet<DeliveryKey>>,
}

impl Records {
    fn insert(&mut self, record: DeliveryRecord) {
        let key = record.key();
        self.by_recipient
            .entry((record.message_id, record.user_id))
            .or_default()
            .insert(key.clone());
        self.by_key.insert(key, record);
    }
}

pub struct AnalyticsAggregator {
    records: RwLock<Records>,
    offset: FixedOffset,
}

impl AnalyticsAggregator {
    /// `offset` decides which calendar day a send belongs to.
    pub fn new(offset: FixedOffset) -> Self {
        Self {
            records: RwLock::new(Records::default()),
            offset,
        }
    }

    /// Add or replace records.
    pub fn ingest(&self, records: &[DeliveryRecord]) {
        let mut stored = self.records.write();
        for record in records {
            stored.insert(record.clone());
        }
    }

    /// Discard everything and recompute from `records`.
    pub fn rebuild(&self, records: &[DeliveryRecord]) {
        let mut fresh = Records::default();
        for record in records {
            fresh.insert(record.clone());
        }
        *self.records.write() = fresh;
    }

    /// Drop records sent before `cutoff`. Returns how many were removed.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut stored = self.records.write();
        let before = stored.by_key.len();
        let Records {
            by_key,
            by_recipient,
        } = &mut *stored;
        by_key.retain(|_, r| r.sent_at >= cutoff);
        by_recipient.retain(|_, keys| {
            keys.retain(|k| by_key.contains_key(k));
            !keys.is_empty()
        });
        before - by_key.len()
    }

    /// Apply a read or click to every record of (message, user). Returns the
    /// number of records touched.
    pub fn apply(&self, interaction: Interaction, message_id: Uuid, user_id: Uuid) -> usize {
        let mut stored = self.records.write();
        let Records {
            by_key,
            by_recipient,
        } = &mut *stored;
        let Some(keys) = by_recipient.get(&(message_id, user_id)) else {
            return 0;
        };
        let mut touched = 0;
        for k in keys.iter() {
            let Some(record) = by_key.get_mut(k) else {
                continue;
            };
            match interaction {
                Interaction::Read => record.read = true,
                Interaction::Click => record.clicked = true,
            }
            touched += 1;
        }
        touched
    }

    /// Persist an interaction to `log` and apply it to the in-memory view.
    pub async fn record_interaction(
        &self,
        log: &dyn DeliveryLog,
        interaction: Interaction,
        message_id: Uuid,
        user_id: Uuid,
    ) -> Result<u64, AppError> {
        let updated = match interaction {
            Interaction::Read => log.mark_read(message_id, user_id).await?,
            Interaction::Click => log.mark_clicked(message_id, user_id).await?,
        };
        self.apply(interaction, message_id, user_id);
        tracing::debug!(
            message_id = %message_id,
            user_id = %user_id,
            interaction = ?interaction,
            updated,
            "Recorded interaction"
        );
        Ok(updated)
    }

    pub fn record_count(&self) -> usize {
        self.records.read().by_key.len()
    }

    /// One aggregate per local date in `[today - days + 1, today]`, oldest
    /// first. Days without activity are present with zero counts.
    pub fn daily(&self, days: u32, today: NaiveDate) -> Vec<DailyAnalytics> {
        let days = days.min(MAX_ANALYTICS_DAYS);
        if days == 0 {
            return Vec::new();
        }
        let first = today - Duration::days(i64::from(days) - 1);

        let mut by_date: BTreeMap<NaiveDate, DailyAnalytics> = (0..i64::from(days))
            .map(|offset| {
                let date = first + Duration::days(offset);
                (date, DailyAnalytics::empty(date))
            })
            .collect();

        for record in self.final_attempts() {
            let date = record.sent_at.with_timezone(&self.offset).date_naive();
            let Some(day) = by_date.get_mut(&date) else {
                continue;
            };

            day.total_sent += 1;
            if record.delivered {
                day.total_delivered += 1;
            }
            if record.read {
                day.total_read += 1;
            }
            if record.clicked {
                day.total_clicked += 1;
            }
            if let Some(category) = &record.category {
                *day.category_counts.entry(category.clone()).or_default() += 1;
            }

            let stats: &mut ChannelStats = day
                .channel_breakdown
                .entry(record.channel.to_string())
                .or_default();
            stats.sent += 1;
            if record.delivered {
                stats.delivered += 1;
            } else {
                stats.failed += 1;
            }
        }

        by_date
            .into_values()
            .map(|mut day| {
                day.success_rate = ratio(day.total_delivered, day.total_sent);
                day.read_rate = ratio(day.total_read, day.total_delivered);
                day.click_rate = ratio(day.total_clicked, day.total_delivered);
                day
            })
            .collect()
    }

    /// Highest-attempt record per (message, user, channel).
    fn final_attempts(&self) -> Vec<DeliveryRecord> {
        let stored = self.records.read();
        let mut latest: HashMap<(Uuid, Uuid, &Channel), &DeliveryRecord> = HashMap::new();
        for record in stored.by_key.values() {
            latest
                .entry((record.message_id, record.user_id, &record.channel))
                .and_modify(|current| {
                    if record.attempt > current.attempt {
                        *current = record;
                    }
                })
                .or_insert(record);
        }
        latest.into_values().cloned().collect()
    }
}

/// Periodically prune `analytics` and `log` to the reportable window.
pub fn spawn_retention(
    analytics: Arc<AnalyticsAggregator>,
    log: Arc<dyn DeliveryLog>,
    period: std::time::Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let cutoff = retention_cutoff(Utc::now());
            let pruned = analytics.prune_before(cutoff);
            match log.prune_before(cutoff).await {
                Ok(logged) => {
                    tracing::debug!(analytics = pruned, log = logged, "Pruned delivery history");
                }
                Err(e) => tracing::warn!(error = %e, "Failed to prune delivery log"),
            }
        }
    })
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use herald_common::types::Priority;

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, hour, 0, 0).unwrap()
    }

    fn record(
        message_id: Uuid,
        user_id: Uuid,
        channel: &str,
        attempt: u32,
        delivered: bool,
        sent_at: DateTime<Utc>,
    ) -> DeliveryRecord {
        DeliveryRecord {
            message_id,
            user_id,
            channel: Channel::new(channel),
            category: Some("news".into()),
            priority: Priority::High,
            attempt,
            sent_at,
            delivered,
            read: false,
            clicked: false,
            failure_reason: (!delivered).then(|| "timeout".to_string()),
        }
    }

    #[test]
    fn test_retried_delivery_counted_once() {
        let agg = AnalyticsAggregator::new(utc());
        let (message, user) = (Uuid::new_v4(), Uuid::new_v4());
        agg.ingest(&[
            record(message, user, "push", 1, false, at(5, 10)),
            record(message, user, "push", 2, false, at(5, 10)),
            record(message, user, "push", 3, true, at(5, 10)),
        ]);

        let today = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        let day = agg.daily(1, today).remove(0);
        assert_eq!(day.total_sent, 1);
        assert_eq!(day.total_delivered, 1);
        assert_eq!(day.success_rate, 1.0);
        assert_eq!(day.channel_breakdown["push"].delivered, 1);
        assert_eq!(day.channel_breakdown["push"].failed, 0);
    }

    #[test]
    fn test_reingest_is_idempotent() {
        let records: Vec<_> = (0..5)
            .map(|i| {
                record(
                    Uuid::new_v4(),
                    Uuid::new_v4(),
                    if i % 2 == 0 { "live" } else { "email" },
                    1,
                    i != 3,
                    at(5, 9 + i),
                )
            })
            .collect();

        let agg = AnalyticsAggregator::new(utc());
        agg.ingest(&records);
        let today = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        let once = agg.daily(3, today);

        agg.ingest(&records);
        assert_eq!(agg.daily(3, today), once);

        let rebuilt = AnalyticsAggregator::new(utc());
        rebuilt.rebuild(&records);
        rebuilt.rebuild(&records);
        assert_eq!(rebuilt.daily(3, today), once);
        assert_eq!(once[2].total_sent, 5);
        assert_eq!(once[2].total_delivered, 4);
        assert_eq!(once[2].category_counts["news"], 5);
    }

    #[test]
    fn test_daily_zero_fills_and_orders_dates() {
        let agg = AnalyticsAggregator::new(utc());
        agg.ingest(&[record(Uuid::new_v4(), Uuid::new_v4(), "live", 1, true, at(3, 12))]);

        let today = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        let days = agg.daily(7, today);
        assert_eq!(days.len(), 7);
        assert_eq!(days[0].date, NaiveDate::from_ymd_opt(2024, 2, 28).unwrap());
        assert_eq!(days[6].date, today);
        assert_eq!(days[4].total_sent, 1);
        assert_eq!(days.iter().map(|d| d.total_sent).sum::<u64>(), 1);
        assert_eq!(days[6].success_rate, 0.0);
        assert!(agg.daily(0, today).is_empty());
    }

    #[test]
    fn test_read_and_click_rates() {
        let agg = AnalyticsAggregator::new(utc());
        let user = Uuid::new_v4();
        let (m1, m2) = (Uuid::new_v4(), Uuid::new_v4());
        agg.ingest(&[
            record(m1, user, "live", 1, true, at(5, 8)),
            record(m2, user, "live", 1, true, at(5, 9)),
        ]);

        assert_eq!(agg.apply(Interaction::Read, m1, user), 1);
        assert_eq!(agg.apply(Interaction::Read, m2, user), 1);
        assert_eq!(agg.apply(Interaction::Click, m1, user), 1);
        assert_eq!(agg.apply(Interaction::Click, Uuid::new_v4(), user), 0);

        let day = agg.daily(1, NaiveDate::from_ymd_opt(2024, 3, 5).unwrap()).remove(0);
        assert_eq!(day.total_read, 2);
        assert_eq!(day.total_clicked, 1);
        assert_eq!(day.read_rate, 1.0);
        assert_eq!(day.click_rate, 0.5);
    }

    #[test]
    fn test_local_offset_moves_day_boundary() {
        // 20:00 UTC on the 4th is 04:00 on the 5th at UTC+8
        let agg = AnalyticsAggregator::new(FixedOffset::east_opt(8 * 3600).unwrap());
        agg.ingest(&[record(Uuid::new_v4(), Uuid::new_v4(), "live", 1, true, at(4, 20))]);
        let days = agg.daily(2, NaiveDate::from_ymd_opt(2024, 3, 5).unwrap());
        assert_eq!(days[0].total_sent, 0);
        assert_eq!(days[1].total_sent, 1);
    }

    #[test]
    fn test_prune_drops_records_outside_window() {
        let agg = AnalyticsAggregator::new(utc());
        let user = Uuid::new_v4();
        let (old, recent) = (Uuid::new_v4(), Uuid::new_v4());
        let now = at(5, 12);
        let mut stale = record(old, user, "live", 1, true, now);
        stale.sent_at = now - Duration::days(400);
        agg.ingest(&[stale, record(recent, user, "live", 1, true, at(5, 8))]);

        assert_eq!(agg.prune_before(retention_cutoff(now)), 1);
        assert_eq!(agg.record_count(), 1);
        assert_eq!(agg.apply(Interaction::Read, old, user), 0);
        assert_eq!(agg.apply(Interaction::Read, recent, user), 1);
        assert_eq!(agg.prune_before(retention_cutoff(now)), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retention_task_prunes_both_views() {
        use crate::store::MemoryStore;

        let log = Arc::new(MemoryStore::new());
        let agg = Arc::new(AnalyticsAggregator::new(utc()));
        let mut stale = record(Uuid::new_v4(), Uuid::new_v4(), "live", 1, true, Utc::now());
        stale.sent_at = Utc::now() - Duration::days(400);
        let fresh = record(Uuid::new_v4(), Uuid::new_v4(), "live", 1, true, Utc::now());
        log.append(&[stale.clone(), fresh.clone()]).await.unwrap();
        agg.ingest(&[stale, fresh]);

        let task = spawn_retention(agg.clone(), log.clone(), std::time::Duration::from_secs(3600));
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        task.abort();

        assert_eq!(agg.record_count(), 1);
        assert_eq!(log.record_count(), 1);
    }

    #[tokio::test]
    async fn test_record_interaction_updates_log_and_view() {
        use crate::store::MemoryStore;

        let log = MemoryStore::new();
        let agg = AnalyticsAggregator::new(utc());
        let (message, user) = (Uuid::new_v4(), Uuid::new_v4());
        let records = [record(message, user, "live", 1, true, at(5, 8))];
        log.append(&records).await.unwrap();
        agg.ingest(&records);

        let updated = agg
            .record_interaction(&log, Interaction::Click, message, user)
            .await
            .unwrap();
        assert_eq!(updated, 1);
        let day = agg.daily(1, NaiveDate::from_ymd_opt(2024, 3, 5).unwrap()).remove(0);
        assert_eq!(day.total_clicked, 1);
    }
}
