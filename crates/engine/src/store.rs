//! Storage seams for subscriptions and delivery records.
//!
//! The pipeline only talks to these traits. [`MemoryStore`] backs tests and
//! database-less deployments; `postgres::PgStore` is the durable implementation.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{Channel, DeliveryKey, DeliveryRecord, Subscription};

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get(&self, user_id: Uuid) -> Result<Option<Subscription>, AppError>;

    /// Insert or replace the subscription for `sub.user_id`. An existing
    /// row keeps its delivery counter; only reservations move it.
    async fn put(&self, sub: Subscription) -> Result<(), AppError>;

    async fn list_active(&self) -> Result<Vec<Subscription>, AppError>;

    /// Claim one delivery slot for local `date` if fewer than `cap` are used,
    /// resetting the counter first when it belongs to an earlier day.
    /// Check and increment are a single atomic step.
    async fn try_reserve_delivery(
        &self,
        user_id: Uuid,
        date: NaiveDate,
        cap: u32,
    ) -> Result<bool, AppError>;

    /// Return a slot claimed for `date` that did not end in a delivery.
    async fn release_delivery(&self, user_id: Uuid, date: NaiveDate) -> Result<(), AppError>;

    /// Toggle one device channel. Returns false when the user or channel is unknown.
    async fn set_channel_enabled(
        &self,
        user_id: Uuid,
        channel: &Channel,
        enabled: bool,
    ) -> Result<bool, AppError>;
}

#[async_trait]
pub trait DeliveryLog: Send + Sync {
    /// Append records; a record with an existing key replaces it.
    async fn append(&self, records: &[DeliveryRecord]) -> Result<(), AppError>;

    /// Flag every record of (message, user) as read. Returns the number updated.
    async fn mark_read(&self, message_id: Uuid, user_id: Uuid) -> Result<u64, AppError>;

    /// Flag every record of (message, user) as clicked. Returns the number updated.
    async fn mark_clicked(&self, message_id: Uuid, user_id: Uuid) -> Result<u64, AppError>;

    /// Records sent at or after `from`.
    async fn since(&self, from: DateTime<Utc>) -> Result<Vec<DeliveryRecord>, AppError>;

    /// Drop records sent before `cutoff`. Returns the number removed.
    /// Durable logs keep their history.
    async fn prune_before(&self, _cutoff: DateTime<Utc>) -> Result<u64, AppError> {
        Ok(0)
    }
}

/// Delivery records with a (message, user) index for read/click updates.
#[derive(Default)]
struct RecordLog {
    records: HashMap<DeliveryKey, DeliveryRecord>,
    by_recipient: HashMap<(Uuid, Uuid), HashSet<DeliveryKey>>,
}

impl RecordLog {
    fn insert(&mut self, record: DeliveryRecord) {
        let key = record.key();
        self.by_recipient
            .entry((record.message_id, record.user_id))
            .or_default()
            .insert(key.clone());
        self.records.insert(key, record);
    }

    fn flag(&mut self, message_id: Uuid, user_id: Uuid, set: impl Fn(&mut DeliveryRecord)) -> u64 {
        let Some(keys) = self.by_recipient.get(&(message_id, user_id)) else {
            return 0;
        };
        let mut updated = 0;
        for key in keys {
            if let Some(record) = self.records.get_mut(key) {
                set(record);
                updated += 1;
            }
        }
        updated
    }

    fn prune_before(&mut self, cutoff: DateTime<Utc>) -> u64 {
        let before = self.records.len();
        self.records.retain(|_, r| r.sent_at >= cutoff);
        let records = &self.records;
        self.by_recipient.retain(|_, keys| {
            keys.retain(|k| records.contains_key(k));
            !keys.is_empty()
        });
        (before - self.records.len()) as u64
    }
}

/// In-process store guarded by `parking_lot` locks.
#[derive(Default)]
pub struct MemoryStore {
    subscriptions: RwLock<HashMap<Uuid, Subscription>>,
    log: RwLock<RecordLog>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_count(&self) -> usize {
        self.log.read().records.len()
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn get(&self, user_id: Uuid) -> Result<Option<Subscription>, AppError> {
        Ok(self.subscriptions.read().get(&user_id).cloned())
    }

    async fn put(&self, mut sub: Subscription) -> Result<(), AppError> {
        let mut subs = self.subscriptions.write();
        if let Some(existing) = subs.get(&sub.user_id) {
            sub.delivered_today_count = existing.delivered_today_count;
            sub.count_date = existing.count_date;
        }
        subs.insert(sub.user_id, sub);
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<Subscription>, AppError> {
        Ok(self
            .subscriptions
            .read()
            .values()
            .filter(|s| s.active)
            .cloned()
            .collect())
    }

    async fn try_reserve_delivery(
        &self,
        user_id: Uuid,
        date: NaiveDate,
        cap: u32,
    ) -> Result<bool, AppError> {
        let mut subs = self.subscriptions.write();
        let Some(sub) = subs.get_mut(&user_id) else {
            return Ok(false);
        };
        let used = sub.delivered_on(date);
        if used >= cap {
            return Ok(false);
        }
        sub.delivered_today_count = used + 1;
        sub.count_date = Some(date);
        Ok(true)
    }

    async fn release_delivery(&self, user_id: Uuid, date: NaiveDate) -> Result<(), AppError> {
        if let Some(sub) = self.subscriptions.write().get_mut(&user_id)
            && sub.count_date == Some(date)
        {
            sub.delivered_today_count = sub.delivered_today_count.saturating_sub(1);
        }
        Ok(())
    }

    async fn set_channel_enabled(
        &self,
        user_id: Uuid,
        channel: &Channel,
        enabled: bool,
    ) -> Result<bool, AppError> {
        let mut subs = self.subscriptions.write();
        let Some(sub) = subs.get_mut(&user_id) else {
            return Ok(false);
        };
        let Some(pref) = sub.device_channels.iter_mut().find(|p| &p.channel == channel) else {
            return Ok(false);
        };
        pref.enabled = enabled;
        sub.updated_at = Utc::now();
        Ok(true)
    }
}

#[async_trait]
impl DeliveryLog for MemoryStore {
    async fn append(&self, records: &[DeliveryRecord]) -> Result<(), AppError> {
        let mut log = self.log.write();
        for record in records {
            log.insert(record.clone());
        }
        Ok(())
    }

    async fn mark_read(&self, message_id: Uuid, user_id: Uuid) -> Result<u64, AppError> {
        Ok(self.log.write().flag(message_id, user_id, |r| r.read = true))
    }

    async fn mark_clicked(&self, message_id: Uuid, user_id: Uuid) -> Result<u64, AppError> {
        Ok(self.log.write().flag(message_id, user_id, |r| r.clicked = true))
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError> {
        Ok(self.log.write().prune_before(cutoff))
    }

    async fn since(&self, from: DateTime<Utc>) -> Result<Vec<DeliveryRecord>, AppError> {
        let mut records: Vec<_> = self
            .log
            .read()
            .records
            .values()
            .filter(|r| r.sent_at >= from)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.sent_at.cmp(&b.sent_at).then_with(|| a.key().cmp(&b.key())));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_common::types::{ChannelPreference, Priority};

    fn subscription(user_id: Uuid) -> Subscription {
        let now = Utc::now();
        Subscription {
            id: Uuid::new_v4(),
            user_id,
            device_channels: vec![ChannelPreference {
                channel: Channel::new("push"),
                enabled: true,
            }],
            category_filters: vec!["news".into()],
            instrument_filters: vec![],
            sector_filters: vec![],
            frequency_cap: 3,
            quiet_hours: None,
            delivered_today_count: 0,
            count_date: None,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    fn record(message_id: Uuid, user_id: Uuid, attempt: u32) -> DeliveryRecord {
        DeliveryRecord {
            message_id,
            user_id,
            channel: Channel::new("push"),
            category: Some("news".into()),
            priority: Priority::High,
            attempt,
            sent_at: Utc::now(),
            delivered: attempt == 2,
            read: false,
            clicked: false,
            failure_reason: None,
        }
    }

    #[tokio::test]
    async fn test_reservation_respects_cap_and_resets_on_new_day() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        store.put(subscription(user)).await.unwrap();

        let monday = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        let tuesday = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        for _ in 0..3 {
            assert!(store.try_reserve_delivery(user, monday, 3).await.unwrap());
        }
        assert!(!store.try_reserve_delivery(user, monday, 3).await.unwrap());
        assert_eq!(store.get(user).await.unwrap().unwrap().delivered_today_count, 3);

        store.release_delivery(user, monday).await.unwrap();
        assert!(store.try_reserve_delivery(user, monday, 3).await.unwrap());

        assert!(store.try_reserve_delivery(user, tuesday, 3).await.unwrap());
        let sub = store.get(user).await.unwrap().unwrap();
        assert_eq!(sub.delivered_today_count, 1);
        assert_eq!(sub.count_date, Some(tuesday));

        // a stale release does not touch the new day
        store.release_delivery(user, monday).await.unwrap();
        assert_eq!(store.get(user).await.unwrap().unwrap().delivered_today_count, 1);
        assert!(!store
            .try_reserve_delivery(Uuid::new_v4(), tuesday, 3)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_reservations_never_exceed_cap() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let user = Uuid::new_v4();
        store.put(subscription(user)).await.unwrap();
        let today = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.try_reserve_delivery(user, today, 3).await.unwrap() })
            })
            .collect();
        let mut granted = 0;
        for task in tasks {
            if task.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 3);
    }

    #[tokio::test]
    async fn test_put_keeps_existing_counter() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        store.put(subscription(user)).await.unwrap();
        let today = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        assert!(store.try_reserve_delivery(user, today, 3).await.unwrap());

        // a settings write built from an older read
        let mut edited = subscription(user);
        edited.frequency_cap = 9;
        store.put(edited).await.unwrap();

        let sub = store.get(user).await.unwrap().unwrap();
        assert_eq!(sub.frequency_cap, 9);
        assert_eq!(sub.delivered_today_count, 1);
        assert_eq!(sub.count_date, Some(today));
    }

    #[tokio::test]
    async fn test_set_channel_enabled() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        store.put(subscription(user)).await.unwrap();

        assert!(store
            .set_channel_enabled(user, &Channel::new("push"), false)
            .await
            .unwrap());
        assert!(!store.get(user).await.unwrap().unwrap().device_channels[0].enabled);
        assert!(!store
            .set_channel_enabled(user, &Channel::new("sms"), false)
            .await
            .unwrap());
        assert!(!store
            .set_channel_enabled(Uuid::new_v4(), &Channel::new("push"), false)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_list_active_skips_disabled() {
        let store = MemoryStore::new();
        let mut disabled = subscription(Uuid::new_v4());
        disabled.active = false;
        store.put(disabled).await.unwrap();
        store.put(subscription(Uuid::new_v4())).await.unwrap();
        assert_eq!(store.list_active().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delivery_log_flags_and_replace() {
        let store = MemoryStore::new();
        let (message, user) = (Uuid::new_v4(), Uuid::new_v4());
        store
            .append(&[record(message, user, 1), record(message, user, 2)])
            .await
            .unwrap();
        store.append(&[record(message, user, 2)]).await.unwrap();

        let all = store.since(Utc::now() - chrono::Duration::hours(1)).await.unwrap();
        assert_eq!(all.len(), 2);

        assert_eq!(store.mark_read(message, user).await.unwrap(), 2);
        assert_eq!(store.mark_clicked(message, Uuid::new_v4()).await.unwrap(), 0);
        assert!(store
            .since(Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap()
            .iter()
            .all(|r| r.read && !r.clicked));
    }

    #[tokio::test]
    async fn test_prune_drops_old_records_and_index() {
        let store = MemoryStore::new();
        let (old_message, new_message, user) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let mut old = record(old_message, user, 1);
        old.sent_at = Utc::now() - chrono::Duration::days(400);
        store.append(&[old, record(new_message, user, 1)]).await.unwrap();

        let cutoff = Utc::now() - chrono::Duration::days(366);
        assert_eq!(store.prune_before(cutoff).await.unwrap(), 1);
        assert_eq!(store.record_count(), 1);
        assert_eq!(store.mark_read(old_message, user).await.unwrap(), 0);
        assert_eq!(store.mark_read(new_message, user).await.unwrap(), 1);
    }
}
