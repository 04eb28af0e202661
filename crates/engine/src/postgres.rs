//! PostgreSQL implementations of the storage traits.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{
    Channel, ChannelPreference, DeliveryRecord, Priority, QuietHours, Subscription,
};

use crate::store::{DeliveryLog, SubscriptionStore};

/// Postgres-backed store. Schema lives in `migrations/`.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    user_id: Uuid,
    device_channels: Json<Vec<ChannelPreference>>,
    category_filters: Vec<String>,
    instrument_filters: Vec<String>,
    sector_filters: Vec<String>,
    frequency_cap: i32,
    quiet_start: Option<NaiveTime>,
    quiet_end: Option<NaiveTime>,
    delivered_today_count: i32,
    count_date: Option<NaiveDate>,
    active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<SubscriptionRow> for Subscription {
    fn from(row: SubscriptionRow) -> Self {
        let quiet_hours = match (row.quiet_start, row.quiet_end) {
            (Some(start), Some(end)) => Some(QuietHours { start, end }),
            _ => None,
        };
        Subscription {
            id: row.id,
            user_id: row.user_id,
            device_channels: row.device_channels.0,
            category_filters: row.category_filters,
            instrument_filters: row.instrument_filters,
            sector_filters: row.sector_filters,
            frequency_cap: row.frequency_cap.max(0) as u32,
            quiet_hours,
            delivered_today_count: row.delivered_today_count.max(0) as u32,
            count_date: row.count_date,
            active: row.active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct DeliveryRow {
    message_id: Uuid,
    user_id: Uuid,
    channel: String,
    attempt: i32,
    category: Option<String>,
    priority: String,
    sent_at: DateTime<Utc>,
    delivered: bool,
    read: bool,
    clicked: bool,
    failure_reason: Option<String>,
}

impl TryFrom<DeliveryRow> for DeliveryRecord {
    type Error = AppError;

    fn try_from(row: DeliveryRow) -> Result<Self, Self::Error> {
        let priority: Priority = row.priority.parse().map_err(AppError::Internal)?;
        Ok(DeliveryRecord {
            message_id: row.message_id,
            user_id: row.user_id,
            channel: Channel::new(row.channel),
            category: row.category,
            priority,
            attempt: row.attempt.max(0) as u32,
            sent_at: row.sent_at,
            delivered: row.delivered,
            read: row.read,
            clicked: row.clicked,
            failure_reason: row.failure_reason,
        })
    }
}

#[async_trait]
impl SubscriptionStore for PgStore {
    async fn get(&self, user_id: Uuid) -> Result<Option<Subscription>, AppError> {
        let row: Option<SubscriptionRow> =
            sqlx::query_as("SELECT * FROM subscriptions WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(Subscription::from))
    }

    async fn put(&self, sub: Subscription) -> Result<(), AppError> {
        let (quiet_start, quiet_end) = match sub.quiet_hours {
            Some(q) => (Some(q.start), Some(q.end)),
            None => (None, None),
        };

        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                id, user_id, device_channels, category_filters, instrument_filters,
                sector_filters, frequency_cap, quiet_start, quiet_end,
                delivered_today_count, count_date, active, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (user_id) DO UPDATE SET
                device_channels = EXCLUDED.device_channels,
                category_filters = EXCLUDED.category_filters,
                instrument_filters = EXCLUDED.instrument_filters,
                sector_filters = EXCLUDED.sector_filters,
                frequency_cap = EXCLUDED.frequency_cap,
                quiet_start = EXCLUDED.quiet_start,
                quiet_end = EXCLUDED.quiet_end,
                active = EXCLUDED.active,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(sub.id)
        .bind(sub.user_id)
        .bind(Json(&sub.device_channels))
        .bind(&sub.category_filters)
        .bind(&sub.instrument_filters)
        .bind(&sub.sector_filters)
        .bind(sub.frequency_cap as i32)
        .bind(quiet_start)
        .bind(quiet_end)
        .bind(sub.delivered_today_count as i32)
        .bind(sub.count_date)
        .bind(sub.active)
        .bind(sub.created_at)
        .bind(sub.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<Subscription>, AppError> {
        let rows: Vec<SubscriptionRow> =
            sqlx::query_as("SELECT * FROM subscriptions WHERE active = true")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(Subscription::from).collect())
    }

    async fn try_reserve_delivery(
        &self,
        user_id: Uuid,
        date: NaiveDate,
        cap: u32,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET delivered_today_count = CASE
                    WHEN count_date = $2 THEN delivered_today_count + 1
                    ELSE 1
                END,
                count_date = $2
            WHERE user_id = $1
              AND CASE WHEN count_date = $2 THEN delivered_today_count ELSE 0 END < $3
            "#,
        )
        .bind(user_id)
        .bind(date)
        .bind(i64::from(cap))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_delivery(&self, user_id: Uuid, date: NaiveDate) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET delivered_today_count = delivered_today_count - 1
            WHERE user_id = $1 AND count_date = $2 AND delivered_today_count > 0
            "#,
        )
        .bind(user_id)
        .bind(date)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_channel_enabled(
        &self,
        user_id: Uuid,
        channel: &Channel,
        enabled: bool,
    ) -> Result<bool, AppError> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(Json<Vec<ChannelPreference>>,)> = sqlx::query_as(
            "SELECT device_channels FROM subscriptions WHERE user_id = $1 FOR UPDATE",
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((Json(mut channels),)) = row else {
            return Ok(false);
        };
        let Some(pref) = channels.iter_mut().find(|p| &p.channel == channel) else {
            return Ok(false);
        };
        pref.enabled = enabled;

        sqlx::query(
            "UPDATE subscriptions SET device_channels = $2, updated_at = NOW() WHERE user_id = $1",
        )
        .bind(user_id)
        .bind(Json(&channels))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }
}

#[async_trait]
impl DeliveryLog for PgStore {
    async fn append(&self, records: &[DeliveryRecord]) -> Result<(), AppError> {
        for record in records {
            sqlx::query(
                r#"
                INSERT INTO delivery_records (
                    message_id, user_id, channel, attempt, category, priority,
                    sent_at, delivered, read, clicked, failure_reason
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ON CONFLICT (message_id, user_id, channel, attempt) DO UPDATE SET
                    category = EXCLUDED.category,
                    priority = EXCLUDED.priority,
                    sent_at = EXCLUDED.sent_at,
                    delivered = EXCLUDED.delivered,
                    failure_reason = EXCLUDED.failure_reason
                "#,
            )
            .bind(record.message_id)
            .bind(record.user_id)
            .bind(record.channel.as_str())
            .bind(record.attempt as i32)
            .bind(&record.category)
            .bind(record.priority.to_string())
            .bind(record.sent_at)
            .bind(record.delivered)
            .bind(record.read)
            .bind(record.clicked)
            .bind(&record.failure_reason)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn mark_read(&self, message_id: Uuid, user_id: Uuid) -> Result<u64, AppError> {
        let result = sqlx::query(
            "UPDATE delivery_records SET read = true WHERE message_id = $1 AND user_id = $2",
        )
        .bind(message_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn mark_clicked(&self, message_id: Uuid, user_id: Uuid) -> Result<u64, AppError> {
        let result = sqlx::query(
            "UPDATE delivery_records SET clicked = true WHERE message_id = $1 AND user_id = $2",
        )
        .bind(message_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn since(&self, from: DateTime<Utc>) -> Result<Vec<DeliveryRecord>, AppError> {
        let rows: Vec<DeliveryRow> = sqlx::query_as(
            "SELECT * FROM delivery_records WHERE sent_at >= $1 ORDER BY sent_at, message_id, user_id, channel, attempt",
        )
        .bind(from)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(DeliveryRecord::try_from).collect()
    }
}
