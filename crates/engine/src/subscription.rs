//! Subscription service: create, update, disable and fetch user subscriptions.
//!
//! Each user has at most one subscription. Subscriptions are never deleted;
//! disabling clears `active` and keeps the row for history. Writes here only
//! touch preferences; the daily delivery counter belongs to the pipeline, so
//! every write returns the stored row with its current counter.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{ChannelPreference, QuietHours, Subscription};

use crate::store::SubscriptionStore;

/// Daily cap applied when a request omits one.
pub const DEFAULT_FREQUENCY_CAP: u32 = 50;

/// Upper bound accepted for `frequency_cap`.
const MAX_FREQUENCY_CAP: u32 = 10_000;

/// Parameters for creating a subscription.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateSubscriptionParams {
    pub device_channels: Vec<ChannelPreference>,
    #[serde(default)]
    pub category_filters: Vec<String>,
    #[serde(default)]
    pub instrument_filters: Vec<String>,
    #[serde(default)]
    pub sector_filters: Vec<String>,
    #[serde(default = "default_frequency_cap")]
    pub frequency_cap: u32,
    #[serde(default)]
    pub quiet_hours: Option<QuietHours>,
}

fn default_frequency_cap() -> u32 {
    DEFAULT_FREQUENCY_CAP
}

/// Parameters for updating a subscription. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateSubscriptionParams {
    pub device_channels: Option<Vec<ChannelPreference>>,
    pub category_filters: Option<Vec<String>>,
    pub instrument_filters: Option<Vec<String>>,
    pub sector_filters: Option<Vec<String>>,
    pub frequency_cap: Option<u32>,
    pub quiet_hours: Option<QuietHours>,
    /// Remove quiet hours entirely.
    #[serde(default)]
    pub clear_quiet_hours: bool,
    pub active: Option<bool>,
}

/// Service layer over a [`SubscriptionStore`].
#[derive(Clone)]
pub struct SubscriptionService {
    store: Arc<dyn SubscriptionStore>,
}

impl SubscriptionService {
    pub fn new(store: Arc<dyn SubscriptionStore>) -> Self {
        Self { store }
    }

    /// Create the user's subscription. A previously disabled subscription is
    /// reactivated with the new settings; an active one is a conflict.
    pub async fn create(
        &self,
        user_id: Uuid,
        params: CreateSubscriptionParams,
    ) -> Result<Subscription, AppError> {
        validate_channels(&params.device_channels)?;
        validate_cap(params.frequency_cap)?;

        let existing = self.store.get(user_id).await?;
        if existing.as_ref().is_some_and(|s| s.active) {
            return Err(AppError::Validation(format!(
                "User {} already has an active subscription",
                user_id
            )));
        }

        let now = Utc::now();
        let subscription = Subscription {
            id: existing.as_ref().map(|s| s.id).unwrap_or_else(Uuid::new_v4),
            user_id,
            device_channels: params.device_channels,
            category_filters: normalize(params.category_filters),
            instrument_filters: normalize(params.instrument_filters),
            sector_filters: normalize(params.sector_filters),
            frequency_cap: params.frequency_cap,
            quiet_hours: params.quiet_hours,
            delivered_today_count: existing.as_ref().map_or(0, |s| s.delivered_today_count),
            count_date: existing.as_ref().and_then(|s| s.count_date),
            active: true,
            created_at: existing.as_ref().map_or(now, |s| s.created_at),
            updated_at: now,
        };

        self.store.put(subscription.clone()).await?;

        tracing::info!(
            subscription_id = %subscription.id,
            user_id = %user_id,
            channels = subscription.device_channels.len(),
            "Subscription created"
        );

        self.get(user_id).await
    }

    pub async fn get(&self, user_id: Uuid) -> Result<Subscription, AppError> {
        self.store
            .get(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("No subscription for user {}", user_id)))
    }

    pub async fn update(
        &self,
        user_id: Uuid,
        params: UpdateSubscriptionParams,
    ) -> Result<Subscription, AppError> {
        let mut subscription = self.get(user_id).await?;

        if let Some(channels) = params.device_channels {
            validate_channels(&channels)?;
            subscription.device_channels = channels;
        }
        if let Some(categories) = params.category_filters {
            subscription.category_filters = normalize(categories);
        }
        if let Some(instruments) = params.instrument_filters {
            subscription.instrument_filters = normalize(instruments);
        }
        if let Some(sectors) = params.sector_filters {
            subscription.sector_filters = normalize(sectors);
        }
        if let Some(cap) = params.frequency_cap {
            validate_cap(cap)?;
            subscription.frequency_cap = cap;
        }
        if params.clear_quiet_hours {
            subscription.quiet_hours = None;
        } else if let Some(quiet) = params.quiet_hours {
            subscription.quiet_hours = Some(quiet);
        }
        if let Some(active) = params.active {
            subscription.active = active;
        }
        subscription.updated_at = Utc::now();

        self.store.put(subscription.clone()).await?;

        tracing::info!(
            subscription_id = %subscription.id,
            user_id = %user_id,
            active = subscription.active,
            "Subscription updated"
        );

        self.get(user_id).await
    }

    /// Soft-disable the user's subscription.
    pub async fn disable(&self, user_id: Uuid) -> Result<Subscription, AppError> {
        let mut subscription = self.get(user_id).await?;
        if subscription.active {
            subscription.active = false;
            subscription.updated_at = Utc::now();
            self.store.put(subscription.clone()).await?;
            tracing::info!(subscription_id = %subscription.id, user_id = %user_id, "Subscription disabled");
            return self.get(user_id).await;
        }
        Ok(subscription)
    }
}

fn validate_channels(channels: &[ChannelPreference]) -> Result<(), AppError> {
    let mut seen = HashSet::new();
    for pref in channels {
        if pref.channel.as_str().trim().is_empty() {
            return Err(AppError::Validation("Channel id must not be empty".into()));
        }
        if !seen.insert(pref.channel.as_str()) {
            return Err(AppError::Validation(format!(
                "Channel '{}' listed more than once",
                pref.channel
            )));
        }
    }
    Ok(())
}

fn validate_cap(cap: u32) -> Result<(), AppError> {
    if cap == 0 || cap > MAX_FREQUENCY_CAP {
        return Err(AppError::Validation(format!(
            "frequency_cap must be between 1 and {}",
            MAX_FREQUENCY_CAP
        )));
    }
    Ok(())
}

/// Trim entries, drop empties and duplicates, keep first-seen order.
fn normalize(values: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(values.len());
    for value in values {
        let value = value.trim();
        if !value.is_empty() && !out.iter().any(|v| v == value) {
            out.push(value.to_string());
        }
    }
    out
}
