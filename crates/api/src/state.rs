//! Shared application state for the Axum API server, and the wiring that
//! builds the dispatch pipeline behind it.

use std::sync::Arc;
use std::time::Duration;

use chrono::FixedOffset;
use sqlx::PgPool;

use herald_common::config::AppConfig;
use herald_common::types::Channel;
use herald_engine::analytics::AnalyticsAggregator;
use herald_engine::matcher::{MatchPolicy, SubscriptionMatcher};
use herald_engine::postgres::PgStore;
use herald_engine::processor::{EventProcessor, PipelineHandle, PipelineTasks};
use herald_engine::rules::{RuleEngine, RuleSpec, compile_rules};
use herald_engine::store::{DeliveryLog, MemoryStore, SubscriptionStore};
use herald_engine::subscription::SubscriptionService;
use herald_engine::template::TemplateStore;
use herald_notifier::dispatcher::{Dispatcher, DispatcherConfig};
use herald_notifier::live::LiveChannelAdapter;
use herald_notifier::rate_limit::TokenBucket;
use herald_notifier::registry::ConnectionRegistry;
use herald_notifier::webhook::WebhookAdapter;

/// Subscription and delivery-log backends.
#[derive(Clone)]
pub struct Storage {
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub delivery_log: Arc<dyn DeliveryLog>,
}

impl Storage {
    pub fn memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            subscriptions: store.clone(),
            delivery_log: store,
        }
    }

    pub fn postgres(pool: PgPool) -> Self {
        let store = Arc::new(PgStore::new(pool));
        Self {
            subscriptions: store.clone(),
            delivery_log: store,
        }
    }
}

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub local_offset: FixedOffset,
    pub subscriptions: SubscriptionService,
    pub delivery_log: Arc<dyn DeliveryLog>,
    pub analytics: Arc<AnalyticsAggregator>,
    pub rules: Arc<RuleEngine>,
    pub templates: TemplateStore,
    pub registry: Arc<ConnectionRegistry>,
    pub pipeline: PipelineHandle,
}

impl AppState {
    /// Compile the rules, start one worker per configured channel and spawn
    /// the pipeline stages.
    ///
    /// Fails on a malformed rule set or webhook client, before anything is
    /// listening.
    pub fn build(
        config: AppConfig,
        storage: Storage,
        templates: TemplateStore,
        rule_specs: Vec<RuleSpec>,
    ) -> anyhow::Result<(Self, PipelineTasks)> {
        let local_offset = config.local_offset()?;
        let rules = Arc::new(RuleEngine::new(
            compile_rules(rule_specs, &templates)?,
            local_offset,
        ));

        let registry = Arc::new(ConnectionRegistry::new(
            Duration::from_secs(config.heartbeat_interval_secs.max(1)),
            config.channel_queue_capacity,
        ));

        let mut dispatcher = Dispatcher::new(
            templates.clone(),
            storage.subscriptions.clone(),
            DispatcherConfig::from(&config),
        );
        dispatcher.register(Arc::new(LiveChannelAdapter::new(registry.clone())), None);

        if let Some(url) = &config.push_webhook_url {
            let adapter = WebhookAdapter::new(Channel::new("push"), url.as_str())?;
            dispatcher.register(
                Arc::new(adapter),
                Some(TokenBucket::per_minute(config.push_rate_per_minute)),
            );
        }
        if let Some(url) = &config.email_webhook_url {
            let adapter = WebhookAdapter::new(Channel::new("email"), url.as_str())?;
            dispatcher.register(
                Arc::new(adapter),
                Some(TokenBucket::per_minute(config.email_rate_per_minute)),
            );
        }
        tracing::info!(channels = ?dispatcher.channels(), "Delivery channels configured");

        let analytics = Arc::new(AnalyticsAggregator::new(local_offset));
        let matcher = SubscriptionMatcher::new(MatchPolicy {
            urgent_bypasses_frequency_cap: config.urgent_bypasses_frequency_cap,
            local_offset,
        });

        let processor = EventProcessor::new(
            rules.clone(),
            matcher,
            storage.subscriptions.clone(),
            storage.delivery_log.clone(),
            analytics.clone(),
            Arc::new(dispatcher),
        )
        .with_presence(registry.clone());
        let (pipeline, tasks) = processor.spawn(config.pipeline_queue_capacity);

        let state = Self {
            local_offset,
            subscriptions: SubscriptionService::new(storage.subscriptions),
            delivery_log: storage.delivery_log,
            analytics,
            rules,
            templates,
            registry,
            pipeline,
            config,
        };
        Ok((state, tasks))
    }
}
