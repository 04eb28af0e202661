//! End-to-end delivery scenarios: engine pipeline, dispatcher and the live channel
//! wired together over in-memory storage.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{FixedOffset, Utc};
use serde_json::json;
use uuid::Uuid;

use herald_common::types::{Channel, ChannelPreference, Event, EventKind};
use herald_engine::analytics::AnalyticsAggregator;
use herald_engine::matcher::{MatchPolicy, SubscriptionMatcher};
use herald_engine::processor::EventProcessor;
use herald_engine::rules::{RuleEngine, compile_rules, default_rule_specs};
use herald_engine::store::{DeliveryLog, MemoryStore};
use herald_engine::subscription::{
    CreateSubscriptionParams, SubscriptionService, UpdateSubscriptionParams,
};
use herald_engine::template::TemplateStore;
use herald_notifier::dispatcher::{Dispatcher, DispatcherConfig};
use herald_notifier::frame::FrameType;
use herald_notifier::live::LiveChannelAdapter;
use herald_notifier::registry::{ConnectionRegistry, ConnectionState};

struct Harness {
    store: Arc<MemoryStore>,
    registry: Arc<ConnectionRegistry>,
    analytics: Arc<AnalyticsAggregator>,
    processor: EventProcessor,
}

fn harness() -> Harness {
    let offset = FixedOffset::east_opt(0).unwrap();
    let store = Arc::new(MemoryStore::new());
    let templates = TemplateStore::with_defaults();
    let rules = compile_rules(default_rule_specs(), &templates).unwrap();
    let registry = Arc::new(ConnectionRegistry::new(Duration::from_secs(30), 16));
    let analytics = Arc::new(AnalyticsAggregator::new(offset));

    let mut dispatcher = Dispatcher::new(
        templates,
        store.clone(),
        DispatcherConfig {
            retry_delay: Duration::from_millis(5),
            ..DispatcherConfig::default()
        },
    );
    dispatcher.register(Arc::new(LiveChannelAdapter::new(registry.clone())), None);

    let processor = EventProcessor::new(
        Arc::new(RuleEngine::new(rules, offset)),
        SubscriptionMatcher::new(MatchPolicy::default()),
        store.clone(),
        store.clone(),
        analytics.clone(),
        Arc::new(dispatcher),
    );

    Harness {
        store,
        registry,
        analytics,
        processor,
    }
}

async fn subscribe_live(store: Arc<MemoryStore>, categories: &[&str]) -> Uuid {
    let user_id = Uuid::new_v4();
    SubscriptionService::new(store)
        .create(
            user_id,
            CreateSubscriptionParams {
                device_channels: vec![ChannelPreference {
                    channel: Channel::live(),
                    enabled: true,
                }],
                category_filters: categories.iter().map(|c| c.to_string()).collect(),
                instrument_filters: vec![],
                sector_filters: vec![],
                frequency_cap: 50,
                quiet_hours: None,
            },
        )
        .await
        .unwrap();
    user_id
}

fn breaking_news(relevance: f64) -> Event {
    Event::new(
        EventKind::News,
        json!({
            "relevance": relevance,
            "categories": ["breaking"],
            "stock_name": "ACME",
            "title": "ACME beats estimates",
            "summary": "Quarterly revenue up 40%",
        }),
    )
}

#[tokio::test]
async fn test_breaking_news_reaches_open_connection() {
    let h = harness();
    let user = subscribe_live(h.store.clone(), &["news"]).await;
    let mut conn = h.registry.register(user);
    assert!(h.registry.open(conn.id));

    let records = h.processor.process_event(&breaking_news(0.9)).await;
    assert_eq!(records.len(), 1);
    assert!(records[0].delivered);
    assert_eq!(records[0].channel, Channel::live());

    let frame = conn.outbound.recv().await.unwrap();
    assert_eq!(frame.kind, FrameType::Notification);
    assert_eq!(frame.data["title"], "Breaking: ACME");
    assert_eq!(frame.data["message_id"], records[0].message_id.to_string());

    let stored = h.store.since(Utc::now() - chrono::Duration::minutes(1)).await.unwrap();
    assert_eq!(stored.len(), 1);

    let day = h.analytics.daily(1, Utc::now().date_naive()).remove(0);
    assert_eq!(day.total_sent, 1);
    assert_eq!(day.category_counts.get("news"), Some(&1));
}

#[tokio::test]
async fn test_low_relevance_news_sends_nothing() {
    let h = harness();
    let user = subscribe_live(h.store.clone(), &["news"]).await;
    let mut conn = h.registry.register(user);
    h.registry.open(conn.id);

    let records = h.processor.process_event(&breaking_news(0.5)).await;
    assert!(records.is_empty());
    assert!(conn.outbound.try_recv().is_err());
}

#[tokio::test]
async fn test_missed_heartbeat_closes_connection() {
    let h = harness();
    let user = subscribe_live(h.store.clone(), &["news"]).await;
    let mut conn = h.registry.register(user);
    h.registry.open(conn.id);

    // no client traffic for longer than two heartbeat intervals
    let later = Instant::now() + h.registry.heartbeat_timeout() + Duration::from_secs(1);
    let closed = h.registry.sweep_at(later);
    assert_eq!(closed, vec![conn.id]);
    assert_eq!(h.registry.state(conn.id), ConnectionState::Closed);
    assert!(h.registry.connections_for(user).is_empty());
    assert!(*conn.closed.borrow_and_update());

    let records = h.processor.process_event(&breaking_news(0.95)).await;
    assert_eq!(records.len(), 1);
    assert!(!records[0].delivered);
    assert_eq!(records[0].failure_reason.as_deref(), Some("no_connection"));
    assert!(conn.outbound.try_recv().is_err());

    // an offline user keeps the live channel
    let sub = SubscriptionService::new(h.store.clone()).get(user).await.unwrap();
    assert!(sub.device_channels[0].enabled);
}

#[tokio::test]
async fn test_every_connection_of_user_receives_frame() {
    let h = harness();
    let user = subscribe_live(h.store.clone(), &["news"]).await;
    let mut phone = h.registry.register(user);
    let mut laptop = h.registry.register(user);
    h.registry.open(phone.id);
    h.registry.open(laptop.id);

    let records = h.processor.process_event(&breaking_news(0.9)).await;
    assert_eq!(records.len(), 1, "one record per (user, channel)");

    assert_eq!(phone.outbound.recv().await.unwrap().kind, FrameType::Notification);
    assert_eq!(laptop.outbound.recv().await.unwrap().kind, FrameType::Notification);
}

#[tokio::test]
async fn test_capped_subscriber_gets_one_more() {
    let h = harness();
    let user = subscribe_live(h.store.clone(), &["news"]).await;
    SubscriptionService::new(h.store.clone())
        .update(
            user,
            UpdateSubscriptionParams {
                frequency_cap: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let conn = h.registry.register(user);
    h.registry.open(conn.id);

    let mut delivered = 0;
    for _ in 0..4 {
        delivered += h
            .processor
            .process_event(&breaking_news(0.9))
            .await
            .iter()
            .filter(|r| r.delivered)
            .count();
    }
    assert_eq!(delivered, 2);
}

#[tokio::test]
async fn test_pipelined_events_respect_cap() {
    let h = harness();
    let user = subscribe_live(h.store.clone(), &["news"]).await;
    SubscriptionService::new(h.store.clone())
        .update(
            user,
            UpdateSubscriptionParams {
                frequency_cap: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let mut conn = h.registry.register(user);
    h.registry.open(conn.id);

    // several events in flight at once through the spawned stages
    let (handle, tasks) = h.processor.spawn(8);
    for _ in 0..5 {
        handle.submit(breaking_news(0.9)).await.unwrap();
    }
    drop(handle);
    tokio::time::timeout(Duration::from_secs(5), tasks.join())
        .await
        .unwrap();

    let mut frames = 0;
    while let Ok(frame) = conn.outbound.try_recv() {
        assert_eq!(frame.kind, FrameType::Notification);
        frames += 1;
    }
    assert_eq!(frames, 1);

    let sub = SubscriptionService::new(h.store.clone()).get(user).await.unwrap();
    assert_eq!(sub.delivered_today_count, 1);
}

#[tokio::test]
async fn test_fan_out_beyond_queue_capacity_is_delivered() {
    let h = harness();
    // more recipients than the default 512-slot live queue
    let mut connections = Vec::new();
    for _ in 0..600 {
        let user = subscribe_live(h.store.clone(), &["news"]).await;
        let conn = h.registry.register(user);
        h.registry.open(conn.id);
        connections.push(conn);
    }

    let records = h.processor.process_event(&breaking_news(0.9)).await;
    assert_eq!(records.len(), 600);
    assert!(
        records
            .iter()
            .all(|r| r.failure_reason.as_deref() != Some("rate_limited"))
    );
    assert!(records.iter().all(|r| r.delivered));

    for conn in &mut connections {
        assert_eq!(conn.outbound.try_recv().unwrap().kind, FrameType::Notification);
    }
}
