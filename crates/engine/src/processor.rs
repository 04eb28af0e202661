//! Event processing pipeline.
//!
//! Three stages connected by bounded channels:
//! 1. Rules: evaluate each event, emit candidate notifications
//! 2. Match: hold scheduled candidates until due, drop expired ones, resolve
//!    delivery targets and claim a daily cap slot per recipient
//! 3. Dispatch: hand candidate + targets to the dispatcher, persist the
//!    resulting records, feed analytics and hand back slots that did not end
//!    in a delivery
//!
//! A full downstream queue blocks the upstream stage. The dispatch stage runs
//! at most `capacity` dispatches concurrently. Cap slots are claimed before
//! dispatch, so overlapping dispatches for one user never exceed the cap.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use herald_common::types::{CandidateNotification, DeliveryRecord, DeliveryTarget, Event};

use crate::analytics::AnalyticsAggregator;
use crate::matcher::SubscriptionMatcher;
use crate::rules::RuleEngine;
use crate::store::{DeliveryLog, SubscriptionStore};

/// How often the match stage releases scheduled candidates that became due.
const SCHEDULE_POLL: Duration = Duration::from_secs(1);

/// Final delivery stage. Implemented by the notifier's dispatcher.
#[async_trait]
pub trait Dispatch: Send + Sync {
    /// Deliver `candidate` to every target, returning a record for every attempt.
    async fn dispatch(
        &self,
        candidate: &CandidateNotification,
        targets: Vec<DeliveryTarget>,
    ) -> Vec<DeliveryRecord>;
}

/// Whether a user has an open live connection. Backs `online_only` targeting.
pub trait Presence: Send + Sync {
    fn is_online(&self, user_id: Uuid) -> bool;
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("event pipeline is shut down")]
    Closed,
}

/// Cloneable entry point into a running pipeline.
#[derive(Clone)]
pub struct PipelineHandle {
    events: mpsc::Sender<Event>,
}

impl PipelineHandle {
    /// Queue an event. Waits while the rule stage is saturated.
    pub async fn submit(&self, event: Event) -> Result<(), PipelineError> {
        self.events.send(event).await.map_err(|_| PipelineError::Closed)
    }

    /// Remaining capacity of the intake queue.
    pub fn available_capacity(&self) -> usize {
        self.events.capacity()
    }
}

/// Join handles of the stage tasks. Stages exit once every handle is dropped.
pub struct PipelineTasks {
    handles: Vec<JoinHandle<()>>,
}

impl PipelineTasks {
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Pipeline stage panicked");
            }
        }
    }
}

/// Targets of one candidate and the cap slots claimed for them on `date`.
struct Route {
    targets: Vec<DeliveryTarget>,
    reserved: Vec<Uuid>,
    date: NaiveDate,
}

/// Central event processor that owns the pipeline collaborators.
pub struct EventProcessor {
    rules: Arc<RuleEngine>,
    matcher: SubscriptionMatcher,
    subscriptions: Arc<dyn SubscriptionStore>,
    log: Arc<dyn DeliveryLog>,
    analytics: Arc<AnalyticsAggregator>,
    dispatcher: Arc<dyn Dispatch>,
    presence: Option<Arc<dyn Presence>>,
    scheduled: Mutex<BTreeMap<(DateTime<Utc>, Uuid), CandidateNotification>>,
    local_offset: FixedOffset,
}

impl EventProcessor {
    pub fn new(
        rules: Arc<RuleEngine>,
        matcher: SubscriptionMatcher,
        subscriptions: Arc<dyn SubscriptionStore>,
        log: Arc<dyn DeliveryLog>,
        analytics: Arc<AnalyticsAggregator>,
        dispatcher: Arc<dyn Dispatch>,
    ) -> Self {
        let local_offset = matcher.policy().local_offset;
        Self {
            rules,
            matcher,
            subscriptions,
            log,
            analytics,
            dispatcher,
            presence: None,
            scheduled: Mutex::new(BTreeMap::new()),
            local_offset,
        }
    }

    /// Source of truth for `online_only` candidates. Without one, such
    /// candidates reach nobody.
    pub fn with_presence(mut self, presence: Arc<dyn Presence>) -> Self {
        self.presence = Some(presence);
        self
    }

    /// Run one event through every stage inline and return the delivery records.
    /// Candidates scheduled for later are held; see [`Self::process_due`].
    pub async fn process_event(&self, event: &Event) -> Vec<DeliveryRecord> {
        let now = Utc::now();
        let mut records = Vec::new();
        for candidate in self.rules.evaluate(event) {
            records.extend(self.process_candidate(&candidate, now).await);
        }
        records
    }

    /// Route and deliver every held candidate due at `now`.
    pub async fn process_due(&self, now: DateTime<Utc>) -> Vec<DeliveryRecord> {
        let mut records = Vec::new();
        for candidate in self.take_due(now) {
            records.extend(self.process_candidate(&candidate, now).await);
        }
        records
    }

    /// Number of candidates waiting for their scheduled time.
    pub fn scheduled_count(&self) -> usize {
        self.scheduled.lock().len()
    }

    async fn process_candidate(
        &self,
        candidate: &CandidateNotification,
        now: DateTime<Utc>,
    ) -> Vec<DeliveryRecord> {
        match self.route(candidate, now).await {
            Some(route) => self.deliver(candidate, route).await,
            None => Vec::new(),
        }
    }

    fn hold(&self, candidate: &CandidateNotification) {
        let Some(at) = candidate.schedule_at else {
            return;
        };
        tracing::debug!(candidate_id = %candidate.id, schedule_at = %at, "Candidate scheduled");
        self.scheduled
            .lock()
            .insert((at, candidate.id), candidate.clone());
    }

    fn take_due(&self, now: DateTime<Utc>) -> Vec<CandidateNotification> {
        let mut scheduled = self.scheduled.lock();
        let mut due = Vec::new();
        while let Some(entry) = scheduled.first_entry() {
            if entry.key().0 > now {
                break;
            }
            due.push(entry.remove());
        }
        due
    }

    /// Resolve targets for a candidate and claim cap slots for its recipients.
    /// `None` when there is nothing to send now.
    async fn route(&self, candidate: &CandidateNotification, now: DateTime<Utc>) -> Option<Route> {
        if candidate.is_expired(now) {
            tracing::debug!(candidate_id = %candidate.id, "Dropping expired candidate");
            return None;
        }
        if !candidate.is_due(now) {
            self.hold(candidate);
            return None;
        }

        let subscriptions = match self.subscriptions.list_active().await {
            Ok(subs) => subs,
            Err(e) => {
                tracing::warn!(
                    candidate_id = %candidate.id,
                    error = %e,
                    "Failed to load subscriptions, candidate dropped"
                );
                return None;
            }
        };

        let mut targets = self.matcher.resolve(candidate, &subscriptions, now);
        if candidate.online_only() {
            let presence = self.presence.as_deref();
            targets.retain(|t| presence.is_some_and(|p| p.is_online(t.user_id)));
        }
        if targets.is_empty() {
            return None;
        }

        let limits: HashMap<Uuid, u32> = subscriptions
            .iter()
            .map(|s| (s.user_id, self.matcher.daily_limit(candidate, s)))
            .collect();
        let date = now.with_timezone(&self.local_offset).date_naive();

        let mut seen = HashSet::new();
        let mut reserved = Vec::new();
        for user_id in targets.iter().map(|t| t.user_id) {
            if !seen.insert(user_id) {
                continue;
            }
            let cap = limits.get(&user_id).copied().unwrap_or(0);
            match self.subscriptions.try_reserve_delivery(user_id, date, cap).await {
                Ok(true) => reserved.push(user_id),
                Ok(false) => {
                    tracing::trace!(candidate_id = %candidate.id, user_id = %user_id, "Daily cap reached");
                }
                Err(e) => {
                    tracing::warn!(user_id = %user_id, error = %e, "Failed to reserve delivery slot");
                }
            }
        }

        let granted: HashSet<Uuid> = reserved.iter().copied().collect();
        targets.retain(|t| granted.contains(&t.user_id));
        if targets.is_empty() {
            return None;
        }
        Some(Route {
            targets,
            reserved,
            date,
        })
    }

    async fn release(&self, users: impl Iterator<Item = Uuid>, date: NaiveDate) {
        for user_id in users {
            if let Err(e) = self.subscriptions.release_delivery(user_id, date).await {
                tracing::warn!(user_id = %user_id, error = %e, "Failed to release delivery slot");
            }
        }
    }

    /// Dispatch and record the outcome.
    async fn deliver(&self, candidate: &CandidateNotification, route: Route) -> Vec<DeliveryRecord> {
        let Route {
            targets,
            reserved,
            date,
        } = route;

        if candidate.is_expired(Utc::now()) {
            tracing::debug!(candidate_id = %candidate.id, "Candidate expired before dispatch");
            self.release(reserved.into_iter(), date).await;
            return Vec::new();
        }

        let records = self.dispatcher.dispatch(candidate, targets).await;

        if let Err(e) = self.log.append(&records).await {
            tracing::warn!(
                message_id = %candidate.id,
                error = %e,
                "Failed to persist delivery records"
            );
        }
        self.analytics.ingest(&records);

        let reached: HashSet<_> = records
            .iter()
            .filter(|r| r.delivered)
            .map(|r| r.user_id)
            .collect();
        self.release(reserved.into_iter().filter(|u| !reached.contains(u)), date)
            .await;

        tracing::info!(
            message_id = %candidate.id,
            rule_id = %candidate.rule_id,
            records = records.len(),
            users_reached = reached.len(),
            "Candidate dispatched"
        );

        records
    }

    /// Start the stage tasks. `capacity` bounds every inter-stage queue and
    /// the number of in-flight dispatches.
    pub fn spawn(self, capacity: usize) -> (PipelineHandle, PipelineTasks) {
        let capacity = capacity.max(1);
        let processor = Arc::new(self);

        let (event_tx, mut event_rx) = mpsc::channel::<Event>(capacity);
        let (candidate_tx, mut candidate_rx) = mpsc::channel::<CandidateNotification>(capacity);
        let (routed_tx, mut routed_rx) = mpsc::channel::<(CandidateNotification, Route)>(capacity);

        let rules = processor.rules.clone();
        let rule_stage = tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                let candidates = rules.evaluate(&event);
                tracing::debug!(
                    event_id = %event.id,
                    kind = %event.kind,
                    candidates = candidates.len(),
                    "Event evaluated"
                );
                for candidate in candidates {
                    if candidate_tx.send(candidate).await.is_err() {
                        return;
                    }
                }
            }
            tracing::debug!("Rule stage stopped");
        });

        let matcher = processor.clone();
        let match_stage = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SCHEDULE_POLL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                let candidates = tokio::select! {
                    received = candidate_rx.recv() => match received {
                        Some(candidate) => vec![candidate],
                        None => break,
                    },
                    _ = ticker.tick() => matcher.take_due(Utc::now()),
                };
                for candidate in candidates {
                    let Some(route) = matcher.route(&candidate, Utc::now()).await else {
                        continue;
                    };
                    if routed_tx.send((candidate, route)).await.is_err() {
                        return;
                    }
                }
            }
            let pending = matcher.scheduled_count();
            if pending > 0 {
                tracing::warn!(pending, "Scheduled candidates dropped at shutdown");
            }
            tracing::debug!("Match stage stopped");
        });

        let dispatcher = processor;
        let in_flight = Arc::new(Semaphore::new(capacity));
        let dispatch_stage = tokio::spawn(async move {
            while let Some((candidate, route)) = routed_rx.recv().await {
                let Ok(permit) = in_flight.clone().acquire_owned().await else {
                    return;
                };
                let processor = dispatcher.clone();
                tokio::spawn(async move {
                    processor.deliver(&candidate, route).await;
                    drop(permit);
                });
            }
            // wait for outstanding dispatches
            let _ = in_flight.acquire_many(capacity as u32).await;
            tracing::debug!("Dispatch stage stopped");
        });

        (
            PipelineHandle { events: event_tx },
            PipelineTasks {
                handles: vec![rule_stage, match_stage, dispatch_stage],
            },
        )
    }
}
