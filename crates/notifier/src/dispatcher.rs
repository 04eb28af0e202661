//! Delivery dispatcher: fans a candidate out to its targets' channels.
//!
//! Each registered channel gets one worker task fed by a bounded queue:
//! 1. The worker paces sends with the channel's token bucket
//! 2. A transient failure is re-queued after `retry_delay` as a new attempt,
//!    up to `max_retries` extra attempts
//! 3. A permanent failure is final; after `permanent_failure_threshold` in a
//!    row for the same user, the channel is disabled on their subscription
//!
//! Queues of unthrottled channels apply backpressure: enqueueing waits for
//! room. A throttled channel's queue absorbs sends while its bucket is empty
//! and drops past capacity, recording the send as `rate_limited`.
//! Every attempt produces a [`DeliveryRecord`]; the last one of a target
//! carries its final attempt number.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::join_all;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use herald_common::config::AppConfig;
use herald_common::types::{
    CandidateNotification, Channel, DeliveryRecord, DeliveryTarget, RenderedMessage,
};
use herald_engine::processor::Dispatch;
use herald_engine::store::SubscriptionStore;
use herald_engine::template::TemplateStore;

use crate::adapter::{ChannelAdapter, FailureClass, SendOutcome, reason};
use crate::rate_limit::TokenBucket;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Capacity of each channel's send queue.
    pub queue_capacity: usize,
    pub retry_delay: Duration,
    /// Extra attempts after the first transient failure.
    pub max_retries: u32,
    pub permanent_failure_threshold: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 512,
            retry_delay: Duration::from_millis(500),
            max_retries: 2,
            permanent_failure_threshold: 3,
        }
    }
}

impl From<&AppConfig> for DispatcherConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            queue_capacity: config.channel_queue_capacity.max(1),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            max_retries: config.max_retries,
            permanent_failure_threshold: config.permanent_failure_threshold.max(1),
        }
    }
}

/// One target's trip through a channel worker, including retries.
struct SendJob {
    target: DeliveryTarget,
    message: Arc<RenderedMessage>,
    attempt: u32,
    history: Vec<DeliveryRecord>,
    reply: oneshot::Sender<Vec<DeliveryRecord>>,
}

impl SendJob {
    fn finish(self) {
        // the dispatch call may have been dropped; nothing left to tell
        let _ = self.reply.send(self.history);
    }
}

fn record(
    target: &DeliveryTarget,
    message: &RenderedMessage,
    attempt: u32,
    outcome: &SendOutcome,
) -> DeliveryRecord {
    DeliveryRecord {
        message_id: message.message_id,
        user_id: target.user_id,
        channel: target.channel.clone(),
        category: message.category.clone(),
        priority: message.priority,
        attempt,
        sent_at: Utc::now(),
        delivered: outcome.delivered,
        read: false,
        clicked: false,
        failure_reason: outcome.reason.clone(),
    }
}

/// Send side of one channel worker.
struct ChannelQueue {
    jobs: mpsc::Sender<SendJob>,
    /// Paced by a token bucket; a full queue drops instead of waiting.
    throttled: bool,
}

impl ChannelQueue {
    async fn enqueue(&self, job: SendJob) -> Result<(), TrySendError<SendJob>> {
        if self.throttled {
            self.jobs.try_send(job)
        } else {
            self.jobs
                .send(job)
                .await
                .map_err(|e| TrySendError::Closed(e.0))
        }
    }
}

pub struct Dispatcher {
    templates: TemplateStore,
    subscriptions: Arc<dyn SubscriptionStore>,
    config: DispatcherConfig,
    queues: HashMap<Channel, ChannelQueue>,
}

impl Dispatcher {
    pub fn new(
        templates: TemplateStore,
        subscriptions: Arc<dyn SubscriptionStore>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            templates,
            subscriptions,
            config,
            queues: HashMap::new(),
        }
    }

    /// Register an adapter and start its worker. A second adapter for the same
    /// channel replaces the first.
    pub fn register(&mut self, adapter: Arc<dyn ChannelAdapter>, limiter: Option<TokenBucket>) {
        let channel = adapter.channel();
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let throttled = limiter.is_some();

        let worker = ChannelWorker {
            channel: channel.clone(),
            adapter,
            limiter,
            jobs: rx,
            requeue: tx.downgrade(),
            config: self.config.clone(),
            subscriptions: self.subscriptions.clone(),
            permanent_failures: HashMap::new(),
        };
        tokio::spawn(worker.run());

        tracing::info!(
            channel = %channel,
            queue_capacity = self.config.queue_capacity,
            throttled,
            "Channel worker started"
        );
        self.queues.insert(
            channel,
            ChannelQueue {
                jobs: tx,
                throttled,
            },
        );
    }

    pub fn channels(&self) -> Vec<Channel> {
        let mut channels: Vec<_> = self.queues.keys().cloned().collect();
        channels.sort();
        channels
    }

    /// Send an already rendered message to every target.
    pub async fn send_rendered(
        &self,
        message: Arc<RenderedMessage>,
        targets: Vec<DeliveryTarget>,
    ) -> Vec<DeliveryRecord> {
        let mut records = Vec::with_capacity(targets.len());
        let mut pending = Vec::with_capacity(targets.len());

        for target in targets {
            let Some(queue) = self.queues.get(&target.channel) else {
                tracing::warn!(channel = %target.channel, "No adapter for channel");
                records.push(record(
                    &target,
                    &message,
                    1,
                    &SendOutcome::failed(reason::UNSUPPORTED_CHANNEL),
                ));
                continue;
            };

            let (reply, rx) = oneshot::channel();
            let job = SendJob {
                target: target.clone(),
                message: message.clone(),
                attempt: 1,
                history: Vec::new(),
                reply,
            };

            match queue.enqueue(job).await {
                Ok(()) => pending.push((target, rx)),
                Err(TrySendError::Full(job)) => {
                    tracing::warn!(
                        channel = %job.target.channel,
                        user_id = %job.target.user_id,
                        message_id = %message.message_id,
                        "Throttled channel queue full, send dropped"
                    );
                    records.push(record(
                        &job.target,
                        &message,
                        1,
                        &SendOutcome::failed(reason::RATE_LIMITED),
                    ));
                }
                Err(TrySendError::Closed(job)) => {
                    records.push(record(
                        &job.target,
                        &message,
                        1,
                        &SendOutcome::failed(reason::UNAVAILABLE),
                    ));
                }
            }
        }

        let (targets, receivers): (Vec<_>, Vec<_>) = pending.into_iter().unzip();
        for (target, result) in targets.iter().zip(join_all(receivers).await) {
            match result {
                Ok(history) => records.extend(history),
                Err(_) => records.push(record(
                    target,
                    &message,
                    1,
                    &SendOutcome::failed(reason::UNAVAILABLE),
                )),
            }
        }

        records
    }
}

#[async_trait]
impl Dispatch for Dispatcher {
    async fn dispatch(
        &self,
        candidate: &CandidateNotification,
        targets: Vec<DeliveryTarget>,
    ) -> Vec<DeliveryRecord> {
        match self.templates.render(candidate) {
            Ok(message) => self.send_rendered(Arc::new(message), targets).await,
            Err(e) => {
                tracing::warn!(
                    candidate_id = %candidate.id,
                    template_id = %candidate.template_id,
                    error = %e,
                    "Cannot render candidate"
                );
                let placeholder = RenderedMessage {
                    message_id: candidate.id,
                    title: String::new(),
                    body: String::new(),
                    priority: candidate.priority,
                    category: candidate.primary_category().map(str::to_string),
                    data: serde_json::Value::Null,
                };
                let failed = SendOutcome::failed(reason::TEMPLATE_NOT_FOUND);
                targets
                    .iter()
                    .map(|t| record(t, &placeholder, 1, &failed))
                    .collect()
            }
        }
    }
}

struct ChannelWorker {
    channel: Channel,
    adapter: Arc<dyn ChannelAdapter>,
    limiter: Option<TokenBucket>,
    jobs: mpsc::Receiver<SendJob>,
    requeue: mpsc::WeakSender<SendJob>,
    config: DispatcherConfig,
    subscriptions: Arc<dyn SubscriptionStore>,
    /// Consecutive permanent failures per user on this channel.
    permanent_failures: HashMap<Uuid, u32>,
}

impl ChannelWorker {
    async fn run(mut self) {
        while let Some(job) = self.jobs.recv().await {
            self.handle(job).await;
        }
        tracing::debug!(channel = %self.channel, "Channel worker stopped");
    }

    async fn handle(&mut self, mut job: SendJob) {
        if let Some(limiter) = self.limiter.as_mut() {
            limiter.acquire().await;
        }

        let user_id = job.target.user_id;
        let outcome = self.adapter.send(user_id, &job.message).await;
        job.history
            .push(record(&job.target, &job.message, job.attempt, &outcome));

        if outcome.delivered {
            self.permanent_failures.remove(&user_id);
            job.finish();
            return;
        }

        let failure = outcome.reason.as_deref().unwrap_or(reason::UNAVAILABLE);
        match FailureClass::classify(failure) {
            FailureClass::Transient => {
                self.permanent_failures.remove(&user_id);
                if job.attempt <= self.config.max_retries {
                    tracing::debug!(
                        channel = %self.channel,
                        user_id = %user_id,
                        attempt = job.attempt,
                        reason = %failure,
                        "Transient failure, scheduling retry"
                    );
                    self.schedule_retry(job);
                    return;
                }
                tracing::warn!(
                    channel = %self.channel,
                    user_id = %user_id,
                    message_id = %job.message.message_id,
                    attempts = job.attempt,
                    reason = %failure,
                    "Delivery failed after retries"
                );
            }
            FailureClass::Permanent => {
                let count = self.permanent_failures.entry(user_id).or_default();
                *count += 1;
                tracing::warn!(
                    channel = %self.channel,
                    user_id = %user_id,
                    reason = %failure,
                    consecutive = *count,
                    "Permanent delivery failure"
                );
                if *count >= self.config.permanent_failure_threshold {
                    self.permanent_failures.remove(&user_id);
                    self.disable_channel(user_id).await;
                }
            }
        }

        job.finish();
    }

    fn schedule_retry(&self, mut job: SendJob) {
        job.attempt += 1;
        let requeue = self.requeue.clone();
        let delay = self.config.retry_delay;
        let throttled = self.limiter.is_some();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let Some(queue) = requeue.upgrade() else {
                let failed = SendOutcome::failed(reason::UNAVAILABLE);
                job.history
                    .push(record(&job.target, &job.message, job.attempt, &failed));
                job.finish();
                return;
            };

            let requeued = if throttled {
                queue.try_send(job)
            } else {
                queue.send(job).await.map_err(|e| TrySendError::Closed(e.0))
            };
            if let Err(e) = requeued {
                let (mut job, failure) = match e {
                    TrySendError::Full(job) => (job, reason::RATE_LIMITED),
                    TrySendError::Closed(job) => (job, reason::UNAVAILABLE),
                };
                let failed = SendOutcome::failed(failure);
                job.history
                    .push(record(&job.target, &job.message, job.attempt, &failed));
                job.finish();
            }
        });
    }

    async fn disable_channel(&self, user_id: Uuid) {
        match self
            .subscriptions
            .set_channel_enabled(user_id, &self.channel, false)
            .await
        {
            Ok(true) => tracing::warn!(
                channel = %self.channel,
                user_id = %user_id,
                "Channel disabled after repeated permanent failures"
            ),
            Ok(false) => tracing::debug!(
                channel = %self.channel,
                user_id = %user_id,
                "No subscription channel to disable"
            ),
            Err(e) => tracing::error!(
                channel = %self.channel,
                user_id = %user_id,
                error = %e,
                "Failed to disable channel"
            ),
        }
    }
}
