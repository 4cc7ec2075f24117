//! Message broker (§4.3): the facade gluing named queues, named topics, and
//! their dead-letter queues onto one [`crate::scheduler::Scheduler`] so ack
//! timeouts, retry delays, and DLQ purges all run as the periodic/delayed
//! tasks the concurrency model calls for, instead of being polled inline.
//!
//! Lock ordering: the broker's own `DashMap`s are sharded per key, so two
//! different queues/topics never contend; a single queue or topic still
//! only ever takes its own lock, per §5.

pub mod dlq;
pub mod message;
pub mod queue;
pub mod topic;

use crate::clock::{Clock, MonotonicClock};
use crate::error::Error;
use crate::scheduler::{Scheduler, TaskHandle};
use dashmap::DashMap;
use dlq::{DeadLetterQueue, DlqEntry, DlqOptions};
use message::{Message, PublishOptions};
use queue::{AckOutcome, Queue, QueueOptions, QueueStats};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use topic::{SubscribeOptions, SubscriberCallback, Topic, TopicOptions, TopicStats};

/// Outcome of one `ack(msg_id, consumer_id, success)` call, reported back to
/// the caller for observability; the broker itself has already carried out
/// the requeue/DLQ routing implied by the outcome.
#[derive(Debug)]
pub enum AckResult {
    Acked,
    Retrying { attempt: usize },
    DeadLettered { dlq: Option<String> },
}

/// Per-call options for `consume`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsumeOptions {
    pub wait: Option<Duration>,
}

/// The message broker: owns every named queue, topic, and DLQ in the
/// process and drives their periodic maintenance.
pub struct MessageBroker {
    queues: DashMap<String, Arc<Queue>>,
    topics: DashMap<String, Arc<Topic>>,
    dlqs: DashMap<String, Arc<DeadLetterQueue>>,
    /// Tracks which queue currently holds a delivered-but-unacked message,
    /// so `ack(msg_id, ...)` doesn't need the caller to repeat the queue name.
    in_flight: DashMap<String, String>,
    scheduler: Scheduler,
    clock: Arc<dyn Clock>,
    sweepers: tokio::sync::Mutex<Vec<TaskHandle>>,
}

impl Default for MessageBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBroker {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            queues: DashMap::new(),
            topics: DashMap::new(),
            dlqs: DashMap::new(),
            in_flight: DashMap::new(),
            scheduler: Scheduler::new(),
            clock,
            sweepers: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    // ---- Queues -----------------------------------------------------

    pub fn create_queue(&self, name: impl Into<String>, options: QueueOptions) -> Result<(), Error> {
        let name = name.into();
        if self.queues.contains_key(&name) {
            return Err(Error::already_exists(format!("queue '{name}' already exists")));
        }
        self.queues.insert(name.clone(), Arc::new(Queue::with_clock(name, options, self.clock.clone())));
        Ok(())
    }

    pub fn delete_queue(&self, name: &str) -> Result<(), Error> {
        self.queues
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(format!("queue '{name}' not found")))
    }

    pub fn create_dlq(&self, name: impl Into<String>, options: DlqOptions) -> Result<(), Error> {
        let name = name.into();
        if self.dlqs.contains_key(&name) {
            return Err(Error::already_exists(format!("dlq '{name}' already exists")));
        }
        self.dlqs.insert(name.clone(), Arc::new(DeadLetterQueue::with_clock(name, options, self.clock.clone())));
        Ok(())
    }

    pub async fn dlq_entries(&self, name: &str) -> Result<Vec<DlqEntry>, Error> {
        Ok(self.dlq(name)?.entries().await)
    }

    fn queue(&self, name: &str) -> Result<Arc<Queue>, Error> {
        self.queues.get(name).map(|e| e.value().clone()).ok_or_else(|| Error::not_found(format!("queue '{name}' not found")))
    }

    fn dlq(&self, name: &str) -> Result<Arc<DeadLetterQueue>, Error> {
        self.dlqs.get(name).map(|e| e.value().clone()).ok_or_else(|| Error::not_found(format!("dlq '{name}' not found")))
    }

    pub async fn publish(&self, queue: &str, content: Vec<u8>, opts: PublishOptions) -> Result<String, Error> {
        self.queue(queue)?.publish(content, opts).await
    }

    pub async fn publish_batch(&self, queue: &str, items: Vec<(Vec<u8>, PublishOptions)>) -> Result<Vec<Result<String, Error>>, Error> {
        Ok(self.queue(queue)?.publish_batch(items).await)
    }

    pub async fn consume(&self, queue: &str, consumer_id: &str, opts: ConsumeOptions) -> Result<Option<Message>, Error> {
        let q = self.queue(queue)?;
        let message = q.consume(consumer_id, opts.wait).await?;
        if let Some(m) = &message {
            self.in_flight.insert(m.id.clone(), queue.to_string());
        }
        Ok(message)
    }

    /// `ack(msgId, success)`. Looks up which queue the message was delivered
    /// from, then applies the queue's retry/DLQ policy: retries are
    /// requeued after their backoff delay via the scheduler; exhausted
    /// messages move to the queue's configured DLQ (dropped if none).
    pub async fn ack(&self, msg_id: &str, success: bool) -> Result<AckResult, Error> {
        let Some((_, queue_name)) = self.in_flight.remove(msg_id) else {
            return Err(Error::not_found(format!("no in-flight message '{msg_id}'")));
        };
        let q = self.queue(&queue_name)?;
        let outcome = q.ack(msg_id, success).await?;
        self.apply_ack_outcome(&queue_name, q, outcome).await
    }

    async fn apply_ack_outcome(&self, queue_name: &str, q: Arc<Queue>, outcome: AckOutcome) -> Result<AckResult, Error> {
        match outcome {
            AckOutcome::Acked => Ok(AckResult::Acked),
            AckOutcome::Retrying { message, delay } => {
                let attempt = message.retry_count;
                let requeue_queue = q.clone();
                self.scheduler.after(delay, async move {
                    requeue_queue.requeue(message).await;
                });
                Ok(AckResult::Retrying { attempt })
            }
            AckOutcome::Exhausted { message } => {
                let dlq_name = q.options().dlq_name.clone();
                if let Some(dlq_name) = &dlq_name {
                    if let Ok(dlq) = self.dlq(dlq_name) {
                        dlq.push(message, queue_name, "retry budget exhausted").await;
                        return Ok(AckResult::DeadLettered { dlq: Some(dlq_name.clone()) });
                    }
                    tracing::warn!(queue = queue_name, dlq = %dlq_name, "dlq configured but not found, dropping message");
                } else {
                    tracing::warn!(queue = queue_name, "retry budget exhausted with no dlq configured, dropping message");
                }
                Ok(AckResult::DeadLettered { dlq: None })
            }
        }
    }

    /// Pulls up to `batch_size` messages atomically, runs `handler` over
    /// them, and positionally acks each by the handler's returned outcomes.
    pub async fn process_batch<F, Fut>(&self, queue: &str, batch_size: usize, handler: F) -> Result<Vec<AckResult>, Error>
    where
        F: FnOnce(Vec<Message>) -> Fut,
        Fut: Future<Output = Vec<bool>>,
    {
        let q = self.queue(queue)?;
        let batch = q.pull_batch(batch_size).await;
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = batch.iter().map(|m| m.id.clone()).collect();
        let outcomes = handler(batch).await;

        let mut results = Vec::with_capacity(ids.len());
        for (id, success) in ids.into_iter().zip(outcomes.into_iter()) {
            let outcome = q.ack(&id, success).await?;
            results.push(self.apply_ack_outcome(queue, q.clone(), outcome).await?);
        }
        Ok(results)
    }

    pub async fn queue_status(&self, queue: &str) -> Result<QueueStats, Error> {
        Ok(self.queue(queue)?.status().await)
    }

    // ---- Topics -------------------------------------------------------

    pub fn create_topic(&self, name: impl Into<String>, options: TopicOptions) -> Result<(), Error> {
        let name = name.into();
        if self.topics.contains_key(&name) {
            return Err(Error::already_exists(format!("topic '{name}' already exists")));
        }
        self.topics.insert(name.clone(), Arc::new(Topic::with_clock(name, options, self.clock.clone())));
        Ok(())
    }

    fn topic(&self, name: &str) -> Result<Arc<Topic>, Error> {
        self.topics.get(name).map(|e| e.value().clone()).ok_or_else(|| Error::not_found(format!("topic '{name}' not found")))
    }

    pub async fn subscribe(&self, topic: &str, subscriber_id: impl Into<String>, callback: SubscriberCallback, opts: SubscribeOptions) -> Result<(), Error> {
        self.topic(topic)?.subscribe(subscriber_id, callback, opts).await
    }

    pub async fn unsubscribe(&self, topic: &str, subscriber_id: &str) -> Result<(), Error> {
        self.topic(topic)?.unsubscribe(subscriber_id).await;
        Ok(())
    }

    pub async fn publish_topic(&self, topic: &str, content: Vec<u8>, opts: PublishOptions) -> Result<(), Error> {
        let now = self.clock.now_millis();
        let message = Message {
            id: uuid::Uuid::new_v4().to_string(),
            content,
            headers: opts.headers,
            priority: opts.priority,
            ttl: opts.ttl,
            produced_at_millis: now,
            delivered_at_millis: None,
            ack_deadline_at_millis: None,
            retry_count: 0,
            max_retries: 0,
            correlation_id: opts.correlation_id,
            reply_to: opts.reply_to,
            content_type: opts.content_type,
        };
        self.topic(topic)?.publish(message).await
    }

    pub async fn topic_status(&self, topic: &str) -> Result<TopicStats, Error> {
        Ok(self.topic(topic)?.stats().await)
    }

    // ---- Scheduled maintenance -----------------------------------------

    /// Starts the periodic sweeps the Concurrency & Resource Model requires:
    /// per-queue ack-timeout sweeps (every `queue.ack_timeout / 2`, floor
    /// 50ms) and a DLQ-purge sweep over every registered DLQ. Call once
    /// after registering queues/DLQs; returns immediately, the sweeps run
    /// in the background until `self` is dropped.
    pub async fn start_maintenance(self: &Arc<Self>) {
        let mut handles = self.sweepers.lock().await;

        for entry in self.queues.iter() {
            let queue_name = entry.key().clone();
            let queue = entry.value().clone();
            let period = (queue.options().ack_timeout / 2).max(Duration::from_millis(50));
            let broker = self.clone();
            handles.push(self.scheduler.every(period, move || {
                let queue = queue.clone();
                let queue_name = queue_name.clone();
                let broker = broker.clone();
                async move {
                    let outcomes = queue.sweep_ack_timeouts().await;
                    for outcome in outcomes {
                        let _ = broker.apply_ack_outcome(&queue_name, queue.clone(), outcome).await;
                    }
                }
            }));
        }

        let dlqs: Vec<Arc<DeadLetterQueue>> = self.dlqs.iter().map(|e| e.value().clone()).collect();
        if !dlqs.is_empty() {
            handles.push(self.scheduler.every(Duration::from_secs(60), move || {
                let dlqs = dlqs.clone();
                async move {
                    for dlq in &dlqs {
                        let purged = dlq.purge_expired().await;
                        if purged > 0 {
                            tracing::info!(dlq = dlq.name(), purged, "dlq purge swept expired entries");
                        }
                    }
                }
            }));
        }
    }
}
