//! Priority/durable queue: publish, consume, ack, retry-then-DLQ, batching.

use super::message::{Message, PublishOptions};
use crate::clock::{Clock, MonotonicClock};
use crate::error::Error;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub durable: bool,
    pub max_size: usize,
    pub priority_enabled: bool,
    pub priority_levels: u8,
    pub max_retries: usize,
    pub retry_base_delay: Duration,
    pub dlq_name: Option<String>,
    pub ack_timeout: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: false,
            max_size: 10_000,
            priority_enabled: false,
            priority_levels: 4,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(100),
            dlq_name: None,
            ack_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    pub published: u64,
    pub consumed: u64,
    pub acked: u64,
    pub failed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub current_depth: usize,
}

struct PendingAck {
    message: Message,
    ack_deadline_at_millis: u64,
}

/// Outcome of a sweep over past-due pending-ack entries.
pub struct ExpiredAck {
    pub message: Message,
}

struct QueueInner {
    main: VecDeque<Message>,
    priority: Vec<VecDeque<Message>>,
    pending_ack: HashMap<String, PendingAck>,
    stats: QueueStats,
}

impl QueueInner {
    fn depth(&self) -> usize {
        self.main.len() + self.priority.iter().map(|l| l.len()).sum::<usize>() + self.pending_ack.len()
    }

    fn pop_next(&mut self) -> Option<Message> {
        if !self.priority.is_empty() {
            for level in self.priority.iter_mut() {
                if let Some(msg) = level.pop_front() {
                    return Some(msg);
                }
            }
            None
        } else {
            self.main.pop_front()
        }
    }
}

/// One named queue. Owns its own lock, as the shared-resource policy
/// requires — cross-object callers must not reach into `inner` directly.
pub struct Queue {
    name: String,
    options: QueueOptions,
    inner: Mutex<QueueInner>,
    notify: Notify,
    clock: Arc<dyn Clock>,
    id_counter: AtomicU64,
}

impl Queue {
    pub fn new(name: impl Into<String>, options: QueueOptions) -> Self {
        Self::with_clock(name, options, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(name: impl Into<String>, options: QueueOptions, clock: Arc<dyn Clock>) -> Self {
        let levels = if options.priority_enabled { options.priority_levels as usize } else { 0 };
        Self {
            name: name.into(),
            options,
            inner: Mutex::new(QueueInner {
                main: VecDeque::new(),
                priority: (0..levels).map(|_| VecDeque::new()).collect(),
                pending_ack: HashMap::new(),
                stats: QueueStats::default(),
            }),
            notify: Notify::new(),
            clock,
            id_counter: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    fn new_message_id(&self) -> String {
        let seq = self.id_counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{seq}", Uuid::new_v4())
    }

    pub async fn publish(&self, content: Vec<u8>, opts: PublishOptions) -> Result<String, Error> {
        let mut inner = self.inner.lock().await;
        if inner.depth() >= self.options.max_size {
            return Err(Error::queue_full(format!(
                "queue '{}' at capacity ({} messages)",
                self.name, self.options.max_size
            )));
        }

        let id = self.new_message_id();
        let message = Message {
            id: id.clone(),
            content,
            headers: opts.headers,
            priority: opts.priority,
            ttl: opts.ttl,
            produced_at_millis: self.clock.now_millis(),
            delivered_at_millis: None,
            ack_deadline_at_millis: None,
            retry_count: 0,
            max_retries: self.options.max_retries,
            correlation_id: opts.correlation_id,
            reply_to: opts.reply_to,
            content_type: opts.content_type,
        };

        self.enqueue(&mut inner, message);
        inner.stats.published += 1;
        inner.stats.current_depth = inner.depth();
        drop(inner);
        self.notify.notify_waiters();
        Ok(id)
    }

    fn enqueue(&self, inner: &mut QueueInner, message: Message) {
        if self.options.priority_enabled && !inner.priority.is_empty() {
            let idx = (message.priority.max(1) as usize - 1).min(inner.priority.len() - 1);
            inner.priority[idx].push_back(message);
        } else {
            inner.main.push_back(message);
        }
    }

    /// Tries to pop the next admissible message; skips (and counts as
    /// failed) any expired entries it encounters along the way.
    async fn try_take_one(&self) -> Option<Message> {
        let mut inner = self.inner.lock().await;
        while let Some(mut message) = inner.pop_next() {
            if message.is_expired(self.clock.now_millis()) {
                inner.stats.failed += 1;
                continue;
            }
            let now = self.clock.now_millis();
            let ack_deadline = now + self.options.ack_timeout.as_millis() as u64;
            message.delivered_at_millis = Some(now);
            message.ack_deadline_at_millis = Some(ack_deadline);
            inner.stats.consumed += 1;
            inner
                .pending_ack
                .insert(message.id.clone(), PendingAck { message: message.clone(), ack_deadline_at_millis: ack_deadline });
            inner.stats.current_depth = inner.depth();
            return Some(message);
        }
        None
    }

    /// Returns the next message by the priority rule. With `wait = None`
    /// this is non-blocking; with `wait = Some(d)` it polls for up to `d`
    /// before giving up, waking early whenever a publish occurs.
    pub async fn consume(&self, _consumer_id: &str, wait: Option<Duration>) -> Result<Option<Message>, Error> {
        if let Some(message) = self.try_take_one().await {
            return Ok(Some(message));
        }

        let Some(mut remaining) = wait else { return Ok(None) };
        const POLL_STEP: Duration = Duration::from_millis(50);

        while !remaining.is_zero() {
            let step = remaining.min(POLL_STEP);
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(step) => {}
            }
            remaining = remaining.saturating_sub(step);
            if let Some(message) = self.try_take_one().await {
                return Ok(Some(message));
            }
        }
        Ok(None)
    }

    /// `ack(id, success)`. On failure, retries with backoff or drops to the
    /// DLQ via `on_dead_letter` once the retry budget is exhausted.
    pub async fn ack(&self, msg_id: &str, success: bool) -> Result<AckOutcome, Error> {
        let mut inner = self.inner.lock().await;
        let Some(pending) = inner.pending_ack.remove(msg_id) else {
            return Err(Error::not_found(format!("no pending-ack message '{msg_id}' on queue '{}'", self.name)));
        };

        if success {
            inner.stats.acked += 1;
            inner.stats.current_depth = inner.depth();
            return Ok(AckOutcome::Acked);
        }

        let mut message = pending.message;
        inner.stats.failed += 1;

        if message.retry_count < message.max_retries {
            message.retry_count += 1;
            let delay = self.options.retry_base_delay * message.retry_count as u32;
            inner.stats.retried += 1;
            inner.stats.current_depth = inner.depth();
            Ok(AckOutcome::Retrying { message, delay })
        } else {
            // The final failing delivery is not itself a retry, so
            // `retry_count` stays at `max_retries` rather than stepping past it.
            inner.stats.dead_lettered += 1;
            inner.stats.current_depth = inner.depth();
            Ok(AckOutcome::Exhausted { message })
        }
    }

    /// Re-inserts a message at its original priority. The caller (the
    /// broker) is responsible for waiting out a retry's backoff delay
    /// before calling this — `Queue` itself performs no scheduling.
    pub async fn requeue(&self, message: Message) {
        let mut inner = self.inner.lock().await;
        self.enqueue(&mut inner, message);
        inner.stats.current_depth = inner.depth();
        drop(inner);
        self.notify.notify_waiters();
    }

    pub async fn publish_batch(&self, items: Vec<(Vec<u8>, PublishOptions)>) -> Vec<Result<String, Error>> {
        let mut results = Vec::with_capacity(items.len());
        for (content, opts) in items {
            results.push(self.publish(content, opts).await);
        }
        results
    }

    /// Pulls up to `batch_size` messages into pending-ack atomically (under
    /// one lock acquisition), then lets the caller ack each by index.
    pub async fn pull_batch(&self, batch_size: usize) -> Vec<Message> {
        let mut inner = self.inner.lock().await;
        let mut batch = Vec::with_capacity(batch_size);
        while batch.len() < batch_size {
            let Some(mut message) = inner.pop_next() else { break };
            let now = self.clock.now_millis();
            message.delivered_at_millis = Some(now);
            message.ack_deadline_at_millis = Some(now + self.options.ack_timeout.as_millis() as u64);
            inner.pending_ack.insert(
                message.id.clone(),
                PendingAck { message: message.clone(), ack_deadline_at_millis: message.ack_deadline_at_millis.unwrap() },
            );
            inner.stats.consumed += 1;
            batch.push(message);
        }
        inner.stats.current_depth = inner.depth();
        batch
    }

    pub async fn status(&self) -> QueueStats {
        self.inner.lock().await.stats
    }

    /// Scans pending-ack for entries whose deadline has passed and treats
    /// each as `ack(false)`, per the Scheduler contract in §5. Returns the
    /// messages that were either requeued or exhausted to the DLQ.
    pub async fn sweep_ack_timeouts(&self) -> Vec<AckOutcome> {
        let now = self.clock.now_millis();
        let expired: Vec<String> = {
            let inner = self.inner.lock().await;
            inner
                .pending_ack
                .iter()
                .filter(|(_, p)| p.ack_deadline_at_millis <= now)
                .map(|(id, _)| id.clone())
                .collect()
        };

        let mut outcomes = Vec::with_capacity(expired.len());
        for id in expired {
            if let Ok(outcome) = self.ack(&id, false).await {
                outcomes.push(outcome);
            }
        }
        outcomes
    }
}

/// Result of an `ack` call, used by the broker to route failed messages to
/// a DLQ and by the scheduler-driven ack-timeout sweep.
pub enum AckOutcome {
    Acked,
    Retrying { message: Message, delay: Duration },
    Exhausted { message: Message },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn opts() -> QueueOptions {
        QueueOptions { max_size: 10, ..Default::default() }
    }

    #[tokio::test]
    async fn publish_then_consume_round_trip() {
        let q = Queue::new("q", opts());
        let id = q.publish(b"hello".to_vec(), PublishOptions::default()).await.unwrap();
        let msg = q.consume("c1", None).await.unwrap().unwrap();
        assert_eq!(msg.id, id);
        assert_eq!(msg.content, b"hello");
    }

    #[tokio::test]
    async fn publish_rejects_beyond_max_size() {
        let q = Queue::new("q", QueueOptions { max_size: 1, ..Default::default() });
        q.publish(b"a".to_vec(), PublishOptions::default()).await.unwrap();
        let err = q.publish(b"b".to_vec(), PublishOptions::default()).await.unwrap_err();
        assert!(err.is_queue_full());
    }

    #[tokio::test]
    async fn consume_respects_priority_ordering() {
        let mut o = opts();
        o.priority_enabled = true;
        o.priority_levels = 4;
        let q = Queue::new("Q", o);

        let pub_opts = |p: u8| PublishOptions { priority: p, ..Default::default() };
        q.publish(b"a".to_vec(), pub_opts(4)).await.unwrap();
        q.publish(b"b".to_vec(), pub_opts(1)).await.unwrap();
        q.publish(b"c".to_vec(), pub_opts(2)).await.unwrap();
        q.publish(b"d".to_vec(), pub_opts(1)).await.unwrap();

        let mut order = Vec::new();
        for _ in 0..4 {
            order.push(q.consume("c1", None).await.unwrap().unwrap().content);
        }
        assert_eq!(order, vec![b"b".to_vec(), b"d".to_vec(), b"c".to_vec(), b"a".to_vec()]);
    }

    #[tokio::test]
    async fn ack_success_removes_terminally() {
        let q = Queue::new("q", opts());
        let id = q.publish(b"x".to_vec(), PublishOptions::default()).await.unwrap();
        q.consume("c1", None).await.unwrap();
        let outcome = q.ack(&id, true).await.unwrap();
        assert!(matches!(outcome, AckOutcome::Acked));
        let status = q.status().await;
        assert_eq!(status.acked, 1);
        assert_eq!(status.current_depth, 0);
    }

    #[tokio::test]
    async fn ack_failure_retries_until_exhausted_then_dead_letters() {
        let mut o = opts();
        o.max_retries = 2;
        let q = Queue::new("R", o);
        let id = q.publish(b"m".to_vec(), PublishOptions::default()).await.unwrap();

        for expected_retry in 1..=2 {
            q.consume("c1", None).await.unwrap();
            let outcome = q.ack(&id, false).await.unwrap();
            match outcome {
                AckOutcome::Retrying { message, .. } => {
                    assert_eq!(message.retry_count, expected_retry);
                    q.requeue(message).await;
                }
                _ => panic!("expected retry on attempt {expected_retry}"),
            }
        }

        q.consume("c1", None).await.unwrap();
        let outcome = q.ack(&id, false).await.unwrap();
        match outcome {
            AckOutcome::Exhausted { message } => assert_eq!(message.retry_count, 2),
            _ => panic!("expected exhaustion"),
        }
        let status = q.status().await;
        assert_eq!(status.dead_lettered, 1);
    }

    #[tokio::test]
    async fn sweep_ack_timeouts_requeues_past_due_messages() {
        let clock = ManualClock::new();
        let mut o = opts();
        o.ack_timeout = Duration::from_millis(100);
        let q = Queue::with_clock("q", o, Arc::new(clock.clone()));
        q.publish(b"x".to_vec(), PublishOptions::default()).await.unwrap();
        q.consume("c1", None).await.unwrap();

        clock.advance(150);
        let outcomes = q.sweep_ack_timeouts().await;
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0], AckOutcome::Retrying { .. }));
    }
}
