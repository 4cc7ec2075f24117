//! Dead-letter queue: a holding queue for messages that exhausted their
//! retry budget, with per-message failure reason and TTL-based purging.

use super::message::Message;
use crate::clock::{Clock, MonotonicClock};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct DlqOptions {
    pub max_size: usize,
    pub ttl: Duration,
}

impl Default for DlqOptions {
    fn default() -> Self {
        Self { max_size: 10_000, ttl: Duration::from_secs(7 * 24 * 60 * 60) }
    }
}

/// One dead-lettered message plus the reason it landed here.
#[derive(Debug, Clone)]
pub struct DlqEntry {
    pub message: Message,
    pub original_queue: String,
    pub failure_reason: String,
    pub retry_count: usize,
    pub dlq_timestamp_millis: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DlqStats {
    pub entered: u64,
    pub replayed: u64,
    pub purged: u64,
}

struct DlqInner {
    entries: VecDeque<DlqEntry>,
    stats: DlqStats,
}

/// A queue with `{originalQueue, maxSize, ttlMs}` per the Data Model, plus
/// per-message failure reason. Oldest entries are dropped once `max_size` is
/// reached — the DLQ itself never blocks a producer the way a main queue can
/// reject with `QUEUE_FULL`, since nothing retries publishing to a DLQ.
pub struct DeadLetterQueue {
    name: String,
    options: DlqOptions,
    inner: Mutex<DlqInner>,
    clock: Arc<dyn Clock>,
}

impl DeadLetterQueue {
    pub fn new(name: impl Into<String>, options: DlqOptions) -> Self {
        Self::with_clock(name, options, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(name: impl Into<String>, options: DlqOptions, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            options,
            inner: Mutex::new(DlqInner { entries: VecDeque::new(), stats: DlqStats::default() }),
            clock,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn push(&self, message: Message, original_queue: impl Into<String>, failure_reason: impl Into<String>) {
        let mut inner = self.inner.lock().await;
        if inner.entries.len() >= self.options.max_size {
            inner.entries.pop_front();
        }
        let retry_count = message.retry_count;
        inner.entries.push_back(DlqEntry {
            message,
            original_queue: original_queue.into(),
            failure_reason: failure_reason.into(),
            retry_count,
            dlq_timestamp_millis: self.clock.now_millis(),
        });
        inner.stats.entered += 1;
    }

    /// All live entries, oldest first.
    pub async fn entries(&self) -> Vec<DlqEntry> {
        self.inner.lock().await.entries.iter().cloned().collect()
    }

    /// Removes and returns the entry for `message_id`, for replay back onto
    /// its source queue.
    pub async fn take(&self, message_id: &str) -> Option<DlqEntry> {
        let mut inner = self.inner.lock().await;
        let idx = inner.entries.iter().position(|e| e.message.id == message_id)?;
        let entry = inner.entries.remove(idx);
        if entry.is_some() {
            inner.stats.replayed += 1;
        }
        entry
    }

    /// Drops entries whose `ttl` has elapsed. Returns how many were purged.
    pub async fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let ttl_millis = self.options.ttl.as_millis() as u64;
        let mut inner = self.inner.lock().await;
        let before = inner.entries.len();
        inner.entries.retain(|e| now.saturating_sub(e.dlq_timestamp_millis) < ttl_millis);
        let purged = before - inner.entries.len();
        inner.stats.purged += purged as u64;
        purged
    }

    pub async fn stats(&self) -> DlqStats {
        self.inner.lock().await.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::collections::HashMap;

    fn msg(id: &str, retry_count: usize) -> Message {
        Message {
            id: id.to_string(),
            content: b"x".to_vec(),
            headers: HashMap::new(),
            priority: 1,
            ttl: None,
            produced_at_millis: 0,
            delivered_at_millis: None,
            ack_deadline_at_millis: None,
            retry_count,
            max_retries: 2,
            correlation_id: None,
            reply_to: None,
            content_type: "text/plain".into(),
        }
    }

    #[tokio::test]
    async fn push_records_failure_reason_and_retry_count() {
        let dlq = DeadLetterQueue::new("R_dlq", DlqOptions::default());
        dlq.push(msg("m", 2), "R", "retries exhausted").await;
        let entries = dlq.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].retry_count, 2);
        assert_eq!(entries[0].failure_reason, "retries exhausted");
        assert_eq!(entries[0].original_queue, "R");
    }

    #[tokio::test]
    async fn max_size_drops_oldest() {
        let dlq = DeadLetterQueue::new("dlq", DlqOptions { max_size: 2, ..Default::default() });
        dlq.push(msg("a", 1), "q", "x").await;
        dlq.push(msg("b", 1), "q", "x").await;
        dlq.push(msg("c", 1), "q", "x").await;
        let entries = dlq.entries().await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message.id, "b");
    }

    #[tokio::test]
    async fn purge_expired_removes_past_ttl_entries() {
        let clock = ManualClock::new();
        let dlq = DeadLetterQueue::with_clock(
            "dlq",
            DlqOptions { ttl: Duration::from_millis(100), ..Default::default() },
            Arc::new(clock.clone()),
        );
        dlq.push(msg("a", 1), "q", "x").await;
        clock.advance(150);
        assert_eq!(dlq.purge_expired().await, 1);
        assert!(dlq.entries().await.is_empty());
    }

    #[tokio::test]
    async fn take_removes_entry_for_replay() {
        let dlq = DeadLetterQueue::new("dlq", DlqOptions::default());
        dlq.push(msg("a", 1), "q", "x").await;
        let entry = dlq.take("a").await.unwrap();
        assert_eq!(entry.message.id, "a");
        assert!(dlq.entries().await.is_empty());
        assert!(dlq.take("a").await.is_none());
    }
}
