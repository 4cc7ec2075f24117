//! Message record flowing through queues and topics.

use std::collections::HashMap;
use std::time::Duration;

/// A message in flight. Ownership is exactly one of {queue, pending-ack,
/// dlq, terminal}; which bucket currently holds it is tracked by the
/// structure that owns it, not by a field on the message itself.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub content: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub priority: u8,
    pub ttl: Option<Duration>,
    pub produced_at_millis: u64,
    pub delivered_at_millis: Option<u64>,
    pub ack_deadline_at_millis: Option<u64>,
    pub retry_count: usize,
    pub max_retries: usize,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub content_type: String,
}

impl Message {
    pub fn is_expired(&self, now_millis: u64) -> bool {
        match self.ttl {
            Some(ttl) => now_millis.saturating_sub(self.produced_at_millis) >= ttl.as_millis() as u64,
            None => false,
        }
    }
}

/// Caller-supplied fields for `publish`; everything else (`id`,
/// `producedAt`, `retryCount`) is assigned by the queue.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub headers: HashMap<String, String>,
    pub priority: u8,
    pub ttl: Option<Duration>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub content_type: String,
}
