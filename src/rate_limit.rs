//! Router-side rate limiting (§4.4 "Rate limiting", §3 Rate Bucket).
//!
//! One bucket per client/route key, enforcing a true sliding 60-second
//! window: each bucket keeps the timestamp of every admitted request within
//! the window and admits a new one only if fewer than `tokens_per_minute`
//! of them remain once timestamps older than the window are dropped. This
//! is the only way to satisfy testable property 7 (§8) — "for any client,
//! accepted requests in any 60-second window ≤ `tokensPerMinute`" — for
//! *any* window, not just one aligned to a fixed boundary; a tumbling
//! window (reset wholesale every 60s) lets two bursts either side of a
//! reset boundary double the configured rate within a single sliding
//! 60-second span. Keyed storage follows the `DashMap`-per-key counter idiom
//! from
//! `other_examples/338197b2_snakewayhq-snakeway__...traffic_management-manager.rs`
//! (`active_requests`, `total_requests` etc.), generalized from atomics to a
//! small `Mutex`-guarded struct since a bucket needs a timestamp log and a
//! running total updated together.

use crate::clock::{Clock, MonotonicClock};
use crate::error::Error;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

const WINDOW_MILLIS: u64 = 60_000;

/// Point-in-time view of one bucket.
#[derive(Debug, Clone, Copy)]
pub struct RateBucketSnapshot {
    pub tokens_per_minute: u32,
    pub tokens_remaining: u32,
    pub window_start_millis: u64,
    pub total_requests: u64,
}

struct BucketState {
    /// Timestamps of admitted requests still within the sliding window,
    /// oldest first.
    timestamps: VecDeque<u64>,
    total_requests: u64,
}

impl BucketState {
    fn prune(&mut self, now: u64) {
        while let Some(&oldest) = self.timestamps.front() {
            if now.saturating_sub(oldest) >= WINDOW_MILLIS {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Sliding-60s-window rate limiter keyed by an arbitrary client/route string.
pub struct RateLimiter {
    tokens_per_minute: u32,
    buckets: DashMap<String, BucketState>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(tokens_per_minute: u32) -> Self {
        Self::with_clock(tokens_per_minute, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(tokens_per_minute: u32, clock: Arc<dyn Clock>) -> Self {
        Self { tokens_per_minute, buckets: DashMap::new(), clock }
    }

    /// Admits or rejects one request for `key`. Prunes timestamps older than
    /// `WINDOW_MILLIS` from the bucket's log, then admits only if fewer than
    /// `tokens_per_minute` remain — so any rolling 60-second span for this
    /// key never admits more than `tokens_per_minute` requests.
    pub fn check(&self, key: &str) -> Result<(), Error> {
        let now = self.clock.now_millis();
        let mut entry = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| BucketState { timestamps: VecDeque::new(), total_requests: 0 });

        entry.prune(now);

        if entry.timestamps.len() as u32 >= self.tokens_per_minute {
            return Err(Error::rate_limited(format!(
                "client '{key}' exceeded {} requests/minute",
                self.tokens_per_minute
            )));
        }

        entry.timestamps.push_back(now);
        entry.total_requests += 1;
        Ok(())
    }

    pub fn snapshot(&self, key: &str) -> Option<RateBucketSnapshot> {
        let now = self.clock.now_millis();
        self.buckets.get_mut(key).map(|mut b| {
            b.prune(now);
            RateBucketSnapshot {
                tokens_per_minute: self.tokens_per_minute,
                tokens_remaining: self.tokens_per_minute.saturating_sub(b.timestamps.len() as u32),
                window_start_millis: b.timestamps.front().copied().unwrap_or(now),
                total_requests: b.total_requests,
            }
        })
    }

    /// Periodic sweep hook: drops buckets with no timestamps left inside
    /// the sliding window, so long-gone clients don't pin memory forever.
    pub fn purge_idle(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.buckets.len();
        self.buckets.retain(|_, b| {
            b.prune(now);
            !b.timestamps.is_empty()
        });
        before - self.buckets.len()
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(WINDOW_MILLIS)
    }
}
