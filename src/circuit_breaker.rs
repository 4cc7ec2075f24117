//! Circuit breaker state machine: lock-free atomics for phase and counters.
//!
//! Three phases — closed, open, half-open — exactly as described by the
//! manager contract. A breaker also gates admission with its own bulkhead
//! (`in_flight`/`max_concurrent`) rather than needing a separate layer,
//! folds timeout enforcement into the same `execute` call, and tracks an
//! exponentially-weighted moving average of response time.

use crate::clock::{Clock, MonotonicClock};
use crate::error::Error;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const PHASE_CLOSED: u8 = 0;
const PHASE_OPEN: u8 = 1;
const PHASE_HALF_OPEN: u8 = 2;

/// EWMA smoothing factor for response-time stats, per the manager contract.
const RESPONSE_TIME_EWMA_ALPHA: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

fn phase_to_state(phase: u8) -> CircuitState {
    match phase {
        PHASE_CLOSED => CircuitState::Closed,
        PHASE_OPEN => CircuitState::Open,
        PHASE_HALF_OPEN => CircuitState::HalfOpen,
        _ => unreachable!("invalid circuit breaker phase"),
    }
}

/// Snapshot of a breaker's counters, taken under its stats lock.
#[derive(Debug, Clone, Copy, Default)]
pub struct CircuitBreakerStats {
    pub total_calls: u64,
    pub successful: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub rejected: u64,
    pub response_time_ewma: Option<Duration>,
}

struct StatsInner {
    counters: CircuitBreakerStats,
}

/// Classifies whether an error counts toward the breaker's failure counter.
/// Only errors a caller has declared retryable trip the breaker; everything
/// else (validation errors, not-found, ...) passes through untouched so
/// client-error storms cannot trip it.
pub type RetryableClassifier = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

fn default_retryable() -> RetryableClassifier {
    Arc::new(|e: &Error| e.is_retryable_default())
}

#[derive(Clone)]
pub struct CircuitBreakerConfig {
    pub timeout: Duration,
    pub failure_threshold: usize,
    pub success_threshold: usize,
    pub recovery_timeout: Duration,
    pub half_open_probes: usize,
    pub max_concurrent: usize,
    pub retryable: RetryableClassifier,
}

impl std::fmt::Debug for CircuitBreakerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerConfig")
            .field("timeout", &self.timeout)
            .field("failure_threshold", &self.failure_threshold)
            .field("success_threshold", &self.success_threshold)
            .field("recovery_timeout", &self.recovery_timeout)
            .field("half_open_probes", &self.half_open_probes)
            .field("max_concurrent", &self.max_concurrent)
            .finish_non_exhaustive()
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            failure_threshold: 5,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(30),
            half_open_probes: 1,
            max_concurrent: usize::MAX,
            retryable: default_retryable(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: usize, recovery_timeout: Duration) -> Self {
        Self { failure_threshold, recovery_timeout, ..Self::default() }
    }

    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }
}

/// Fluent builder for [`CircuitBreakerConfig`].
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    pub fn new() -> Self {
        Self { config: CircuitBreakerConfig::default() }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn failure_threshold(mut self, n: usize) -> Self {
        self.config.failure_threshold = n;
        self
    }

    pub fn success_threshold(mut self, n: usize) -> Self {
        self.config.success_threshold = n;
        self
    }

    pub fn recovery_timeout(mut self, d: Duration) -> Self {
        self.config.recovery_timeout = d;
        self
    }

    pub fn half_open_probes(mut self, n: usize) -> Self {
        self.config.half_open_probes = n;
        self
    }

    pub fn max_concurrent(mut self, n: usize) -> Self {
        self.config.max_concurrent = n;
        self
    }

    pub fn retryable<F>(mut self, f: F) -> Self
    where
        F: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        self.config.retryable = Arc::new(f);
        self
    }

    pub fn build(self) -> CircuitBreakerConfig {
        self.config
    }
}

impl Default for CircuitBreakerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct BreakerState {
    phase: AtomicU8,
    failures: AtomicUsize,
    successes: AtomicUsize,
    last_failure_at_millis: AtomicU64,
    in_flight: AtomicUsize,
    half_open_in_flight: AtomicUsize,
    stats: Mutex<StatsInner>,
}

/// One breaker's runtime state plus the config it was created with.
#[derive(Clone)]
pub struct CircuitBreakerPolicy {
    state: Arc<BreakerState>,
    config: Arc<CircuitBreakerConfig>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreakerPolicy {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(BreakerState {
                phase: AtomicU8::new(PHASE_CLOSED),
                failures: AtomicUsize::new(0),
                successes: AtomicUsize::new(0),
                last_failure_at_millis: AtomicU64::new(0),
                in_flight: AtomicUsize::new(0),
                half_open_in_flight: AtomicUsize::new(0),
                stats: Mutex::new(StatsInner { counters: CircuitBreakerStats::default() }),
            }),
            config: Arc::new(config),
            clock,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        phase_to_state(self.state.phase.load(Ordering::Acquire))
    }

    pub fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::Acquire)
    }

    pub fn failures(&self) -> usize {
        self.state.failures.load(Ordering::Acquire)
    }

    pub fn successes(&self) -> usize {
        self.state.successes.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        self.state.stats.lock().unwrap_or_else(|p| p.into_inner()).counters
    }

    /// Force the breaker back to closed and clear counters, as `reset(name)` does.
    pub fn reset(&self) {
        self.state.phase.store(PHASE_CLOSED, Ordering::Release);
        self.state.failures.store(0, Ordering::Release);
        self.state.successes.store(0, Ordering::Release);
        self.state.last_failure_at_millis.store(0, Ordering::Release);
        self.state.half_open_in_flight.store(0, Ordering::Release);
    }

    fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    /// Admit, run, and account for one call. `timeout_override` tightens
    /// (never loosens) the configured timeout, per the manager contract.
    pub async fn execute<T, Fut, Op>(
        &self,
        timeout_override: Option<Duration>,
        operation: Op,
    ) -> Result<T, Error>
    where
        T: Send,
        Fut: Future<Output = Result<T, Error>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        let mut was_half_open = false;

        loop {
            let phase = self.state.phase.load(Ordering::Acquire);
            match phase {
                PHASE_OPEN => {
                    let opened_at = self.state.last_failure_at_millis.load(Ordering::Acquire);
                    let elapsed = self.now_millis().saturating_sub(opened_at);
                    if elapsed >= self.config.recovery_timeout.as_millis() as u64 {
                        match self.state.phase.compare_exchange(
                            PHASE_OPEN,
                            PHASE_HALF_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        ) {
                            Ok(_) => {
                                tracing::info!("circuit breaker: open → half-open");
                                self.state.successes.store(0, Ordering::Release);
                                self.state.half_open_in_flight.store(0, Ordering::Release);
                                continue;
                            }
                            Err(_) => continue,
                        }
                    } else {
                        self.record_rejected();
                        return Err(Error::circuit_open(format!(
                            "breaker open, {} failures, recovers in {:?}",
                            self.state.failures.load(Ordering::Acquire),
                            self.config.recovery_timeout.saturating_sub(Duration::from_millis(elapsed)),
                        )));
                    }
                }
                PHASE_HALF_OPEN => {
                    let current = self.state.half_open_in_flight.fetch_add(1, Ordering::AcqRel);
                    if current >= self.config.half_open_probes {
                        self.state.half_open_in_flight.fetch_sub(1, Ordering::Release);
                        self.record_rejected();
                        return Err(Error::circuit_open("breaker half-open, probe budget exhausted"));
                    }
                    was_half_open = true;
                    break;
                }
                PHASE_CLOSED => break,
                _ => unreachable!("invalid circuit breaker phase"),
            }
        }

        // Bulkhead admission gates concurrency independently of phase.
        let in_flight = self.state.in_flight.fetch_add(1, Ordering::AcqRel);
        if in_flight >= self.config.max_concurrent {
            self.state.in_flight.fetch_sub(1, Ordering::Release);
            if was_half_open {
                self.state.half_open_in_flight.fetch_sub(1, Ordering::Release);
            }
            self.record_rejected();
            return Err(Error::bulkhead_full(format!(
                "{} in-flight, max {}",
                in_flight, self.config.max_concurrent
            )));
        }

        let effective_timeout = match timeout_override {
            Some(t) => t.min(self.config.timeout),
            None => self.config.timeout,
        };

        let start = self.clock.now_millis();
        let outcome = tokio::time::timeout(effective_timeout, operation()).await;
        let elapsed = Duration::from_millis(self.clock.now_millis().saturating_sub(start));

        self.state.in_flight.fetch_sub(1, Ordering::Release);
        if was_half_open {
            self.state.half_open_in_flight.fetch_sub(1, Ordering::Release);
        }

        let result = match outcome {
            Ok(inner) => inner,
            Err(_) => Err(Error::timeout(format!(
                "operation exceeded {:?}",
                effective_timeout
            ))),
        };

        match &result {
            Ok(_) => {
                self.record_success(elapsed);
                self.on_success(was_half_open);
            }
            Err(e) => {
                self.record_failure(elapsed, e.is_timeout());
                if (self.config.retryable)(e) {
                    self.on_failure(was_half_open);
                }
            }
        }

        result
    }

    fn on_success(&self, was_half_open: bool) {
        if was_half_open {
            let successes = self.state.successes.fetch_add(1, Ordering::AcqRel) + 1;
            if successes >= self.config.success_threshold
                && self
                    .state
                    .phase
                    .compare_exchange(
                        PHASE_HALF_OPEN,
                        PHASE_CLOSED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
            {
                self.state.failures.store(0, Ordering::Release);
                self.state.successes.store(0, Ordering::Release);
                tracing::info!("circuit breaker: half-open → closed");
            }
        } else {
            // Decrement floor 0: successive non-atomic decrement guarded by CAS loop.
            loop {
                let current = self.state.failures.load(Ordering::Acquire);
                if current == 0 {
                    break;
                }
                if self
                    .state
                    .failures
                    .compare_exchange(current, current - 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    break;
                }
            }
        }
    }

    fn on_failure(&self, was_half_open: bool) {
        if was_half_open {
            if self
                .state
                .phase
                .compare_exchange(PHASE_HALF_OPEN, PHASE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.state.last_failure_at_millis.store(self.now_millis(), Ordering::Release);
                tracing::warn!("circuit breaker: half-open probe failed → open");
            }
            return;
        }

        let failures = self.state.failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= self.config.failure_threshold
            && self
                .state
                .phase
                .compare_exchange(PHASE_CLOSED, PHASE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.state.last_failure_at_millis.store(self.now_millis(), Ordering::Release);
            tracing::error!(failures, threshold = self.config.failure_threshold, "circuit breaker: closed → open");
        }
    }

    fn record_rejected(&self) {
        let mut inner = self.state.stats.lock().unwrap_or_else(|p| p.into_inner());
        inner.counters.total_calls += 1;
        inner.counters.rejected += 1;
    }

    fn record_success(&self, elapsed: Duration) {
        let mut inner = self.state.stats.lock().unwrap_or_else(|p| p.into_inner());
        inner.counters.total_calls += 1;
        inner.counters.successful += 1;
        update_ewma(&mut inner.counters.response_time_ewma, elapsed);
    }

    fn record_failure(&self, elapsed: Duration, was_timeout: bool) {
        let mut inner = self.state.stats.lock().unwrap_or_else(|p| p.into_inner());
        inner.counters.total_calls += 1;
        inner.counters.failed += 1;
        if was_timeout {
            inner.counters.timed_out += 1;
        }
        update_ewma(&mut inner.counters.response_time_ewma, elapsed);
    }
}

fn update_ewma(ewma: &mut Option<Duration>, sample: Duration) {
    *ewma = Some(match *ewma {
        None => sample,
        Some(prev) => {
            let prev_ms = prev.as_secs_f64() * 1000.0;
            let sample_ms = sample.as_secs_f64() * 1000.0;
            let next_ms = RESPONSE_TIME_EWMA_ALPHA * sample_ms + (1.0 - RESPONSE_TIME_EWMA_ALPHA) * prev_ms;
            Duration::from_secs_f64((next_ms / 1000.0).max(0.0))
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn breaker(failure_threshold: usize, recovery: Duration) -> CircuitBreakerPolicy {
        CircuitBreakerPolicy::new(CircuitBreakerConfig::new(failure_threshold, recovery))
    }

    #[tokio::test]
    async fn starts_closed_and_admits_calls() {
        let b = breaker(3, Duration::from_secs(1));
        let result = b.execute(None, || async { Ok::<_, Error>(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let b = breaker(3, Duration::from_secs(10));
        for _ in 0..3 {
            let _ = b.execute(None, || async { Err::<(), _>(Error::unavailable("down")) }).await;
        }
        assert_eq!(b.state(), CircuitState::Open);

        let result = b.execute(None, || async { Ok::<_, Error>(()) }).await;
        assert!(result.unwrap_err().is_circuit_open());
    }

    #[tokio::test]
    async fn non_retryable_errors_do_not_trip_breaker() {
        let b = breaker(2, Duration::from_secs(10));
        for _ in 0..5 {
            let _ = b.execute(None, || async { Err::<(), _>(Error::validation("bad input")) }).await;
        }
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.failures(), 0);
    }

    #[tokio::test]
    async fn transitions_to_half_open_then_closed_on_success() {
        let clock = ManualClock::new();
        let b = CircuitBreakerPolicy::with_clock(
            CircuitBreakerConfig::builder()
                .failure_threshold(1)
                .success_threshold(2)
                .recovery_timeout(Duration::from_millis(100))
                .build(),
            Arc::new(clock.clone()),
        );

        let _ = b.execute(None, || async { Err::<(), _>(Error::unavailable("down")) }).await;
        assert_eq!(b.state(), CircuitState::Open);

        clock.advance(150);
        let r1 = b.execute(None, || async { Ok::<_, Error>(1) }).await;
        assert!(r1.is_ok());
        assert_eq!(b.state(), CircuitState::HalfOpen);

        let r2 = b.execute(None, || async { Ok::<_, Error>(2) }).await;
        assert!(r2.is_ok());
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let clock = ManualClock::new();
        let b = CircuitBreakerPolicy::with_clock(
            CircuitBreakerConfig::new(1, Duration::from_millis(100)),
            Arc::new(clock.clone()),
        );
        let _ = b.execute(None, || async { Err::<(), _>(Error::unavailable("down")) }).await;
        clock.advance(150);
        let _ = b.execute(None, || async { Err::<(), _>(Error::unavailable("still down")) }).await;
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn bulkhead_rejects_beyond_max_concurrent() {
        let b = CircuitBreakerPolicy::new(
            CircuitBreakerConfig::builder().max_concurrent(1).build(),
        );
        let counter = Arc::new(AtomicUsize::new(0));
        let b2 = b.clone();
        let c2 = counter.clone();
        let first = tokio::spawn(async move {
            b2.execute(None, move || {
                let c2 = c2.clone();
                async move {
                    c2.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<_, Error>(())
                }
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = b.execute(None, || async { Ok::<_, Error>(()) }).await;
        assert!(second.unwrap_err().is_bulkhead_full());
        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn timeout_counts_as_failure() {
        let b = CircuitBreakerPolicy::new(
            CircuitBreakerConfig::builder()
                .timeout(Duration::from_millis(20))
                .failure_threshold(1)
                .build(),
        );
        let result = b
            .execute(None, || async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, Error>(())
            })
            .await;
        assert!(result.unwrap_err().is_timeout());
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn timeout_override_only_tightens() {
        let b = CircuitBreakerPolicy::new(CircuitBreakerConfig::builder().timeout(Duration::from_secs(5)).build());
        let start = std::time::Instant::now();
        let result = b
            .execute(Some(Duration::from_millis(1_000_000)), || async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok::<_, Error>(())
            })
            .await;
        assert!(result.is_ok());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn reset_clears_counters_and_phase() {
        let b = breaker(1, Duration::from_secs(10));
        let _ = b.execute(None, || async { Err::<(), _>(Error::unavailable("down")) }).await;
        assert_eq!(b.state(), CircuitState::Open);
        b.reset();
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.failures(), 0);
    }

    #[tokio::test]
    async fn stats_track_totals() {
        let b = breaker(10, Duration::from_secs(10));
        let _ = b.execute(None, || async { Ok::<_, Error>(()) }).await;
        let _ = b.execute(None, || async { Err::<(), _>(Error::unavailable("x")) }).await;
        let stats = b.stats();
        assert_eq!(stats.total_calls, 2);
        assert_eq!(stats.successful, 1);
        assert_eq!(stats.failed, 1);
        assert!(stats.response_time_ewma.is_some());
    }
}
