//! Named registry of circuit breakers: the `CircuitBreakerManager` the
//! orchestration facade and callers talk to.

use crate::circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerPolicy, CircuitBreakerStats, CircuitState,
};
use crate::clock::{Clock, MonotonicClock};
use crate::error::Error;
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Point-in-time view of one breaker, returned by `status(name)`.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerStatus {
    pub phase: CircuitState,
    pub failures: usize,
    pub successes: usize,
    pub in_flight: usize,
    pub stats: CircuitBreakerStats,
}

/// Per-call options for `CircuitBreakerManager::execute`.
pub struct ExecuteOptions<T> {
    fallback: Option<Box<dyn FnOnce() -> BoxFuture<'static, Result<T, Error>> + Send>>,
    timeout_override: Option<Duration>,
}

impl<T> Default for ExecuteOptions<T> {
    fn default() -> Self {
        Self { fallback: None, timeout_override: None }
    }
}

impl<T> ExecuteOptions<T> {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_timeout_override(mut self, d: Duration) -> Self {
        self.timeout_override = Some(d);
        self
    }

    pub fn with_fallback<F, Fut>(mut self, fallback: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
    {
        self.fallback = Some(Box::new(move || Box::pin(fallback())));
        self
    }
}

/// Owns every named breaker and dispatches `execute` calls through the right
/// one, applying fallback dispatch on rejection/failure when configured.
pub struct CircuitBreakerManager {
    breakers: DashMap<String, CircuitBreakerPolicy>,
    clock: Arc<dyn Clock>,
}

impl Default for CircuitBreakerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreakerManager {
    pub fn new() -> Self {
        Self { breakers: DashMap::new(), clock: Arc::new(MonotonicClock::default()) }
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { breakers: DashMap::new(), clock }
    }

    /// Registers a breaker under `name`. Fails with `ALREADY_EXISTS` if one
    /// is already registered under that name.
    pub fn create(&self, name: impl Into<String>, config: CircuitBreakerConfig) -> Result<(), Error> {
        let name = name.into();
        if self.breakers.contains_key(&name) {
            return Err(Error::already_exists(format!("circuit breaker '{name}' already exists")));
        }
        self.breakers
            .insert(name, CircuitBreakerPolicy::with_clock(config, self.clock.clone()));
        Ok(())
    }

    /// Forces `name` back to closed and clears its counters.
    pub fn reset(&self, name: &str) -> Result<(), Error> {
        let breaker = self.get(name)?;
        breaker.reset();
        Ok(())
    }

    /// Snapshot of state and stats for `name`.
    pub fn status(&self, name: &str) -> Result<CircuitBreakerStatus, Error> {
        let breaker = self.get(name)?;
        Ok(CircuitBreakerStatus {
            phase: breaker.state(),
            failures: breaker.failures(),
            successes: breaker.successes(),
            in_flight: breaker.in_flight(),
            stats: breaker.stats(),
        })
    }

    pub fn remove(&self, name: &str) -> Result<(), Error> {
        self.breakers
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(format!("circuit breaker '{name}' not found")))
    }

    fn get(&self, name: &str) -> Result<CircuitBreakerPolicy, Error> {
        self.breakers
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::not_found(format!("circuit breaker '{name}' not found")))
    }

    /// Runs `operation` under breaker `name`. On rejection (`CIRCUIT_OPEN` /
    /// `BULKHEAD_FULL`) or failure, invokes `opts.fallback` if provided and
    /// returns its result as success; the breaker's own stats still record
    /// the rejection/failure cause.
    pub async fn execute<T, Fut, Op>(
        &self,
        name: &str,
        operation: Op,
        opts: ExecuteOptions<T>,
    ) -> Result<T, Error>
    where
        T: Send,
        Fut: Future<Output = Result<T, Error>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        let breaker = self.get(name)?;
        match breaker.execute(opts.timeout_override, operation).await {
            Ok(v) => Ok(v),
            Err(e) => match opts.fallback {
                Some(fallback) => fallback().await,
                None => Err(e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn create_rejects_duplicate_name() {
        let mgr = CircuitBreakerManager::new();
        mgr.create("svc1", CircuitBreakerConfig::default()).unwrap();
        let err = mgr.create("svc1", CircuitBreakerConfig::default()).unwrap_err();
        assert!(err.is_already_exists());
    }

    #[test]
    fn status_of_unknown_name_is_not_found() {
        let mgr = CircuitBreakerManager::new();
        assert!(mgr.status("nope").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn execute_runs_operation_through_named_breaker() {
        let mgr = CircuitBreakerManager::new();
        mgr.create("svc1", CircuitBreakerConfig::default()).unwrap();
        let result = mgr
            .execute("svc1", || async { Ok::<_, Error>(7) }, ExecuteOptions::none())
            .await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn execute_unknown_breaker_is_not_found() {
        let mgr = CircuitBreakerManager::new();
        let result = mgr
            .execute("ghost", || async { Ok::<_, Error>(()) }, ExecuteOptions::none())
            .await;
        assert!(result.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn fallback_runs_when_breaker_rejects() {
        let mgr = CircuitBreakerManager::new();
        mgr.create(
            "svc1",
            CircuitBreakerConfig::builder()
                .failure_threshold(1)
                .recovery_timeout(Duration::from_secs(60))
                .build(),
        )
        .unwrap();
        let _ = mgr
            .execute("svc1", || async { Err::<(), _>(Error::unavailable("down")) }, ExecuteOptions::none())
            .await;

        let result = mgr
            .execute(
                "svc1",
                || async { Ok::<_, Error>(1) },
                ExecuteOptions::none().with_fallback(|| async { Ok::<_, Error>(99) }),
            )
            .await;
        assert_eq!(result.unwrap(), 99);
    }

    #[tokio::test]
    async fn reset_reopens_admission() {
        let mgr = CircuitBreakerManager::new();
        mgr.create("svc1", CircuitBreakerConfig::builder().failure_threshold(1).build()).unwrap();
        let _ = mgr
            .execute("svc1", || async { Err::<(), _>(Error::unavailable("down")) }, ExecuteOptions::none())
            .await;
        assert!(mgr.status("svc1").unwrap().phase == CircuitState::Open);
        mgr.reset("svc1").unwrap();
        assert!(mgr.status("svc1").unwrap().phase == CircuitState::Closed);
    }
}
