//! Orchestration facade (§4.5): composes the service registry, circuit
//! breaker manager, and message broker around one `route()` call, exactly
//! as the Data Flow in §2 describes — discover, split, select, execute
//! under breaker, record outcome, retry on retryable failure by re-running
//! the whole selection step.
//!
//! Shares the "compose named policies around one call" shape of
//! [`crate::stack::ResilienceStack`], and keeps breaker state and
//! discoverability in sync via the registry's own
//! `set_breaker_open`/`discover` pairing.

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::circuit_breaker_registry::{CircuitBreakerManager, CircuitBreakerStatus, ExecuteOptions};
use crate::clock::{Clock, MonotonicClock};
use crate::error::Error;
use crate::rate_limit::RateLimiter;
use crate::registry::{LoadBalancingStrategy, RequestContext, ServiceRecord, ServiceRegistry};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// One inbound call to be routed to a healthy instance of `service`.
#[derive(Debug, Clone, Default)]
pub struct RouteRequest {
    pub service: String,
    pub client_key: Option<String>,
    pub ctx: RequestContext,
}

/// Facade-wide tunables; everything else is per-component config set up
/// directly on the registry/breaker-manager/broker before `route` is used.
#[derive(Debug, Clone)]
pub struct FacadeConfig {
    pub strategy: LoadBalancingStrategy,
    pub max_retries: usize,
    pub rate_limit_per_minute: Option<u32>,
    pub breaker_defaults: CircuitBreakerConfig,
}

impl Default for FacadeConfig {
    fn default() -> Self {
        Self {
            strategy: LoadBalancingStrategy::RoundRobin,
            max_retries: 2,
            rate_limit_per_minute: None,
            breaker_defaults: CircuitBreakerConfig::default(),
        }
    }
}

/// Composes registry discovery/selection, per-instance circuit breakers,
/// and (optionally) router-level rate limiting around one call.
pub struct OrchestrationFacade {
    registry: Arc<ServiceRegistry>,
    breakers: Arc<CircuitBreakerManager>,
    rate_limiter: Option<RateLimiter>,
    config: FacadeConfig,
    clock: Arc<dyn Clock>,
}

impl OrchestrationFacade {
    pub fn new(registry: Arc<ServiceRegistry>, breakers: Arc<CircuitBreakerManager>, config: FacadeConfig) -> Self {
        Self::with_clock(registry, breakers, config, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(
        registry: Arc<ServiceRegistry>,
        breakers: Arc<CircuitBreakerManager>,
        config: FacadeConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let rate_limiter = config
            .rate_limit_per_minute
            .map(|n| RateLimiter::with_clock(n, clock.clone()));
        Self { registry, breakers, rate_limiter, config, clock }
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn breakers(&self) -> &CircuitBreakerManager {
        &self.breakers
    }

    /// `route(request) =` the seven-step pipeline from §4.5. `call` sends
    /// the request to the instance the facade selected; it is invoked once
    /// per attempt (up to `1 + config.max_retries` times), freshly
    /// re-selecting an instance on every retryable failure.
    pub async fn route<T, Fut, F>(&self, request: &RouteRequest, call: F) -> Result<T, Error>
    where
        T: Send,
        Fut: Future<Output = Result<T, Error>> + Send,
        F: Fn(ServiceRecord) -> Fut + Send + Sync,
    {
        if let Some(limiter) = &self.rate_limiter {
            let key = request.client_key.as_deref().unwrap_or(&request.service);
            limiter.check(key)?;
        }

        let mut last_err: Option<Error> = None;

        for attempt in 0..=self.config.max_retries {
            let candidates = self.registry.discover(&request.service);
            if candidates.is_empty() {
                return Err(Error::no_healthy_instances(format!(
                    "no healthy instances for service '{}'",
                    request.service
                )));
            }
            let candidates = self.registry.apply_traffic_split(&request.service, candidates);
            let instance =
                self.registry
                    .select_instance(&request.service, &candidates, self.config.strategy, Some(&request.ctx))?;

            self.ensure_breaker(&instance.id);
            self.registry.on_request_start(&instance.id);

            let start = self.clock.now_millis();
            let call = &call;
            let instance_for_call = instance.clone();
            let result = self
                .breakers
                .execute(
                    &instance.id,
                    move || call(instance_for_call),
                    ExecuteOptions::none(),
                )
                .await;
            let elapsed = Duration::from_millis(self.clock.now_millis().saturating_sub(start));

            self.registry.on_request_end(&instance.id);
            let success = result.is_ok();
            let _ = self.registry.record_outcome(&instance.id, success, elapsed);
            self.sync_breaker_open(&instance.id);

            match result {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let retryable = err.is_retryable_default();
                    last_err = Some(err);
                    if !retryable || attempt == self.config.max_retries {
                        break;
                    }
                    tracing::debug!(service = %request.service, attempt, "retrying on retryable error");
                }
            }
        }

        Err(last_err.unwrap_or_else(|| Error::internal("route exhausted with no recorded error")))
    }

    /// Lazily registers a breaker for an instance the first time it is
    /// routed to; a pre-existing breaker (created by the caller with custom
    /// config) is left untouched.
    fn ensure_breaker(&self, instance_id: &str) {
        match self.breakers.create(instance_id, self.config.breaker_defaults.clone()) {
            Ok(()) | Err(_) => {}
        }
    }

    fn sync_breaker_open(&self, instance_id: &str) {
        if let Ok(CircuitBreakerStatus { phase, .. }) = self.breakers.status(instance_id) {
            self.registry
                .set_breaker_open(instance_id, phase == crate::circuit_breaker::CircuitState::Open);
        }
    }
}
