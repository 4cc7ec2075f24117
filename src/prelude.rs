//! Convenient re-exports of the types most call sites need.
pub use crate::{
    backoff::Backoff,
    bulkhead::BulkheadPolicy,
    circuit_breaker::{CircuitBreakerConfig, CircuitBreakerPolicy, CircuitBreakerStats, CircuitState},
    circuit_breaker_registry::{CircuitBreakerManager, CircuitBreakerStatus, ExecuteOptions},
    clock::{Clock, ManualClock, MonotonicClock},
    error::{Error, ErrorKind, ResilienceError},
    facade::{FacadeConfig, OrchestrationFacade, RouteRequest},
    jitter::Jitter,
    rate_limit::{RateBucketSnapshot, RateLimiter},
    registry::{
        HealthCheckConfig, HealthState, HealthStatus, LoadBalancingState, LoadBalancingStrategy,
        RequestContext, ServicePatch, ServiceRecord, ServiceRegistry, TrafficSplitRule,
    },
    retry::{BuildError, RetryPolicy, RetryPolicyBuilder},
    telemetry::{
        BulkheadEvent, CircuitBreakerEvent, DlqEvent, FallbackSink, LogSink, MemorySink,
        MulticastSink, NullSink, PolicyEvent, QueueEvent, RegistryEvent, RequestOutcome,
        RetryEvent, RouterEvent, StreamingSink, TelemetrySink, TimeoutEvent, TopicEvent,
    },
    timeout::{TimeoutError, TimeoutPolicy, MAX_TIMEOUT},
    broker::{AckResult, ConsumeOptions, MessageBroker},
};
