#![forbid(unsafe_code)]

//! # meshline
//!
//! An in-process microservices communication core: a durable message
//! broker with priority queues and dead-letter handling, a circuit
//! breaker manager with bulkhead isolation and fallbacks, and a service
//! mesh controller for registry/health/load-balancing/traffic-splitting —
//! composed by one orchestration facade.
//!
//! ## Components
//!
//! - **Clock & Scheduler** ([`clock`], [`scheduler`]) — monotonic time and
//!   the periodic/delayed work every other component schedules onto.
//! - **Circuit Breaker Manager** ([`circuit_breaker`], [`circuit_breaker_registry`]) —
//!   closed/open/half-open state machine, bulkhead admission, fallback
//!   dispatch, EWMA response-time stats.
//! - **Message Broker** ([`broker`]) — priority/durable queues, pub/sub
//!   topics with filters, retry-then-DLQ semantics, batch processing.
//! - **Service Registry & Router** ([`registry`], [`rate_limit`]) —
//!   registration, health tracking, five load-balancing strategies,
//!   traffic splitting, sliding-window rate limiting.
//! - **Orchestration Facade** ([`facade`]) — composes the three above into
//!   one `route()` call: discover → split → select → execute under
//!   breaker → record outcome → retry.
//!
//! Lower-level resilience primitives ([`retry`], [`bulkhead`], [`timeout`],
//! [`backoff`], [`jitter`], [`stack`]) are the generic building blocks the
//! domain-facing managers above are built from, and remain usable
//! standalone for ad hoc call sites (e.g. a scheduler sweep or an outbound
//! health check) that don't need a named, registry-tracked breaker.
//!
//! ## Quick start
//!
//! ```rust
//! use std::sync::Arc;
//! use meshline::{
//!     CircuitBreakerManager, FacadeConfig, HealthCheckConfig, OrchestrationFacade,
//!     RouteRequest, ServiceRecord, ServiceRegistry,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), meshline::Error> {
//!     let registry = Arc::new(ServiceRegistry::new());
//!     registry.register(ServiceRecord {
//!         id: "svc-1".into(),
//!         name: "pricing".into(),
//!         version: "v1".into(),
//!         endpoints: vec!["http://127.0.0.1:9000".into()],
//!         weight: 1,
//!         metadata: Default::default(),
//!         tags: vec![],
//!         health_check: HealthCheckConfig::default(),
//!         created_at_millis: 0,
//!         last_seen_millis: 0,
//!     })?;
//!
//!     let breakers = Arc::new(CircuitBreakerManager::new());
//!     let facade = OrchestrationFacade::new(registry, breakers, FacadeConfig::default());
//!
//!     let request = RouteRequest { service: "pricing".into(), ..Default::default() };
//!     let price: u32 = facade
//!         .route(&request, |_instance| async move { Ok(4200) })
//!         .await?;
//!     assert_eq!(price, 4200);
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod broker;
pub mod bulkhead;
pub mod circuit_breaker;
pub mod circuit_breaker_registry;
pub mod clock;
pub mod error;
pub mod facade;
pub mod jitter;
pub mod rate_limit;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod sleeper;
pub mod span;
pub mod stack;
pub mod store;
pub mod telemetry;
pub mod timeout;

// Re-exports: low-level resilience primitives.
pub use backoff::Backoff;
pub use bulkhead::BulkheadPolicy;
pub use circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerConfigBuilder, CircuitBreakerPolicy, CircuitBreakerStats,
    CircuitState,
};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use error::{Error, ErrorKind, ResilienceError};
pub use jitter::Jitter;
pub use retry::{BuildError, RetryPolicy, RetryPolicyBuilder};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use stack::{ResilienceStack, ResilienceStackBuilder};
pub use timeout::{TimeoutError, TimeoutPolicy, MAX_TIMEOUT};

// Re-exports: domain-facing managers.
pub use broker::{AckResult, ConsumeOptions, MessageBroker};
pub use circuit_breaker_registry::{CircuitBreakerManager, CircuitBreakerStatus, ExecuteOptions};
pub use facade::{FacadeConfig, OrchestrationFacade, RouteRequest};
pub use rate_limit::{RateBucketSnapshot, RateLimiter};
pub use registry::{
    HealthCheckConfig, HealthState, HealthStatus, LoadBalancingState, LoadBalancingStrategy,
    RequestContext, ServicePatch, ServiceRecord, ServiceRegistry, TrafficSplitRule,
};
pub use scheduler::{CancellationToken, Scheduler, TaskHandle};
pub use span::{NoopSpan, NoopTracer, Span, Tracer, TracingSpan, TracingTracer};
pub use store::{DurableMessage, EventRecord, InMemoryStore, JsonlStore, ServiceSnapshot, Store};

pub mod prelude;
