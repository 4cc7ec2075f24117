use std::time::Duration;
use std::fmt;

#[cfg(feature = "telemetry-json")]
use serde_json::json;

/// Policy events emitted during execution.
///
/// Every resilience policy and domain manager emits structured events that describe its behavior.
/// These events can be collected, aggregated, and used for observability,
/// monitoring, or autonomous control.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyEvent {
    /// Retry policy events
    Retry(RetryEvent),
    /// Circuit breaker events
    CircuitBreaker(CircuitBreakerEvent),
    /// Bulkhead events
    Bulkhead(BulkheadEvent),
    /// Timeout events
    Timeout(TimeoutEvent),
    /// Request outcome events (emitted by all policies)
    Request(RequestOutcome),
    /// Broker queue events
    Queue(QueueEvent),
    /// Broker topic/subscription events
    Topic(TopicEvent),
    /// Dead-letter queue events
    Dlq(DlqEvent),
    /// Service registry events
    Registry(RegistryEvent),
    /// Router/facade events
    Router(RouterEvent),
}

/// Events emitted by priority queues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    /// A message was enqueued.
    Published { queue: String, priority: u8, depth: usize },
    /// A message was rejected because the queue was at capacity.
    Rejected { queue: String, depth: usize, capacity: usize },
    /// A message was handed to a consumer.
    Delivered { queue: String, attempt: usize },
    /// A consumer acknowledged a message.
    Acked { queue: String },
    /// A message's visibility timeout elapsed without an ack and it was redelivered.
    AckTimeout { queue: String, attempt: usize },
}

/// Events emitted by pub/sub topics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicEvent {
    /// A message was published to a topic.
    Published { topic: String, subscriber_count: usize },
    /// A message was delivered to a subscriber.
    Delivered { topic: String, subscriber: String },
    /// A message was dropped by a subscriber's filter.
    Filtered { topic: String, subscriber: String },
}

/// Events emitted by the dead-letter queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DlqEvent {
    /// A message exhausted its retry budget and was moved to the DLQ.
    Moved { queue: String, attempts: usize },
    /// A message was replayed from the DLQ back onto its source queue.
    Replayed { queue: String },
    /// A message aged out of the DLQ retention window and was purged.
    Purged { queue: String, count: usize },
}

/// Events emitted by the service registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// An instance registered under a service name.
    InstanceRegistered { service: String, instance: String },
    /// An instance was deregistered.
    InstanceDeregistered { service: String, instance: String },
    /// A health check changed an instance's status.
    HealthChanged { service: String, instance: String, healthy: bool },
}

/// Events emitted by the router/facade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterEvent {
    /// An instance was selected for a routed call.
    Selected { service: String, instance: String, strategy: &'static str },
    /// A request was rejected by the rate limiter before routing.
    RateLimited { client: String },
    /// A routed call was retried against a freshly selected instance.
    Retried { service: String, attempt: usize },
}

/// Events emitted by retry policies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryEvent {
    /// A retry attempt is about to be made.
    ///
    /// Emitted before sleeping and retrying a failed request.
    Attempt {
        /// The attempt number (1-indexed)
        attempt: usize,
        /// The backoff delay before this retry
        delay: Duration,
    },
    /// All retry attempts have been exhausted.
    ///
    /// Emitted when the maximum number of retries is reached
    /// and the request still fails.
    Exhausted {
        /// Total number of attempts made
        total_attempts: usize,
        /// Total time spent retrying
        total_duration: Duration,
    },
}

/// Events emitted by circuit breaker policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerEvent {
    /// Circuit transitioned to open state.
    ///
    /// Subsequent requests will be rejected immediately without
    /// being forwarded to the inner service.
    Opened {
        /// Number of consecutive failures that triggered the open
        failure_count: usize,
    },
    /// Circuit transitioned to half-open state.
    ///
    /// A limited number of test requests will be allowed through
    /// to determine if the inner service has recovered.
    HalfOpen,
    /// Circuit transitioned to closed state.
    ///
    /// Normal operation resumes - all requests are forwarded.
    Closed,
}

/// Events emitted by bulkhead policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkheadEvent {
    /// A request successfully acquired a bulkhead permit.
    ///
    /// The request will proceed to the inner service.
    Acquired {
        /// Current number of active requests
        active_count: usize,
        /// Maximum concurrency limit
        max_concurrency: usize,
    },
    /// A request was rejected due to bulkhead saturation.
    ///
    /// All available permits are in use.
    Rejected {
        /// Current number of active requests
        active_count: usize,
        /// Maximum concurrency limit
        max_concurrency: usize,
    },
}

/// Events emitted by timeout policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutEvent {
    /// A request exceeded the timeout duration.
    ///
    /// The request was cancelled and an error returned.
    Occurred {
        /// The timeout duration that was exceeded
        timeout: Duration,
    },
}

/// Request outcome events emitted by all policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Request completed successfully.
    Success {
        /// Time taken to complete the request
        duration: Duration,
    },
    /// Request failed with an error.
    Failure {
        /// Time taken before failure
        duration: Duration,
    },
}

impl fmt::Display for PolicyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyEvent::Retry(event) => write!(f, "Retry::{}", event),
            PolicyEvent::CircuitBreaker(event) => write!(f, "CircuitBreaker::{}", event),
            PolicyEvent::Bulkhead(event) => write!(f, "Bulkhead::{}", event),
            PolicyEvent::Timeout(event) => write!(f, "Timeout::{}", event),
            PolicyEvent::Request(event) => write!(f, "Request::{}", event),
            PolicyEvent::Queue(event) => write!(f, "Queue::{}", event),
            PolicyEvent::Topic(event) => write!(f, "Topic::{}", event),
            PolicyEvent::Dlq(event) => write!(f, "Dlq::{}", event),
            PolicyEvent::Registry(event) => write!(f, "Registry::{}", event),
            PolicyEvent::Router(event) => write!(f, "Router::{}", event),
        }
    }
}

impl fmt::Display for QueueEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueEvent::Published { queue, priority, depth } => {
                write!(f, "Published(queue={}, priority={}, depth={})", queue, priority, depth)
            }
            QueueEvent::Rejected { queue, depth, capacity } => {
                write!(f, "Rejected(queue={}, {}/{})", queue, depth, capacity)
            }
            QueueEvent::Delivered { queue, attempt } => {
                write!(f, "Delivered(queue={}, attempt={})", queue, attempt)
            }
            QueueEvent::Acked { queue } => write!(f, "Acked(queue={})", queue),
            QueueEvent::AckTimeout { queue, attempt } => {
                write!(f, "AckTimeout(queue={}, attempt={})", queue, attempt)
            }
        }
    }
}

impl fmt::Display for TopicEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicEvent::Published { topic, subscriber_count } => {
                write!(f, "Published(topic={}, subscribers={})", topic, subscriber_count)
            }
            TopicEvent::Delivered { topic, subscriber } => {
                write!(f, "Delivered(topic={}, subscriber={})", topic, subscriber)
            }
            TopicEvent::Filtered { topic, subscriber } => {
                write!(f, "Filtered(topic={}, subscriber={})", topic, subscriber)
            }
        }
    }
}

impl fmt::Display for DlqEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DlqEvent::Moved { queue, attempts } => {
                write!(f, "Moved(queue={}, attempts={})", queue, attempts)
            }
            DlqEvent::Replayed { queue } => write!(f, "Replayed(queue={})", queue),
            DlqEvent::Purged { queue, count } => write!(f, "Purged(queue={}, count={})", queue, count),
        }
    }
}

impl fmt::Display for RegistryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryEvent::InstanceRegistered { service, instance } => {
                write!(f, "InstanceRegistered(service={}, instance={})", service, instance)
            }
            RegistryEvent::InstanceDeregistered { service, instance } => {
                write!(f, "InstanceDeregistered(service={}, instance={})", service, instance)
            }
            RegistryEvent::HealthChanged { service, instance, healthy } => {
                write!(f, "HealthChanged(service={}, instance={}, healthy={})", service, instance, healthy)
            }
        }
    }
}

impl fmt::Display for RouterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouterEvent::Selected { service, instance, strategy } => {
                write!(f, "Selected(service={}, instance={}, strategy={})", service, instance, strategy)
            }
            RouterEvent::RateLimited { client } => write!(f, "RateLimited(client={})", client),
            RouterEvent::Retried { service, attempt } => {
                write!(f, "Retried(service={}, attempt={})", service, attempt)
            }
        }
    }
}

impl fmt::Display for RetryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryEvent::Attempt { attempt, delay } => {
                write!(f, "Attempt(#{}, delay={:?})", attempt, delay)
            }
            RetryEvent::Exhausted { total_attempts, total_duration } => {
                write!(f, "Exhausted(attempts={}, duration={:?})", total_attempts, total_duration)
            }
        }
    }
}

impl fmt::Display for CircuitBreakerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitBreakerEvent::Opened { failure_count } => {
                write!(f, "Opened(failures={})", failure_count)
            }
            CircuitBreakerEvent::HalfOpen => write!(f, "HalfOpen"),
            CircuitBreakerEvent::Closed => write!(f, "Closed"),
        }
    }
}

impl fmt::Display for BulkheadEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BulkheadEvent::Acquired { active_count, max_concurrency } => {
                write!(f, "Acquired({}/{})", active_count, max_concurrency)
            }
            BulkheadEvent::Rejected { active_count, max_concurrency } => {
                write!(f, "Rejected({}/{})", active_count, max_concurrency)
            }
        }
    }
}

impl fmt::Display for TimeoutEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutEvent::Occurred { timeout } => write!(f, "Occurred(timeout={:?})", timeout),
        }
    }
}

impl fmt::Display for RequestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestOutcome::Success { duration } => write!(f, "Success(duration={:?})", duration),
            RequestOutcome::Failure { duration } => write!(f, "Failure(duration={:?})", duration),
        }
    }
}

#[cfg_attr(not(feature = "telemetry-json"), allow(dead_code))]
#[inline]
fn clamp_u64(val: u128) -> u64 {
    val.min(u128::from(u64::MAX)) as u64
}

/// Convert a PolicyEvent into a JSON value for sinks.
#[cfg(feature = "telemetry-json")]
pub fn event_to_json(event: &PolicyEvent) -> serde_json::Value {
    match event {
        PolicyEvent::Retry(r) => match r {
            RetryEvent::Attempt { attempt, delay } => json!({
                "kind": "retry_attempt",
                "attempt": *attempt,
                "delay_ms": clamp_u64(delay.as_millis()),
            }),
            RetryEvent::Exhausted { total_attempts, total_duration } => json!({
                "kind": "retry_exhausted",
                "attempts": *total_attempts,
                "duration_ms": clamp_u64(total_duration.as_millis()),
            }),
        },
        PolicyEvent::CircuitBreaker(c) => match c {
            CircuitBreakerEvent::Opened { failure_count } => {
                json!({ "kind": "circuit_opened", "failures": *failure_count })
            }
            CircuitBreakerEvent::HalfOpen => json!({ "kind": "circuit_half_open" }),
            CircuitBreakerEvent::Closed => json!({ "kind": "circuit_closed" }),
        },
        PolicyEvent::Bulkhead(b) => match b {
            BulkheadEvent::Acquired { active_count, max_concurrency } => json!({
                "kind": "bulkhead_acquired",
                "active": *active_count,
                "max": *max_concurrency
            }),
            BulkheadEvent::Rejected { active_count, max_concurrency } => json!({
                "kind": "bulkhead_rejected",
                "active": *active_count,
                "max": *max_concurrency
            }),
        },
        PolicyEvent::Timeout(t) => match t {
            TimeoutEvent::Occurred { timeout } => json!({
                "kind": "timeout",
                "timeout_ms": clamp_u64(timeout.as_millis())
            }),
        },
        PolicyEvent::Request(r) => match r {
            RequestOutcome::Success { duration } => json!({
                "kind": "request_success",
                "duration_ms": clamp_u64(duration.as_millis())
            }),
            RequestOutcome::Failure { duration } => json!({
                "kind": "request_failure",
                "duration_ms": clamp_u64(duration.as_millis())
            }),
        },
        PolicyEvent::Queue(q) => match q {
            QueueEvent::Published { queue, priority, depth } => json!({
                "kind": "queue_published", "queue": queue, "priority": *priority, "depth": *depth
            }),
            QueueEvent::Rejected { queue, depth, capacity } => json!({
                "kind": "queue_rejected", "queue": queue, "depth": *depth, "capacity": *capacity
            }),
            QueueEvent::Delivered { queue, attempt } => json!({
                "kind": "queue_delivered", "queue": queue, "attempt": *attempt
            }),
            QueueEvent::Acked { queue } => json!({ "kind": "queue_acked", "queue": queue }),
            QueueEvent::AckTimeout { queue, attempt } => json!({
                "kind": "queue_ack_timeout", "queue": queue, "attempt": *attempt
            }),
        },
        PolicyEvent::Topic(t) => match t {
            TopicEvent::Published { topic, subscriber_count } => json!({
                "kind": "topic_published", "topic": topic, "subscribers": *subscriber_count
            }),
            TopicEvent::Delivered { topic, subscriber } => json!({
                "kind": "topic_delivered", "topic": topic, "subscriber": subscriber
            }),
            TopicEvent::Filtered { topic, subscriber } => json!({
                "kind": "topic_filtered", "topic": topic, "subscriber": subscriber
            }),
        },
        PolicyEvent::Dlq(d) => match d {
            DlqEvent::Moved { queue, attempts } => json!({
                "kind": "dlq_moved", "queue": queue, "attempts": *attempts
            }),
            DlqEvent::Replayed { queue } => json!({ "kind": "dlq_replayed", "queue": queue }),
            DlqEvent::Purged { queue, count } => json!({
                "kind": "dlq_purged", "queue": queue, "count": *count
            }),
        },
        PolicyEvent::Registry(r) => match r {
            RegistryEvent::InstanceRegistered { service, instance } => json!({
                "kind": "registry_instance_registered", "service": service, "instance": instance
            }),
            RegistryEvent::InstanceDeregistered { service, instance } => json!({
                "kind": "registry_instance_deregistered", "service": service, "instance": instance
            }),
            RegistryEvent::HealthChanged { service, instance, healthy } => json!({
                "kind": "registry_health_changed", "service": service, "instance": instance, "healthy": *healthy
            }),
        },
        PolicyEvent::Router(r) => match r {
            RouterEvent::Selected { service, instance, strategy } => json!({
                "kind": "router_selected", "service": service, "instance": instance, "strategy": *strategy
            }),
            RouterEvent::RateLimited { client } => json!({
                "kind": "router_rate_limited", "client": client
            }),
            RouterEvent::Retried { service, attempt } => json!({
                "kind": "router_retried", "service": service, "attempt": *attempt
            }),
        },
    }
}

#[cfg(all(test, feature = "telemetry-json"))]
mod json_tests {
    use super::*;

    #[test]
    fn retry_attempt_json() {
        let v = event_to_json(&PolicyEvent::Retry(RetryEvent::Attempt {
            attempt: 3,
            delay: Duration::from_millis(150),
        }));
        assert_eq!(v["kind"], "retry_attempt");
        assert_eq!(v["attempt"], 3);
        assert_eq!(v["delay_ms"], 150);
    }

    #[test]
    fn retry_exhausted_json() {
        let v = event_to_json(&PolicyEvent::Retry(RetryEvent::Exhausted {
            total_attempts: 5,
            total_duration: Duration::from_millis(1200),
        }));
        assert_eq!(v["kind"], "retry_exhausted");
        assert_eq!(v["attempts"], 5);
        assert_eq!(v["duration_ms"], 1200);
    }

    #[test]
    fn circuit_opened_json() {
        let v = event_to_json(&PolicyEvent::CircuitBreaker(CircuitBreakerEvent::Opened {
            failure_count: 4,
        }));
        assert_eq!(v["kind"], "circuit_opened");
        assert_eq!(v["failures"], 4);
    }

    #[test]
    fn circuit_half_open_json() {
        let v = event_to_json(&PolicyEvent::CircuitBreaker(CircuitBreakerEvent::HalfOpen));
        assert_eq!(v["kind"], "circuit_half_open");
    }

    #[test]
    fn circuit_closed_json() {
        let v = event_to_json(&PolicyEvent::CircuitBreaker(CircuitBreakerEvent::Closed));
        assert_eq!(v["kind"], "circuit_closed");
    }

    #[test]
    fn bulkhead_acquired_json() {
        let v = event_to_json(&PolicyEvent::Bulkhead(BulkheadEvent::Acquired {
            active_count: 2,
            max_concurrency: 5,
        }));
        assert_eq!(v["kind"], "bulkhead_acquired");
        assert_eq!(v["active"], 2);
        assert_eq!(v["max"], 5);
    }

    #[test]
    fn bulkhead_rejected_json() {
        let v = event_to_json(&PolicyEvent::Bulkhead(BulkheadEvent::Rejected {
            active_count: 5,
            max_concurrency: 5,
        }));
        assert_eq!(v["kind"], "bulkhead_rejected");
        assert_eq!(v["active"], 5);
        assert_eq!(v["max"], 5);
    }

    #[test]
    fn timeout_json() {
        let v = event_to_json(&PolicyEvent::Timeout(TimeoutEvent::Occurred {
            timeout: Duration::from_millis(2500),
        }));
        assert_eq!(v["kind"], "timeout");
        assert_eq!(v["timeout_ms"], 2500);
    }

    #[test]
    fn request_success_json() {
        let v = event_to_json(&PolicyEvent::Request(RequestOutcome::Success {
            duration: Duration::from_millis(42),
        }));
        assert_eq!(v["kind"], "request_success");
        assert_eq!(v["duration_ms"], 42);
    }

    #[test]
    fn request_failure_json() {
        let v = event_to_json(&PolicyEvent::Request(RequestOutcome::Failure {
            duration: Duration::from_millis(99),
        }));
        assert_eq!(v["kind"], "request_failure");
        assert_eq!(v["duration_ms"], 99);
    }

    #[test]
    fn telemetry_json_contains_no_auth_fields() {
        let v = event_to_json(&PolicyEvent::Request(RequestOutcome::Success {
            duration: Duration::from_millis(1),
        }));
        let s = serde_json::to_string(&v).unwrap();
        assert!(
            !s.contains("auth"),
            "telemetry JSON should not carry auth payloads; got {s}"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_event_display() {
        let event = RetryEvent::Attempt { attempt: 2, delay: Duration::from_millis(100) };
        assert!(event.to_string().contains("Attempt"));
        assert!(event.to_string().contains("#2"));
    }

    #[test]
    fn test_circuit_breaker_event_display() {
        let event = CircuitBreakerEvent::Opened { failure_count: 5 };
        assert!(event.to_string().contains("Opened"));
        assert!(event.to_string().contains("5"));
    }

    #[test]
    fn test_bulkhead_event_display() {
        let event = BulkheadEvent::Rejected { active_count: 10, max_concurrency: 10 };
        assert!(event.to_string().contains("Rejected"));
        assert!(event.to_string().contains("10/10"));
    }

    #[test]
    fn test_policy_event_clone() {
        let event = PolicyEvent::Retry(RetryEvent::Attempt {
            attempt: 1,
            delay: Duration::from_millis(50),
        });
        let cloned = event.clone();
        assert_eq!(event, cloned);
    }

    #[test]
    fn test_policy_event_request_variants_display() {
        let ok =
            PolicyEvent::Request(RequestOutcome::Success { duration: Duration::from_millis(5) });
        let err =
            PolicyEvent::Request(RequestOutcome::Failure { duration: Duration::from_millis(7) });
        assert!(format!("{}", ok).contains("Success"));
        assert!(format!("{}", err).contains("Failure"));
    }

    #[test]
    fn test_queue_event_display() {
        let e = QueueEvent::Rejected { queue: "orders".into(), depth: 100, capacity: 100 };
        let s = e.to_string();
        assert!(s.contains("orders"));
        assert!(s.contains("100/100"));
    }

    #[test]
    fn test_registry_event_display() {
        let e = RegistryEvent::HealthChanged {
            service: "payments".into(),
            instance: "payments-1".into(),
            healthy: false,
        };
        assert!(e.to_string().contains("payments-1"));
        assert!(e.to_string().contains("healthy=false"));
    }

    #[test]
    fn test_router_event_display() {
        let e = RouterEvent::Selected {
            service: "payments".into(),
            instance: "payments-2".into(),
            strategy: "round_robin",
        };
        assert!(e.to_string().contains("round_robin"));
    }
}
