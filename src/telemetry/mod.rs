//! Telemetry and observability events for the resilience and mesh layers.
//!
//! This module provides the event system that lets policies and domain
//! managers emit structured telemetry. Events flow through `TelemetrySink`
//! implementations which can log, aggregate, or forward events elsewhere.
//!
//! # Event Types
//!
//! - **Retry**: `RetryAttempt`, `RetryExhausted`
//! - **Circuit Breaker**: `CircuitOpened`, `CircuitClosed`, `CircuitHalfOpen`
//! - **Bulkhead**: `BulkheadAcquired`, `BulkheadRejected`
//! - **Timeout**: `TimeoutOccurred`
//! - **Queue/Topic/Dlq/Registry/Router**: broker and mesh-side events
//! - **All policies**: `RequestSuccess`, `RequestFailure`
//!
//! # Telemetry Sinks
//!
//! The `TelemetrySink` trait defines how events are consumed. It's implemented
//! as a `tower::Service<PolicyEvent>` for composability.

pub mod events;
pub mod sinks;

pub use events::{
    BulkheadEvent, CircuitBreakerEvent, DlqEvent, PolicyEvent, QueueEvent, RegistryEvent,
    RequestOutcome, RetryEvent, RouterEvent, TimeoutEvent, TopicEvent,
};
pub use sinks::{
    emit_best_effort, ComposedSinkError, FallbackSink, LogSink, MemorySink, MulticastSink,
    NonBlockingSink, NullSink, StreamingSink, TelemetrySink,
};

#[cfg(test)]
mod tests {
    // Note: Tests have been moved to submodules (events.rs and sinks.rs)
}