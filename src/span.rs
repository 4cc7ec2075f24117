//! Tracing abstraction (§6). Not required for correctness — every component
//! that accepts a [`Tracer`] defaults to [`NoopTracer`] — but present so a
//! real tracing backend can be wired in without touching call sites.

use std::fmt::Display;

/// A single unit of traced work.
pub trait Span: Send {
    fn set_attr(&mut self, key: &str, value: &dyn Display);
    fn record_error(&mut self, error: &dyn std::error::Error);
    fn end(self: Box<Self>);
}

/// Starts [`Span`]s. Implementations are expected to be cheap to clone and
/// safe to share across tasks.
pub trait Tracer: Send + Sync {
    fn start_span(&self, name: &str) -> Box<dyn Span>;
}

/// A span that discards everything written to it.
pub struct NoopSpan;

impl Span for NoopSpan {
    fn set_attr(&mut self, _key: &str, _value: &dyn Display) {}
    fn record_error(&mut self, _error: &dyn std::error::Error) {}
    fn end(self: Box<Self>) {}
}

/// Tracer that produces only [`NoopSpan`]s. The default everywhere a
/// `Tracer` is accepted.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopTracer;

impl Tracer for NoopTracer {
    fn start_span(&self, _name: &str) -> Box<dyn Span> {
        Box::new(NoopSpan)
    }
}

/// Span backed by a `tracing::Span`, so attributes and errors land in
/// whatever subscriber the process has installed. `tracing` fields must be
/// named statically, so attributes set after the span opens are logged as
/// events scoped to it rather than recorded onto the span itself.
pub struct TracingSpan {
    span: tracing::Span,
    _entered: tracing::span::EnteredSpan,
}

impl Span for TracingSpan {
    fn set_attr(&mut self, key: &str, value: &dyn Display) {
        tracing::debug!(parent: &self.span, attr.key = %key, attr.value = %value, "span attribute");
    }

    fn record_error(&mut self, error: &dyn std::error::Error) {
        tracing::error!(parent: &self.span, error = %error, "span recorded error");
    }

    fn end(self: Box<Self>) {
        drop(self);
    }
}

/// Tracer that opens real `tracing` spans.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingTracer;

impl Tracer for TracingTracer {
    fn start_span(&self, name: &str) -> Box<dyn Span> {
        let span = tracing::info_span!("span", name = %name);
        let entered = span.clone().entered();
        Box::new(TracingSpan { span, _entered: entered })
    }
}
