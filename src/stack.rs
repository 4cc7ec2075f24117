//! Generic composition of the ambient resilience primitives: retry wraps
//! bulkhead wraps timeout wraps the caller's operation.
//!
//! This stack is deliberately narrow — it has no notion of a named circuit
//! breaker, because breakers here are addressed by name through
//! [`crate::circuit_breaker_registry::CircuitBreakerManager`] rather than
//! embedded in a generic, per-call-site layer. Use `ResilienceStack` for
//! retry/bulkhead/timeout composition around a single operation (e.g. a
//! scheduler sweep or an outbound health check); use the manager directly
//! when the operation already targets a registered service.

use crate::{Backoff, BulkheadPolicy, Jitter, ResilienceError, RetryPolicy, TimeoutPolicy};
use std::future::Future;
use std::time::Duration;

#[derive(Clone)]
pub struct ResilienceStack<E> {
    pub(crate) timeout: TimeoutPolicy,
    pub(crate) bulkhead: BulkheadPolicy,
    pub(crate) retry: RetryPolicy<E>,
}

impl<E> ResilienceStack<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn builder() -> ResilienceStackBuilder<E> {
        ResilienceStackBuilder::new()
    }

    /// Runs `operation` through retry → bulkhead → timeout, retrying only
    /// when the innermost error is retryable and an attempt budget remains.
    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        use std::sync::{Arc, Mutex};

        let op_cell = Arc::new(Mutex::new(operation));

        self.retry
            .execute(|| {
                let op = op_cell.clone();
                let bulkhead = self.bulkhead.clone();
                let timeout = self.timeout.clone();
                async move {
                    bulkhead
                        .execute(|| {
                            let op = op.clone();
                            let timeout = timeout.clone();
                            async move {
                                timeout
                                    .execute(|| {
                                        let mut op = op.lock().unwrap_or_else(|p| p.into_inner());
                                        op()
                                    })
                                    .await
                            }
                        })
                        .await
                }
            })
            .await
    }
}

impl<E> Default for ResilienceStack<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        ResilienceStackBuilder::new().build()
    }
}

pub struct ResilienceStackBuilder<E> {
    timeout: Option<TimeoutPolicy>,
    bulkhead: Option<BulkheadPolicy>,
    retry: Option<RetryPolicy<E>>,
}

impl<E> ResilienceStackBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self { timeout: None, bulkhead: None, retry: None }
    }

    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(TimeoutPolicy::new(duration).expect("valid timeout duration"));
        self
    }

    pub fn bulkhead(mut self, max_concurrent: usize) -> Self {
        self.bulkhead = Some(BulkheadPolicy::new(max_concurrent));
        self
    }

    pub fn unlimited_bulkhead(mut self) -> Self {
        self.bulkhead = Some(BulkheadPolicy::unlimited());
        self
    }

    pub fn retry_attempts(mut self, max_attempts: usize, backoff: Backoff, jitter: Jitter) -> Self {
        self.retry = Some(
            RetryPolicy::builder()
                .max_attempts(max_attempts)
                .backoff(backoff)
                .with_jitter(jitter)
                .build()
                .expect("valid retry policy"),
        );
        self
    }

    pub fn retry(mut self, policy: RetryPolicy<E>) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn build(self) -> ResilienceStack<E> {
        ResilienceStack {
            timeout: self.timeout.unwrap_or_else(|| {
                TimeoutPolicy::new(Duration::from_secs(30)).expect("valid default timeout")
            }),
            bulkhead: self.bulkhead.unwrap_or_else(|| BulkheadPolicy::new(100)),
            retry: self.retry.unwrap_or_else(|| {
                RetryPolicy::builder().build().expect("valid default retry policy")
            }),
        }
    }
}

impl<E> Default for ResilienceStackBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    #[tokio::test]
    async fn stack_runs_operation_through_all_layers() {
        let stack: ResilienceStack<TestError> = ResilienceStack::builder().build();
        let result = stack.execute(|| async { Ok::<_, ResilienceError<TestError>>(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn stack_retries_retryable_inner_errors() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let stack: ResilienceStack<TestError> = ResilienceStack::builder()
            .retry_attempts(3, Backoff::constant(Duration::from_millis(1)), Jitter::none())
            .build();

        let result = stack
            .execute(|| {
                let attempts = attempts.clone();
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(ResilienceError::Inner(TestError("transient".into())))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stack_bulkhead_rejects_beyond_capacity() {
        let stack: ResilienceStack<TestError> = ResilienceStack::builder().bulkhead(1).build();
        let barrier = Arc::new(tokio::sync::Barrier::new(2));
        let s2 = stack.clone();
        let b2 = barrier.clone();
        let first = tokio::spawn(async move {
            s2.execute(|| {
                let b2 = b2.clone();
                async move {
                    b2.wait().await;
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    Ok::<_, ResilienceError<TestError>>(())
                }
            })
            .await
        });

        tokio::time::sleep(Duration::from_millis(5)).await;
        barrier.wait().await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        let second = stack.execute(|| async { Ok::<_, ResilienceError<TestError>>(()) }).await;
        assert!(second.unwrap_err().is_bulkhead());
        first.await.unwrap().unwrap();
    }
}
