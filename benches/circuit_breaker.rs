use criterion::{black_box, criterion_group, criterion_main, Criterion};
use meshline::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerPolicy};
use meshline::error::Error;
use std::time::Duration;

fn circuit_breaker_throughput_success(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let config = CircuitBreakerConfig::builder()
        .failure_threshold(10)
        .recovery_timeout(Duration::from_secs(30))
        .build();
    let breaker = CircuitBreakerPolicy::new(config);

    c.bench_function("circuit_breaker_success_100k_rps", |b| {
        b.to_async(&rt).iter(|| async {
            let _ = black_box(breaker.execute(None, || async { Ok::<_, Error>("request") }).await);
        });
    });
}

fn circuit_breaker_throughput_failure(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    // A high failure threshold keeps the breaker closed throughout the run so
    // every iteration still pays the failure-path bookkeeping cost rather
    // than short-circuiting on an open breaker after the first sample.
    let config = CircuitBreakerConfig::builder()
        .failure_threshold(1_000_000)
        .recovery_timeout(Duration::from_secs(30))
        .build();
    let breaker = CircuitBreakerPolicy::new(config);

    c.bench_function("circuit_breaker_failure_100k_rps", |b| {
        b.to_async(&rt).iter(|| async {
            let _ = black_box(
                breaker.execute(None, || async { Err::<&str, _>(Error::unavailable("boom")) }).await,
            );
        });
    });
}

criterion_group!(benches, circuit_breaker_throughput_success, circuit_breaker_throughput_failure);
criterion_main!(benches);
