//! # Quest Platform Benchmarks
//!
//! Hot paths executed on every request or message:
//!
//! | Component | Operation |
//! |-----------|-----------|
//! | shared-resilience | `allow_request` + `record_success` |
//! | shared-bus | topic pattern matching, pending query register/complete |
//! | shared-ratelimit | fixed window, sliding window, token bucket on the memory store |

use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use shared_bus::topic;
use shared_bus::PendingQueries;
use shared_cache::{CounterStoreClient, ManualClock, MemoryBackend};
use shared_ratelimit::{RateLimitConfig, RateLimitStrategy, RateLimiter};
use shared_resilience::{CircuitBreaker, CircuitBreakerConfig};

// ============================================================================
// Circuit breaker
// ============================================================================

fn bench_circuit_breaker(c: &mut Criterion) {
    let mut group = c.benchmark_group("circuit-breaker");

    let breaker = CircuitBreaker::new(
        "bench",
        CircuitBreakerConfig::new(5, Duration::from_secs(30)),
    );
    group.bench_function("allow_and_record_success", |b| {
        b.iter(|| {
            if breaker.allow_request() {
                breaker.record_success();
            }
        })
    });

    let open = CircuitBreaker::new("open", CircuitBreakerConfig::new(1, Duration::from_secs(3600)));
    open.record_failure();
    group.bench_function("reject_while_open", |b| {
        b.iter(|| black_box(open.allow_request()))
    });

    group.finish();
}

// ============================================================================
// Message bus
// ============================================================================

fn bench_topic_matching(c: &mut Criterion) {
    let mut group = c.benchmark_group("topic-matching");

    let cases = [
        ("exact", "command.users.CreateUserCommand"),
        ("star", "command.users.*"),
        ("hash", "event.#"),
        ("mixed", "query.*.#"),
    ];
    for (label, pattern) in cases {
        group.bench_with_input(BenchmarkId::new("matches", label), &pattern, |b, pattern| {
            b.iter(|| black_box(topic::matches(pattern, "command.users.CreateUserCommand")))
        });
    }

    group.finish();
}

fn bench_pending_queries(c: &mut Criterion) {
    let mut group = c.benchmark_group("pending-queries");
    let store = PendingQueries::new(Duration::from_secs(30));

    group.bench_function("register_complete", |b| {
        b.iter(|| {
            let (id, rx) = store.register("GetUserQuery", None);
            store.complete(id, json!({"id": 1}));
            black_box(rx)
        })
    });

    group.finish();
}

// ============================================================================
// Rate limiter
// ============================================================================

fn bench_rate_limiter(c: &mut Criterion) {
    let mut group = c.benchmark_group("rate-limiter");
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    let clock = Arc::new(ManualClock::at_secs(1_700_000_000));
    let store = CounterStoreClient::new(
        Arc::new(MemoryBackend::with_clock(clock.clone())),
        "ratelimit:",
    );
    let limiter = RateLimiter::new(store, clock);

    let strategies = [
        RateLimitStrategy::FixedWindow,
        RateLimitStrategy::SlidingWindow,
        RateLimitStrategy::TokenBucket,
    ];
    for strategy in strategies {
        let config = RateLimitConfig::new(1_000_000_000, 60, strategy);
        let key = format!("bench:{}", strategy);
        group.bench_function(BenchmarkId::new("check", strategy), |b| {
            b.iter(|| black_box(rt.block_on(limiter.check(&key, &config)).unwrap()))
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_circuit_breaker,
    bench_topic_matching,
    bench_pending_queries,
    bench_rate_limiter,
);

criterion_main!(benches);
