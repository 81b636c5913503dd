mod common;

use common::{item, FakeTransport};
use serde_json::json;
use stable_gateway::{
    stable_api_gateway, stable_request, CacheConfig, CacheManager, CallOutcome, CircuitBreaker,
    CircuitBreakerConfig, CircuitState, ConcurrencyLimiter, GatewayOptions, PolicyOverrides,
    RateLimitConfig, RateLimiter, Request, RequestPolicy, RetryStrategy, StableRequestSpec,
};
use std::time::{Duration, Instant};

fn retrying_policy(attempts: u32, wait_ms: u64, strategy: RetryStrategy) -> RequestPolicy {
    RequestPolicy {
        attempts,
        wait: Duration::from_millis(wait_ms),
        retry_strategy: strategy,
        res_req: true,
        ..RequestPolicy::default()
    }
}

fn spec(path: &str, policy: RequestPolicy) -> StableRequestSpec {
    StableRequestSpec {
        request: Request::builder("api.example.com").path(path).build(),
        policy,
    }
}

// Adapter answers 500, 500, 200; fixed backoff of 100ms sleeps twice.
#[tokio::test]
async fn retry_then_succeed_with_fixed_backoff() {
    let transport = FakeTransport::new().script("/s1", &[500, 500, 200]);
    let started = Instant::now();

    let outcome = stable_request(
        &transport,
        &spec("/s1", retrying_policy(3, 100, RetryStrategy::Fixed)),
    )
    .await
    .unwrap();

    let elapsed = started.elapsed();
    assert!(matches!(outcome, CallOutcome::Body(_)));
    assert_eq!(transport.calls(), 3);
    assert!(
        elapsed >= Duration::from_millis(180) && elapsed <= Duration::from_millis(400),
        "elapsed {:?} outside the two-sleep window",
        elapsed
    );
}

// Same script under linear backoff: sleeps 100ms then 200ms.
#[tokio::test]
async fn retry_then_succeed_with_linear_backoff() {
    let transport = FakeTransport::new().script("/s2", &[500, 500, 200]);
    let started = Instant::now();

    stable_request(
        &transport,
        &spec("/s2", retrying_policy(3, 100, RetryStrategy::Linear)),
    )
    .await
    .unwrap();

    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(280) && elapsed <= Duration::from_millis(500),
        "elapsed {:?} outside the linear window",
        elapsed
    );
}

// Exponential backoff with a generous ceiling: sleeps 100ms then 200ms.
#[tokio::test]
async fn retry_then_succeed_with_exponential_backoff() {
    let transport = FakeTransport::new().script("/s3", &[500, 500, 200]);
    let started = Instant::now();

    let policy = RequestPolicy {
        max_allowed_wait: Duration::from_millis(10_000),
        ..retrying_policy(3, 100, RetryStrategy::Exponential)
    };
    stable_request(&transport, &spec("/s3", policy)).await.unwrap();

    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(280) && elapsed <= Duration::from_millis(500),
        "elapsed {:?} outside the exponential window",
        elapsed
    );
}

#[tokio::test]
async fn circuit_trips_then_recovers_half_open() {
    let breaker = CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold_pct: 50.0,
        minimum_requests: 2,
        recovery_timeout: Duration::from_millis(1000),
        ..CircuitBreakerConfig::default()
    })
    .unwrap();

    breaker.record_failure();
    breaker.record_failure();
    assert_eq!(breaker.state(), CircuitState::Open);
    assert!(!breaker.can_execute());

    tokio::time::sleep(Duration::from_millis(1050)).await;
    assert!(breaker.can_execute());
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
}

// Five 50ms tasks through a limit of two: three waves, never more than two
// in flight.
#[tokio::test]
async fn concurrency_cap_shapes_execution() {
    let transport =
        std::sync::Arc::new(FakeTransport::with_latency(Duration::from_millis(50)));
    let limiter = ConcurrencyLimiter::new(2).unwrap();
    let started = Instant::now();

    let mut handles = Vec::new();
    for i in 0..5 {
        let transport = transport.clone();
        let limiter = limiter.clone();
        handles.push(tokio::spawn(async move {
            limiter
                .execute(|| async move {
                    stable_request(
                        transport.as_ref(),
                        &spec(&format!("/task/{}", i), RequestPolicy::default()),
                    )
                    .await
                })
                .await
                .unwrap()
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let elapsed = started.elapsed();
    assert!(transport.peak_in_flight() <= 2);
    assert!(
        elapsed >= Duration::from_millis(140) && elapsed <= Duration::from_millis(500),
        "elapsed {:?} does not look like three waves of 50ms",
        elapsed
    );
}

#[tokio::test]
async fn batch_results_keep_input_identity() {
    let transport = FakeTransport::new().script("/2", &[500, 500, 500]);
    let items: Vec<_> = (0..6).map(|i| item(&format!("id-{}", i), &format!("/{}", i))).collect();
    let options = GatewayOptions {
        common_policy: PolicyOverrides {
            attempts: Some(3),
            wait: Some(Duration::from_millis(5)),
            ..PolicyOverrides::default()
        },
        ..GatewayOptions::default()
    };

    let responses = stable_api_gateway(&transport, items, &options).await;
    assert_eq!(responses.len(), 6);
    for (i, response) in responses.iter().enumerate() {
        assert_eq!(response.request_id, format!("id-{}", i));
    }
    // Item 2 exhausted its retries; everything else succeeded.
    assert!(!responses[2].success);
    assert_eq!(responses.iter().filter(|r| r.success).count(), 5);
}

#[tokio::test]
async fn full_stack_batch_with_breaker_limiters_and_cache() {
    let transport = FakeTransport::with_latency(Duration::from_millis(5));
    let options = GatewayOptions {
        common_policy: PolicyOverrides {
            attempts: Some(2),
            wait: Some(Duration::from_millis(5)),
            res_req: Some(true),
            ..PolicyOverrides::default()
        },
        circuit_breaker: Some(
            CircuitBreaker::new(CircuitBreakerConfig {
                minimum_requests: 50,
                ..CircuitBreakerConfig::default()
            })
            .unwrap(),
        ),
        rate_limiter: Some(RateLimiter::new(
            RateLimitConfig::new(100, Duration::from_secs(10)).unwrap(),
        )),
        concurrency_limiter: Some(ConcurrencyLimiter::new(3).unwrap()),
        cache: Some(CacheManager::new(CacheConfig::default())),
        ..GatewayOptions::default()
    };

    let first: Vec<_> = (0..8).map(|i| item(&format!("a{}", i), &format!("/r/{}", i))).collect();
    let responses = stable_api_gateway(&transport, first, &options).await;
    assert!(responses.iter().all(|r| r.success));
    assert_eq!(transport.calls(), 8);
    assert!(transport.peak_in_flight() <= 3);

    // Same paths again: all served from cache.
    let second: Vec<_> = (0..8).map(|i| item(&format!("b{}", i), &format!("/r/{}", i))).collect();
    let responses = stable_api_gateway(&transport, second, &options).await;
    assert!(responses.iter().all(|r| r.success));
    assert_eq!(transport.calls(), 8, "second batch must not reach the transport");
    assert_eq!(responses[0].data, Some(json!({ "path": "/r/0", "status": 200 })));
}

#[tokio::test]
async fn rate_limited_batch_stays_within_window_budget() {
    let transport = FakeTransport::new();
    let limiter =
        RateLimiter::new(RateLimitConfig::new(3, Duration::from_millis(100)).unwrap());
    let options = GatewayOptions {
        rate_limiter: Some(limiter.clone()),
        ..GatewayOptions::default()
    };

    let items: Vec<_> = (0..7).map(|i| item(&format!("r{}", i), "/limited")).collect();
    let started = Instant::now();
    let responses = stable_api_gateway(&transport, items, &options).await;
    let elapsed = started.elapsed();

    assert!(responses.iter().all(|r| r.success));
    // 7 items at 3 per 100ms window: at least two refill waits.
    assert!(
        elapsed >= Duration::from_millis(150),
        "elapsed {:?} implies the window was not enforced",
        elapsed
    );
    assert!(limiter.metrics().peak_window_rate <= 3);

    limiter.shutdown();
}
