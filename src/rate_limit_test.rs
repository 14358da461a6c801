use std::time::Duration;

use super::*;
use crate::config::SyncConfig;

const MUTATION: BucketConfig = BucketConfig { rate_per_sec: 50.0, burst: 500.0 };
const AWARENESS: BucketConfig = BucketConfig { rate_per_sec: 120.0, burst: 240.0 };

fn limiter() -> RateLimiter {
    RateLimiter::new(MUTATION, AWARENESS)
}

#[test]
fn burst_is_available_immediately() {
    let rl = limiter();
    let client = Uuid::new_v4();
    let now = Instant::now();

    assert!(rl.check_at(client, TrafficClass::Mutation, 500, now).is_ok());
    let err = rl
        .check_at(client, TrafficClass::Mutation, 1, now)
        .expect_err("bucket empty");
    assert_eq!(err.class(), TrafficClass::Mutation);
    assert_eq!(err.retry_after_ms(), Some(20));
}

#[test]
fn cost_is_charged_per_operation() {
    let rl = limiter();
    let client = Uuid::new_v4();
    let now = Instant::now();

    for i in 0..5 {
        assert!(rl.check_at(client, TrafficClass::Mutation, 100, now).is_ok(), "batch {i} should pass");
    }
    assert!(rl.check_at(client, TrafficClass::Mutation, 100, now).is_err());
}

#[test]
fn rejected_request_consumes_nothing() {
    let rl = limiter();
    let client = Uuid::new_v4();
    let now = Instant::now();

    rl.check_at(client, TrafficClass::Mutation, 450, now).expect("fits");
    assert!(rl.check_at(client, TrafficClass::Mutation, 100, now).is_err());
    assert!(rl.check_at(client, TrafficClass::Mutation, 50, now).is_ok());
}

#[test]
fn tokens_refill_over_time() {
    let rl = limiter();
    let client = Uuid::new_v4();
    let start = Instant::now();

    rl.check_at(client, TrafficClass::Mutation, 500, start).expect("burst");
    assert!(rl.check_at(client, TrafficClass::Mutation, 50, start).is_err());

    let later = start + Duration::from_secs(1);
    assert!(rl.check_at(client, TrafficClass::Mutation, 50, later).is_ok());
    assert!(rl.check_at(client, TrafficClass::Mutation, 1, later).is_err());
}

#[test]
fn refill_never_exceeds_burst() {
    let rl = limiter();
    let client = Uuid::new_v4();
    let start = Instant::now();

    rl.check_at(client, TrafficClass::Awareness, 1, start).expect("first");
    let much_later = start + Duration::from_secs(3600);
    assert!(rl.check_at(client, TrafficClass::Awareness, 240, much_later).is_ok());
    assert!(rl.check_at(client, TrafficClass::Awareness, 1, much_later).is_err());
}

#[test]
fn classes_do_not_share_tokens() {
    let rl = limiter();
    let client = Uuid::new_v4();
    let now = Instant::now();

    rl.check_at(client, TrafficClass::Mutation, 500, now).expect("drain mutations");
    assert!(rl.check_at(client, TrafficClass::Awareness, 1, now).is_ok());
}

#[test]
fn distinct_clients_do_not_interfere() {
    let rl = limiter();
    let client_a = Uuid::new_v4();
    let client_b = Uuid::new_v4();
    let now = Instant::now();

    rl.check_at(client_a, TrafficClass::Mutation, 500, now).expect("drain a");
    assert!(rl.check_at(client_a, TrafficClass::Mutation, 1, now).is_err());
    assert!(rl.check_at(client_b, TrafficClass::Mutation, 1, now).is_ok());
}

#[test]
fn cost_over_burst_is_a_bad_request_not_a_retry() {
    let rl = RateLimiter::new(SyncConfig::default().mutation_bucket, AWARENESS);
    let client = Uuid::new_v4();
    let now = Instant::now();

    let err = rl
        .check_at(client, TrafficClass::Mutation, 600, now)
        .expect_err("never fits");
    assert_eq!(err, RateLimitError::OverBurst { class: TrafficClass::Mutation, cost: 600, burst: 500 });
    assert_eq!(err.retry_after_ms(), None);
    assert_eq!(crate::frame::ErrorCode::error_code(&err), "E_BAD_REQUEST");
    assert!(!crate::frame::ErrorCode::retryable(&err));

    // The bucket was never touched.
    assert!(rl.check_at(client, TrafficClass::Mutation, 500, now).is_ok());
}

#[test]
fn forget_drops_connection_state() {
    let rl = limiter();
    let client = Uuid::new_v4();
    rl.check(client, TrafficClass::Awareness, 1).expect("first");
    assert_eq!(rl.tracked(), 1);
    rl.forget(client);
    assert_eq!(rl.tracked(), 0);
}
