//! In-memory rate limiting for connection traffic.
//!
//! DESIGN
//! ======
//! Token buckets keyed by connection id. Two independent classes per
//! connection:
//! - Mutations: charged one token per fragment operation.
//! - Awareness: charged one token per presence update, higher rate.
//!
//! A rejected request consumes nothing, so a client that backs off and
//! retries is not punished twice.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use uuid::Uuid;

use crate::config::BucketConfig;

// =============================================================================
// ERROR TYPE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrafficClass {
    Mutation,
    Awareness,
}

impl TrafficClass {
    fn as_str(self) -> &'static str {
        match self {
            Self::Mutation => "mutation",
            Self::Awareness => "awareness",
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("{} rate limit exceeded (cost {cost}, retry after {retry_after_ms}ms)", .class.as_str())]
    Exhausted { class: TrafficClass, cost: u64, retry_after_ms: u64 },
    /// The request alone costs more than a full bucket holds.
    #[error("{} request costs {cost}, over the burst of {burst}", .class.as_str())]
    OverBurst { class: TrafficClass, cost: u64, burst: u64 },
}

impl RateLimitError {
    #[must_use]
    pub fn class(&self) -> TrafficClass {
        match self {
            Self::Exhausted { class, .. } | Self::OverBurst { class, .. } => *class,
        }
    }

    /// Wait before the same request can pass. `None` when it never will.
    #[must_use]
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::Exhausted { retry_after_ms, .. } => Some(*retry_after_ms),
            Self::OverBurst { .. } => None,
        }
    }
}

impl crate::frame::ErrorCode for RateLimitError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Exhausted { .. } => "E_RATE_LIMITED",
            Self::OverBurst { .. } => "E_BAD_REQUEST",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

// =============================================================================
// RATE LIMITER
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

impl Bucket {
    fn full(config: BucketConfig, now: Instant) -> Self {
        Self { tokens: config.burst, refilled_at: now }
    }

    fn refill(&mut self, config: BucketConfig, now: Instant) {
        let elapsed = now.saturating_duration_since(self.refilled_at).as_secs_f64();
        self.tokens = (self.tokens + elapsed * config.rate_per_sec).min(config.burst);
        self.refilled_at = now;
    }
}

struct ConnectionBuckets {
    mutation: Bucket,
    awareness: Bucket,
}

#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<HashMap<Uuid, ConnectionBuckets>>>,
    mutation: BucketConfig,
    awareness: BucketConfig,
}

impl RateLimiter {
    #[must_use]
    pub fn new(mutation: BucketConfig, awareness: BucketConfig) -> Self {
        Self { inner: Arc::new(Mutex::new(HashMap::new())), mutation, awareness }
    }

    /// Charge `cost` tokens to the connection's bucket for `class`.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::Exhausted`] when the bucket cannot cover the
    /// cost yet and [`RateLimitError::OverBurst`] when it never can.
    pub fn check(&self, client_id: Uuid, class: TrafficClass, cost: u64) -> Result<(), RateLimitError> {
        self.check_at(client_id, class, cost, Instant::now())
    }

    /// Internal: check with explicit timestamp (for testing).
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn check_at(&self, client_id: Uuid, class: TrafficClass, cost: u64, now: Instant) -> Result<(), RateLimitError> {
        let burst = match class {
            TrafficClass::Mutation => self.mutation.burst,
            TrafficClass::Awareness => self.awareness.burst,
        };
        // EDGE: no amount of waiting covers a cost above the burst.
        if cost as f64 > burst {
            return Err(RateLimitError::OverBurst { class, cost, burst: burst as u64 });
        }

        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let (mutation, awareness) = (self.mutation, self.awareness);
        let buckets = inner.entry(client_id).or_insert_with(|| ConnectionBuckets {
            mutation: Bucket::full(mutation, now),
            awareness: Bucket::full(awareness, now),
        });

        let (bucket, config) = match class {
            TrafficClass::Mutation => (&mut buckets.mutation, mutation),
            TrafficClass::Awareness => (&mut buckets.awareness, awareness),
        };
        bucket.refill(config, now);

        let needed = cost as f64;
        if needed <= bucket.tokens {
            bucket.tokens -= needed;
            return Ok(());
        }

        let deficit = needed - bucket.tokens;
        let retry_after_ms = (deficit * 1000.0 / config.rate_per_sec).ceil().max(1.0) as u64;
        Err(RateLimitError::Exhausted { class, cost, retry_after_ms })
    }

    /// Drop a connection's buckets when it disconnects.
    pub fn forget(&self, client_id: Uuid) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.remove(&client_id);
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[path = "rate_limit_test.rs"]
mod tests;
