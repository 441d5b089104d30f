// SPDX-License-Identifier: Apache-2.0
//! Token-bucket rate limiter guarding the ingest path.
//!
//! One bucket per `(subject, operation)`. A batch of N actions costs N
//! tokens; a drained bucket answers with the number of whole seconds after
//! which the deficit will have refilled (`Retry-After`).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

/// Limiter verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Tokens were available and consumed.
    Allow,
    /// Bucket exhausted.
    Limited {
        /// Seconds until the deficit refills (`ceil(deficit / rate)`).
        retry_after_secs: u64,
    },
}

struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

/// Shared token-bucket limiter.
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    buckets: Mutex<HashMap<(String, String), Bucket>>,
}

impl RateLimiter {
    /// `rate` tokens per second refill, up to `burst` capacity.
    pub fn new(rate: f64, burst: f64) -> Self {
        Self {
            rate,
            burst,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Try to take `cost` tokens for `(subject, operation)`.
    pub fn check(&self, subject: &str, operation: &str, cost: u32) -> Decision {
        self.check_at(subject, operation, cost, Instant::now())
    }

    /// Clock-injected variant for tests.
    fn check_at(&self, subject: &str, operation: &str, cost: u32, now: Instant) -> Decision {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = buckets
            .entry((subject.to_string(), operation.to_string()))
            .or_insert(Bucket {
                tokens: self.burst,
                refilled_at: now,
            });
        let elapsed = now.saturating_duration_since(bucket.refilled_at).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
        bucket.refilled_at = now;

        let cost = f64::from(cost);
        if bucket.tokens >= cost {
            bucket.tokens -= cost;
            Decision::Allow
        } else {
            let deficit = cost - bucket.tokens;
            Decision::Limited {
                retry_after_secs: (deficit / self.rate).ceil() as u64,
            }
        }
    }
}
