// SPDX-License-Identifier: Apache-2.0
//! Exponential backoff with jitter.

use std::time::Duration;

use rand::rngs::SmallRng;
use rand::Rng;

/// Backoff policy: `base · 1.5^retry` plus up to half a base of jitter,
/// capped.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    /// First-retry delay.
    pub base: Duration,
    /// Ceiling for the computed delay (pre-jitter).
    pub cap: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
        }
    }
}

impl Backoff {
    /// Delay before retry number `retry` (0-based).
    pub fn delay(&self, retry: u32, rng: &mut SmallRng) -> Duration {
        let base_ms = self.base.as_millis() as f64;
        let exp = base_ms * 1.5f64.powi(retry.min(24) as i32);
        let capped = exp.min(self.cap.as_millis() as f64);
        let jitter = rng.random_range(0.0..(base_ms / 2.0).max(1.0));
        Duration::from_millis((capped + jitter) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn delays_grow_and_cap() {
        let mut rng = SmallRng::seed_from_u64(7);
        let policy = Backoff {
            base: Duration::from_millis(100),
            cap: Duration::from_secs(2),
        };
        let d0 = policy.delay(0, &mut rng);
        let d4 = policy.delay(4, &mut rng);
        let d20 = policy.delay(20, &mut rng);
        assert!(d0 >= Duration::from_millis(100));
        assert!(d0 < Duration::from_millis(200));
        assert!(d4 > d0);
        // 100ms · 1.5^20 is way past the cap; jitter stays under 50ms.
        assert!(d20 <= Duration::from_millis(2050));
        assert!(d20 >= Duration::from_secs(2));
    }
}
