//! Token-bucket refill and consume math
//!
//! A bucket holds up to `capacity` tokens and refills continuously at
//! `refill_per_sec`. A request consumes a quantity of tokens and is
//! denied when not enough remain; the verdict then reports how long
//! until enough tokens exist.

use std::time::{Duration, SystemTime};

/// Mutable state of one token bucket.
///
/// Invariant: `0 <= tokens <= capacity` after every operation.
#[derive(Debug, Clone, Copy)]
pub struct BucketState {
    /// Tokens currently available
    pub tokens: f64,
    /// Instant of the last refill calculation
    pub last_refill: SystemTime,
}

/// Outcome of a token-bucket consume attempt.
#[derive(Debug, Clone, Copy)]
pub struct TokenVerdict {
    /// Whether enough tokens were available
    pub allowed: bool,
    /// Tokens remaining after the operation
    pub remaining: f64,
    /// Time until `requested` tokens will exist (zero when allowed)
    pub retry_after: Duration,
}

impl BucketState {
    /// A bucket starting full.
    pub fn full(capacity: f64, now: SystemTime) -> Self {
        BucketState {
            tokens: capacity.max(0.0),
            last_refill: now,
        }
    }

    /// Advance the bucket to `now`, crediting elapsed refill.
    ///
    /// Clock regressions are ignored (no negative elapsed time), so
    /// tokens never decrease from a refill.
    pub fn refill(&mut self, capacity: f64, refill_per_sec: f64, now: SystemTime) {
        let elapsed = now
            .duration_since(self.last_refill)
            .unwrap_or(Duration::ZERO);
        let credited = elapsed.as_secs_f64() * refill_per_sec.max(0.0);
        self.tokens = (self.tokens + credited).clamp(0.0, capacity.max(0.0));
        self.last_refill = now;
    }

    /// Refill to `now`, then consume `requested` tokens if available.
    ///
    /// When denied, the state is left untouched apart from the refill
    /// and `retry_after` reports when the shortfall will be covered;
    /// a zero refill rate means the shortfall is never covered and the
    /// wait is reported as [`Duration::MAX`].
    pub fn try_consume(
        &mut self,
        capacity: f64,
        refill_per_sec: f64,
        requested: f64,
        now: SystemTime,
    ) -> TokenVerdict {
        self.refill(capacity, refill_per_sec, now);

        if self.tokens >= requested {
            self.tokens -= requested;
            return TokenVerdict {
                allowed: true,
                remaining: self.tokens,
                retry_after: Duration::ZERO,
            };
        }

        let shortfall = requested - self.tokens;
        let retry_after = if refill_per_sec > 0.0 {
            Duration::from_secs_f64(shortfall / refill_per_sec)
        } else {
            Duration::MAX
        };

        TokenVerdict {
            allowed: false,
            remaining: self.tokens,
            retry_after,
        }
    }

    /// Seconds of idle refill after which a bucket is back at capacity
    /// and its entry can be reclaimed.
    pub fn time_to_full(&self, capacity: f64, refill_per_sec: f64) -> Duration {
        if refill_per_sec <= 0.0 {
            return Duration::MAX;
        }
        let missing = (capacity - self.tokens).max(0.0);
        Duration::from_secs_f64(missing / refill_per_sec)
    }
}
