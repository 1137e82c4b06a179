//! Per-request rate limit orchestration
//!
//! [`RateLimiter`] turns an effective [`LimitPolicy`] into backend
//! calls and a [`RateDecision`]. Fixed-window policies check every
//! configured granularity concurrently (fan-out, then combine); token
//! buckets are a single call. Backend failures never propagate: the
//! decision degrades to fail-open and the failure is logged.

use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::backend::{CounterBackend, keys};
use crate::policy::{Algorithm, LimitPolicy};
use crate::types::RateDecision;
use floodgate::{WindowCheck, combine_windows};

pub struct RateLimiter {
    backend: Arc<dyn CounterBackend>,
}

impl RateLimiter {
    pub fn new(backend: Arc<dyn CounterBackend>) -> Self {
        RateLimiter { backend }
    }

    pub fn backend(&self) -> &Arc<dyn CounterBackend> {
        &self.backend
    }

    /// Evaluate `policy` for one subject and operation.
    pub async fn check(
        &self,
        subject: &str,
        operation: &str,
        policy: &LimitPolicy,
        now: SystemTime,
    ) -> RateDecision {
        match policy.algorithm {
            Algorithm::FixedWindow => self.check_windows(subject, operation, policy, now).await,
            Algorithm::TokenBucket => self.check_bucket(subject, operation, policy, now).await,
        }
    }

    /// Evaluate a service-protection policy, counted under the shared
    /// `global` subject irrespective of caller identity.
    pub async fn check_global(
        &self,
        operation: &str,
        policy: &LimitPolicy,
        now: SystemTime,
    ) -> RateDecision {
        self.check(keys::GLOBAL_SUBJECT, operation, policy, now).await
    }

    async fn check_windows(
        &self,
        subject: &str,
        operation: &str,
        policy: &LimitPolicy,
        now: SystemTime,
    ) -> RateDecision {
        let granularities = policy.windows.granularities();
        if granularities.is_empty() {
            tracing::warn!(
                policy = %policy.key(),
                "fixed-window policy has no granularities configured, allowing"
            );
            return RateDecision::fail_open(fallback_limit(policy), now);
        }

        // Fan out: one atomic increment per granularity, concurrently
        let calls = granularities.iter().map(|(width, _)| {
            let key = keys::window(subject, operation, *width);
            let backend = Arc::clone(&self.backend);
            async move { backend.increment_window(&key, *width, now).await }
        });
        let slots = join_all(calls).await;

        let mut checks = Vec::with_capacity(granularities.len());
        for ((width, limit), slot) in granularities.iter().zip(slots) {
            match slot {
                Ok(slot) => checks.push(WindowCheck {
                    width: *width,
                    limit: *limit,
                    count: slot.count,
                    expires_at: slot.expires_at,
                }),
                Err(err) => {
                    tracing::warn!(
                        subject,
                        operation,
                        error = %err,
                        "window increment failed, failing open"
                    );
                    return RateDecision::fail_open(fallback_limit(policy), now);
                }
            }
        }

        let verdict = combine_windows(&checks, now);
        RateDecision {
            allowed: verdict.allowed,
            limit: verdict.limit,
            remaining: verdict.remaining,
            retry_after: verdict.retry_after,
            reset_at: verdict.reset_at,
        }
    }

    async fn check_bucket(
        &self,
        subject: &str,
        operation: &str,
        policy: &LimitPolicy,
        now: SystemTime,
    ) -> RateDecision {
        let Some(bucket) = policy.bucket else {
            tracing::warn!(
                policy = %policy.key(),
                "token-bucket policy has no bucket configured, allowing"
            );
            return RateDecision::fail_open(fallback_limit(policy), now);
        };

        let key = keys::bucket(subject, operation);
        let capacity = bucket.capacity as f64;
        let verdict = match self
            .backend
            .consume_tokens(&key, capacity, bucket.refill_per_sec, 1.0, now)
            .await
        {
            Ok(verdict) => verdict,
            Err(err) => {
                tracing::warn!(
                    subject,
                    operation,
                    error = %err,
                    "token consume failed, failing open"
                );
                return RateDecision::fail_open(bucket.capacity, now);
            }
        };

        // Instant the bucket is back at capacity; doubles as the reset
        // header value
        let reset_at = if bucket.refill_per_sec > 0.0 {
            let missing = (capacity - verdict.remaining).max(0.0);
            now + Duration::from_secs_f64(missing / bucket.refill_per_sec)
        } else {
            now
        };

        RateDecision {
            allowed: verdict.allowed,
            limit: bucket.capacity,
            remaining: verdict.remaining.floor().max(0.0) as u64,
            retry_after: (!verdict.allowed).then_some(verdict.retry_after),
            reset_at,
        }
    }

    /// Instant an armed block lapses, if one is live.
    pub async fn blocked_until(
        &self,
        subject: &str,
        operation: &str,
        now: SystemTime,
    ) -> Option<SystemTime> {
        match self
            .backend
            .flag_expiry(&keys::block(subject, operation), now)
            .await
        {
            Ok(expiry) => expiry,
            Err(err) => {
                // Fail open: an unreadable flag never blocks
                tracing::warn!(subject, operation, error = %err, "block flag read failed");
                None
            }
        }
    }

    /// Arm a temporary block after a denial.
    pub async fn arm_block(
        &self,
        subject: &str,
        operation: &str,
        duration: Duration,
        now: SystemTime,
    ) {
        if let Err(err) = self
            .backend
            .set_flag(&keys::block(subject, operation), duration, now)
            .await
        {
            tracing::warn!(subject, operation, error = %err, "failed to arm block flag");
        }
    }

    /// Drop every counter for a subject, or only one operation's.
    pub async fn reset(&self, subject: &str, operation: Option<&str>) -> usize {
        let prefix = match operation {
            Some(op) => keys::operation_prefix(subject, op),
            None => keys::subject_prefix(subject),
        };
        match self.backend.remove_prefix(&prefix).await {
            Ok(removed) => removed,
            Err(err) => {
                tracing::warn!(subject, error = %err, "reset failed");
                0
            }
        }
    }
}

/// Limit to report when a decision cannot come from the backend.
pub(crate) fn fallback_limit(policy: &LimitPolicy) -> u64 {
    policy
        .windows
        .granularities()
        .first()
        .map(|(_, limit)| *limit)
        .or(policy.bucket.map(|b| b.capacity))
        .unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::policy::{BucketSpec, WindowLimits};
    use floodgate::MemoryStore;
    use std::collections::HashMap;
    use std::time::UNIX_EPOCH;

    fn limiter() -> RateLimiter {
        RateLimiter::new(Arc::new(MemoryBackend::spawn(256, MemoryStore::new())))
    }

    fn window_policy(per_minute: u64) -> LimitPolicy {
        LimitPolicy {
            category: "chat".into(),
            operation: "send".into(),
            algorithm: Algorithm::FixedWindow,
            windows: WindowLimits {
                per_minute: Some(per_minute),
                per_hour: None,
                per_day: None,
            },
            bucket: None,
            tier_multipliers: HashMap::new(),
            block_duration_secs: None,
            message: None,
            quota: None,
        }
    }

    fn bucket_policy(capacity: u64, refill_per_sec: f64) -> LimitPolicy {
        LimitPolicy {
            category: "chat".into(),
            operation: "send".into(),
            algorithm: Algorithm::TokenBucket,
            windows: WindowLimits::default(),
            bucket: Some(BucketSpec {
                capacity,
                refill_per_sec,
            }),
            tier_multipliers: HashMap::new(),
            block_duration_secs: None,
            message: None,
            quota: None,
        }
    }

    fn aligned_now() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_700_000_040)
    }

    #[tokio::test]
    async fn limit_boundary_is_exact() {
        let limiter = limiter();
        let policy = window_policy(5);
        let now = aligned_now();

        for i in 0..5 {
            let d = limiter.check("u1", "chat.send", &policy, now).await;
            assert!(d.allowed, "request {} should pass", i + 1);
            assert_eq!(d.remaining, 4 - i);
        }

        let denied = limiter.check("u1", "chat.send", &policy, now).await;
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        let retry = denied.retry_after.unwrap();
        assert!(retry <= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn concurrent_requests_admit_exactly_the_limit() {
        let limiter = Arc::new(limiter());
        let policy = Arc::new(window_policy(10));
        let now = aligned_now();

        let mut tasks = vec![];
        for _ in 0..25 {
            let l = Arc::clone(&limiter);
            let p = Arc::clone(&policy);
            tasks.push(tokio::spawn(async move {
                l.check("u1", "chat.send", &p, now).await.allowed
            }));
        }

        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
    }

    #[tokio::test]
    async fn hour_cap_denies_even_when_minute_is_fine() {
        let limiter = limiter();
        let mut policy = window_policy(1000);
        policy.windows.per_hour = Some(3);
        let now = aligned_now();

        for _ in 0..3 {
            assert!(limiter.check("u1", "chat.send", &policy, now).await.allowed);
        }
        let denied = limiter.check("u1", "chat.send", &policy, now).await;
        assert!(!denied.allowed);
        // The hour window is the one that must pass
        assert!(denied.retry_after.unwrap() > Duration::from_secs(60));
    }

    #[tokio::test]
    async fn token_bucket_refills_at_the_configured_rate() {
        let limiter = limiter();
        let mut policy = bucket_policy(10, 0.2);
        let now = aligned_now();

        // Spend 5 tokens one at a time
        for i in 0..5 {
            let d = limiter.check("u1", "chat.send", &policy, now).await;
            assert!(d.allowed);
            assert_eq!(d.remaining, 9 - i);
        }

        // 5 simulated seconds at 0.2/s refill one token: 5 + 1 - 1 = 5
        let later = now + Duration::from_secs(5);
        let d = limiter.check("u1", "chat.send", &policy, later).await;
        assert!(d.allowed);
        assert_eq!(d.remaining, 5);

        // Misconfigured bucket fails open rather than erroring
        policy.bucket = None;
        let d = limiter.check("u1", "chat.send", &policy, later).await;
        assert!(d.allowed);
    }

    #[tokio::test]
    async fn global_counting_is_shared_across_subjects() {
        let limiter = limiter();
        let policy = window_policy(3);
        let now = aligned_now();

        assert!(limiter.check_global("chat.send", &policy, now).await.allowed);
        assert!(limiter.check_global("chat.send", &policy, now).await.allowed);
        assert!(limiter.check_global("chat.send", &policy, now).await.allowed);
        assert!(!limiter.check_global("chat.send", &policy, now).await.allowed);
    }

    #[tokio::test]
    async fn blocks_arm_and_lapse() {
        let limiter = limiter();
        let now = aligned_now();

        assert!(limiter.blocked_until("u1", "chat.send", now).await.is_none());

        limiter
            .arm_block("u1", "chat.send", Duration::from_secs(30), now)
            .await;
        let until = limiter.blocked_until("u1", "chat.send", now).await.unwrap();
        assert_eq!(until, now + Duration::from_secs(30));

        let later = now + Duration::from_secs(31);
        assert!(limiter.blocked_until("u1", "chat.send", later).await.is_none());
    }

    #[tokio::test]
    async fn reset_clears_only_the_addressed_counters() {
        let limiter = limiter();
        let policy = window_policy(5);
        let now = aligned_now();

        limiter.check("u1", "chat.send", &policy, now).await;
        limiter.check("u1", "docs.upload", &policy, now).await;
        limiter.check("u2", "chat.send", &policy, now).await;

        let removed = limiter.reset("u1", Some("chat.send")).await;
        assert_eq!(removed, 1);

        let removed = limiter.reset("u1", None).await;
        assert_eq!(removed, 1); // docs.upload counter

        // u2 untouched: the second check lands at count 2
        let d = limiter.check("u2", "chat.send", &policy, now).await;
        assert_eq!(d.remaining, 3);
    }
}
