//! Common decision types returned by the engine
//!
//! The HTTP layer consuming this crate renders responses from these
//! types alone: an [`Evaluation`] always carries a fully-shaped
//! [`RateDecision`] (even when produced by an internal failure), the
//! standard rate-limit header pairs, and a status hint.

use serde::Serialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Result of a velocity (rate-limit) check.
#[derive(Debug, Clone, Serialize)]
pub struct RateDecision {
    /// Whether the request is admitted
    pub allowed: bool,
    /// Limit of the most restrictive granularity checked
    pub limit: u64,
    /// Requests remaining before the most restrictive granularity
    /// denies (never negative)
    pub remaining: u64,
    /// Time to wait before retrying; present iff denied
    pub retry_after: Option<Duration>,
    /// Instant the current window resets
    pub reset_at: SystemTime,
}

impl RateDecision {
    /// The safe default produced when a check could not be completed:
    /// admit, report the configured limit untouched.
    pub fn fail_open(limit: u64, now: SystemTime) -> Self {
        RateDecision {
            allowed: true,
            limit,
            remaining: limit,
            retry_after: None,
            reset_at: now,
        }
    }
}

/// Result of a cumulative quota check.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaDecision {
    /// Whether the operation fits within the tier's allowance
    pub allowed: bool,
    /// Most restrictive remaining allowance; `-1` means unlimited
    pub remaining: i64,
    /// Instant the restricting period rolls over
    pub reset_at: SystemTime,
    /// Tier the limits were resolved for
    pub tier: String,
}

/// Classified outcome of a full admission evaluation.
///
/// `ServiceProtection` is deliberately distinct from `RateLimited`: it
/// reports pressure on shared infrastructure rather than one subject's
/// consumption, and maps to a 503-class response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Outcome {
    Allowed,
    RateLimited,
    QuotaExceeded,
    Blocked,
    ServiceProtection,
}

impl Outcome {
    /// HTTP status the calling layer should render.
    pub fn status_hint(self) -> u16 {
        match self {
            Outcome::Allowed => 200,
            Outcome::RateLimited => 429,
            Outcome::QuotaExceeded => 402,
            Outcome::Blocked => 423,
            Outcome::ServiceProtection => 503,
        }
    }
}

/// Complete admission decision handed to the calling layer.
#[derive(Debug, Clone, Serialize)]
pub struct Evaluation {
    pub outcome: Outcome,
    pub decision: RateDecision,
    /// Present when the quota ledger was consulted
    pub quota: Option<QuotaDecision>,
    /// Operator-configured denial message, when the policy carries one
    pub message: Option<String>,
}

impl Evaluation {
    pub fn allowed(&self) -> bool {
        self.outcome == Outcome::Allowed
    }

    /// Standard rate-limit header pairs for the calling layer.
    ///
    /// `Retry-After` is included only on denials, rounded up to whole
    /// seconds so a compliant client never retries early. Bypassed
    /// callers carry the unlimited sentinel and get no headers at all.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        if self.decision.limit == u64::MAX {
            return Vec::new();
        }

        let reset_secs = self
            .decision
            .reset_at
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();

        let mut headers = vec![
            ("X-RateLimit-Limit", self.decision.limit.to_string()),
            ("X-RateLimit-Remaining", self.decision.remaining.to_string()),
            ("X-RateLimit-Reset", reset_secs.to_string()),
        ];

        if let Some(wait) = self.decision.retry_after {
            let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
            headers.push(("Retry-After", secs.to_string()));
        }

        headers
    }
}
