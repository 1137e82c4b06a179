//! Fixed-window bucket math
//!
//! Time is divided into buckets of a fixed width; a request belongs to
//! the bucket `floor(now / width)` and every bucket's count resets at
//! the next boundary. [`combine_windows`] merges the post-increment
//! counts of several widths (minute/hour/day) into one verdict.
//!
//! This is a fixed-window approximation of sliding-window limiting: at a
//! bucket boundary up to twice the limit can be admitted. That behavior
//! is intentional and relied upon by callers; do not "fix" it here.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch, saturating at zero for pre-epoch
/// clocks so a misconfigured system cannot panic the request path.
pub(crate) fn unix_millis(now: SystemTime) -> u64 {
    now.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The bucket a point in time falls into for a given window width.
pub fn bucket_id(now: SystemTime, width: Duration) -> u64 {
    let width_ms = (width.as_millis() as u64).max(1);
    unix_millis(now) / width_ms
}

/// The `[start, end)` boundaries of the bucket containing `now`.
///
/// `end` is the instant the counter resets.
pub fn bucket_bounds(now: SystemTime, width: Duration) -> (SystemTime, SystemTime) {
    let width_ms = (width.as_millis() as u64).max(1);
    let start_ms = (unix_millis(now) / width_ms) * width_ms;
    let start = UNIX_EPOCH + Duration::from_millis(start_ms);
    (start, start + Duration::from_millis(width_ms))
}

/// Post-increment state of one window granularity, ready to be combined.
#[derive(Debug, Clone, Copy)]
pub struct WindowCheck {
    /// Width of this window (e.g. one minute)
    pub width: Duration,
    /// Maximum admitted count within one bucket
    pub limit: u64,
    /// Count after this request was added
    pub count: u64,
    /// Instant the bucket resets
    pub expires_at: SystemTime,
}

/// Combined verdict across all configured window granularities.
#[derive(Debug, Clone, Copy)]
pub struct WindowVerdict {
    /// Whether the request is admitted by every granularity
    pub allowed: bool,
    /// Limit of the most restrictive granularity
    pub limit: u64,
    /// Minimum remaining count across granularities
    pub remaining: u64,
    /// Time until the latest-resetting exceeded window resets
    /// (present only when denied)
    pub retry_after: Option<Duration>,
    /// Earliest upcoming bucket boundary
    pub reset_at: SystemTime,
}

/// Combine post-increment window counts into a single verdict.
///
/// A request is denied when *any* granularity's post-increment count
/// exceeds its limit. `remaining` is the minimum remaining across all
/// granularities; `retry_after` is the time until the exceeded window
/// with the furthest reset comes round, so a caller that honors it is
/// admitted by every exceeded granularity on return.
pub fn combine_windows(checks: &[WindowCheck], now: SystemTime) -> WindowVerdict {
    let Some(first) = checks.first() else {
        // No granularities configured: nothing to enforce.
        return WindowVerdict {
            allowed: true,
            limit: u64::MAX,
            remaining: u64::MAX,
            retry_after: None,
            reset_at: now,
        };
    };

    let mut limit = first.limit;
    let mut remaining = u64::MAX;
    let mut reset_at = first.expires_at;
    let mut retry_until: Option<SystemTime> = None;

    for check in checks {
        let left = check.limit.saturating_sub(check.count);
        if left < remaining {
            remaining = left;
            limit = check.limit;
        }
        if check.expires_at < reset_at {
            reset_at = check.expires_at;
        }
        if check.count > check.limit {
            let until = retry_until.get_or_insert(check.expires_at);
            if check.expires_at > *until {
                *until = check.expires_at;
            }
        }
    }

    let retry_after = retry_until
        .map(|until| until.duration_since(now).unwrap_or(Duration::ZERO));

    WindowVerdict {
        allowed: retry_after.is_none(),
        limit,
        remaining,
        retry_after,
        reset_at,
    }
}
