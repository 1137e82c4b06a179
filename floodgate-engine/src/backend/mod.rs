//! Counting backends
//!
//! [`CounterBackend`] is the async face of the core store contract.
//! Three implementations share it:
//!
//! - [`RedisBackend`]: the shared backend; every mutation is a Lua
//!   script, so concurrent callers across processes never race.
//! - [`MemoryBackend`]: a process-local fallback; a single actor task
//!   owns a [`floodgate::MemoryStore`] and serializes access.
//! - [`FailoverBackend`]: picks between the two at call time with a
//!   bounded timeout, so the request path never hangs on a dead
//!   backend.
//!
//! Callers hold an `Arc<dyn CounterBackend>` and are indifferent to
//! which implementation answers. Fallback mode trades cross-process
//! consistency for availability; that downgrade is logged, not hidden.

use async_trait::async_trait;
use std::time::{Duration, SystemTime};

use crate::error::BackendError;
pub use floodgate::{TokenVerdict, WindowSlot};

mod failover;
mod memory;
mod redis;

pub use failover::FailoverBackend;
pub use memory::MemoryBackend;
pub use redis::RedisBackend;

/// Async store contract shared by all counting backends.
///
/// Mirrors [`floodgate::CounterStore`], with errors upgraded to the
/// engine's [`BackendError`] taxonomy and `ping` added for the
/// failover probe.
#[async_trait]
pub trait CounterBackend: Send + Sync {
    /// Atomically increment the window counter for the bucket `now`
    /// falls into.
    async fn increment_window(
        &self,
        key: &str,
        width: Duration,
        now: SystemTime,
    ) -> Result<WindowSlot, BackendError>;

    /// Atomically refill and consume from a token bucket.
    async fn consume_tokens(
        &self,
        key: &str,
        capacity: f64,
        refill_per_sec: f64,
        requested: f64,
        now: SystemTime,
    ) -> Result<TokenVerdict, BackendError>;

    /// Best-effort read of the current window count.
    async fn window_count(
        &self,
        key: &str,
        width: Duration,
        now: SystemTime,
    ) -> Result<u64, BackendError>;

    /// Arm a TTL flag (subject block marker).
    async fn set_flag(&self, key: &str, ttl: Duration, now: SystemTime)
    -> Result<(), BackendError>;

    /// Expiry of a live flag, or `None` when absent.
    async fn flag_expiry(
        &self,
        key: &str,
        now: SystemTime,
    ) -> Result<Option<SystemTime>, BackendError>;

    /// Delete all counters under a key prefix (administrative).
    async fn remove_prefix(&self, prefix: &str) -> Result<usize, BackendError>;

    /// Liveness check used by the failover probe.
    async fn ping(&self) -> Result<(), BackendError>;
}

/// Key layout shared by every backend, so an administrative reset
/// addresses the same entries regardless of which backend holds them.
pub mod keys {
    use std::time::Duration;

    /// Subject used for service-protection (global) limits.
    pub const GLOBAL_SUBJECT: &str = "global";

    /// Prefix covering every counter of one subject.
    pub fn subject_prefix(subject: &str) -> String {
        format!("fg:{subject}:")
    }

    /// Prefix covering one subject's counters for one operation.
    pub fn operation_prefix(subject: &str, operation: &str) -> String {
        format!("fg:{subject}:{operation}:")
    }

    /// Window counter key for one granularity.
    pub fn window(subject: &str, operation: &str, width: Duration) -> String {
        format!("fg:{subject}:{operation}:w{}", width.as_secs())
    }

    /// Token bucket key.
    pub fn bucket(subject: &str, operation: &str) -> String {
        format!("fg:{subject}:{operation}:tb")
    }

    /// Block flag key.
    pub fn block(subject: &str, operation: &str) -> String {
        format!("fg:{subject}:{operation}:block")
    }
}
