use std::time::{Duration, SystemTime};

use super::bucket::TokenVerdict;

mod memory;

pub use memory::{MemoryStore, MemoryStoreBuilder};

#[cfg(test)]
mod tests;

/// Post-increment state of one window counter.
#[derive(Debug, Clone, Copy)]
pub struct WindowSlot {
    /// Count including this request
    pub count: u64,
    /// Instant the bucket resets
    pub expires_at: SystemTime,
}

/// Store contract for counter and bucket state.
///
/// One key identifies one counter. Window counters reset themselves at
/// each bucket boundary; token buckets carry their own refill state;
/// flags are plain TTL markers (used for temporary subject blocks).
///
/// Each mutation must be atomic per key with respect to the store's
/// own callers: implementations are either owned by a single task or
/// guarded externally. The methods report failures as strings so a
/// remote implementation can surface transport errors through the
/// same contract.
pub trait CounterStore {
    /// Atomically increment the counter for the bucket `now` falls
    /// into, creating it (and its expiry) on first access.
    fn increment_window(
        &mut self,
        key: &str,
        width: Duration,
        now: SystemTime,
    ) -> Result<WindowSlot, String>;

    /// Refill the bucket to `now`, then consume `requested` tokens if
    /// available. Creates a full bucket on first access.
    fn consume_tokens(
        &mut self,
        key: &str,
        capacity: f64,
        refill_per_sec: f64,
        requested: f64,
        now: SystemTime,
    ) -> Result<TokenVerdict, String>;

    /// Current count for the bucket `now` falls into, without
    /// incrementing. Best-effort read.
    fn window_count(&self, key: &str, width: Duration, now: SystemTime) -> Result<u64, String>;

    /// Arm a TTL flag under `key`, replacing any existing expiry.
    fn set_flag(&mut self, key: &str, ttl: Duration, now: SystemTime) -> Result<(), String>;

    /// Expiry of a live flag, or `None` when absent or lapsed.
    fn flag_expiry(&self, key: &str, now: SystemTime) -> Result<Option<SystemTime>, String>;

    /// Delete every entry whose key starts with `prefix`, returning
    /// how many were removed. Administrative use.
    fn remove_prefix(&mut self, prefix: &str) -> Result<usize, String>;
}
