use std::time::{Duration, SystemTime};

use super::{CounterStore, WindowSlot};
use crate::core::bucket::{BucketState, TokenVerdict};
use crate::core::window::{bucket_bounds, bucket_id};

#[cfg(feature = "ahash")]
use ahash::AHashMap as HashMap;
#[cfg(not(feature = "ahash"))]
use std::collections::HashMap;

// Configuration constants
const DEFAULT_CAPACITY: usize = 1000;
const CAPACITY_OVERHEAD_FACTOR: f64 = 1.3;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
// Idle buckets are kept this long past the point they are back at
// capacity, so a rechecked key does not churn its entry.
const BUCKET_RECLAIM_GRACE: Duration = Duration::from_secs(60);

enum Entry {
    Window {
        bucket: u64,
        count: u64,
        expires_at: SystemTime,
    },
    Bucket {
        state: BucketState,
        reclaim_at: SystemTime,
    },
    Flag {
        expires_at: SystemTime,
    },
}

impl Entry {
    fn expired(&self, now: SystemTime) -> bool {
        match self {
            Entry::Window { expires_at, .. } | Entry::Flag { expires_at } => *expires_at <= now,
            Entry::Bucket { reclaim_at, .. } => *reclaim_at <= now,
        }
    }
}

/// In-process counter store with a periodic expired-entry sweep.
///
/// This is the fallback half of the admission engine's store pair: it
/// answers the same [`CounterStore`] contract as the shared backend,
/// but holds state in a process-local map. It offers no cross-process
/// consistency; within one process, atomicity comes from its owner
/// serializing access.
///
/// Expired entries are reclaimed by a sweep that runs at most once per
/// configured interval, piggybacked on mutations.
///
/// # Example
///
/// ```
/// use floodgate::MemoryStore;
/// use std::time::Duration;
///
/// let store = MemoryStore::builder()
///     .capacity(100_000)
///     .sweep_interval(Duration::from_secs(300))
///     .build();
/// ```
pub struct MemoryStore {
    data: HashMap<String, Entry>,
    // When the next sweep is due, measured on the clock callers pass
    // in; set from the first timestamp observed
    next_sweep: Option<SystemTime>,
    sweep_interval: Duration,
    // Entries removed by the last sweep
    swept: usize,
}

/// Builder for configuring a [`MemoryStore`].
pub struct MemoryStoreBuilder {
    capacity: usize,
    sweep_interval: Duration,
}

impl MemoryStore {
    /// Create a store with default capacity (1000 keys) and a
    /// 60-second sweep interval.
    pub fn new() -> Self {
        Self::with_config(
            DEFAULT_CAPACITY,
            Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
        )
    }

    /// Create a new builder for configuring a store.
    pub fn builder() -> MemoryStoreBuilder {
        MemoryStoreBuilder {
            capacity: DEFAULT_CAPACITY,
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
        }
    }

    fn with_config(capacity: usize, sweep_interval: Duration) -> Self {
        MemoryStore {
            // Pre-allocate with overhead to avoid rehashing
            data: HashMap::with_capacity((capacity as f64 * CAPACITY_OVERHEAD_FACTOR) as usize),
            next_sweep: None,
            sweep_interval,
            swept: 0,
        }
    }

    /// Number of live entries (including not-yet-swept expired ones).
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Entries removed by the most recent sweep.
    pub fn swept(&self) -> usize {
        self.swept
    }

    fn maybe_sweep(&mut self, now: SystemTime) {
        match self.next_sweep {
            None => self.next_sweep = Some(now + self.sweep_interval),
            Some(due) if now >= due => {
                let before = self.data.len();
                self.data.retain(|_, entry| !entry.expired(now));
                self.swept = before.saturating_sub(self.data.len());
                self.next_sweep = Some(now + self.sweep_interval);
            }
            Some(_) => {}
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterStore for MemoryStore {
    fn increment_window(
        &mut self,
        key: &str,
        width: Duration,
        now: SystemTime,
    ) -> Result<WindowSlot, String> {
        self.maybe_sweep(now);

        let current = bucket_id(now, width);
        let (_, bucket_end) = bucket_bounds(now, width);

        let entry = self.data.entry(key.to_string()).or_insert(Entry::Window {
            bucket: current,
            count: 0,
            expires_at: bucket_end,
        });

        match entry {
            Entry::Window {
                bucket,
                count,
                expires_at,
            } => {
                if *bucket != current {
                    // New bucket boundary: the previous count lapses
                    *bucket = current;
                    *count = 0;
                    *expires_at = bucket_end;
                }
                *count += 1;
                Ok(WindowSlot {
                    count: *count,
                    expires_at: *expires_at,
                })
            }
            _ => Err(format!("key {key} is not a window counter")),
        }
    }

    fn consume_tokens(
        &mut self,
        key: &str,
        capacity: f64,
        refill_per_sec: f64,
        requested: f64,
        now: SystemTime,
    ) -> Result<TokenVerdict, String> {
        self.maybe_sweep(now);

        let entry = self.data.entry(key.to_string()).or_insert(Entry::Bucket {
            state: BucketState::full(capacity, now),
            reclaim_at: now + BUCKET_RECLAIM_GRACE,
        });

        match entry {
            Entry::Bucket { state, reclaim_at } => {
                let verdict = state.try_consume(capacity, refill_per_sec, requested, now);
                let idle = state
                    .time_to_full(capacity, refill_per_sec)
                    .saturating_add(BUCKET_RECLAIM_GRACE);
                // A zero refill rate yields an unreachable reclaim time;
                // cap it so SystemTime arithmetic cannot overflow.
                *reclaim_at = now
                    .checked_add(idle)
                    .unwrap_or_else(|| now + Duration::from_secs(u32::MAX as u64));
                Ok(verdict)
            }
            _ => Err(format!("key {key} is not a token bucket")),
        }
    }

    fn window_count(&self, key: &str, width: Duration, now: SystemTime) -> Result<u64, String> {
        let current = bucket_id(now, width);
        match self.data.get(key) {
            Some(Entry::Window {
                bucket,
                count,
                expires_at,
            }) if *bucket == current && *expires_at > now => Ok(*count),
            _ => Ok(0),
        }
    }

    fn set_flag(&mut self, key: &str, ttl: Duration, now: SystemTime) -> Result<(), String> {
        self.maybe_sweep(now);
        self.data.insert(
            key.to_string(),
            Entry::Flag {
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    fn flag_expiry(&self, key: &str, now: SystemTime) -> Result<Option<SystemTime>, String> {
        match self.data.get(key) {
            Some(Entry::Flag { expires_at }) if *expires_at > now => Ok(Some(*expires_at)),
            _ => Ok(None),
        }
    }

    fn remove_prefix(&mut self, prefix: &str) -> Result<usize, String> {
        let before = self.data.len();
        self.data.retain(|key, _| !key.starts_with(prefix));
        Ok(before - self.data.len())
    }
}

impl Default for MemoryStoreBuilder {
    fn default() -> Self {
        MemoryStore::builder()
    }
}

impl MemoryStoreBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the expected capacity (number of unique keys).
    ///
    /// The store allocates 30% more space to reduce hash collisions.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the interval between expired-entry sweeps.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Build the store with the configured settings.
    pub fn build(self) -> MemoryStore {
        MemoryStore::with_config(self.capacity, self.sweep_interval)
    }
}
