//! # Floodgate
//!
//! Counting primitives for admission control: fixed-window counters and
//! token buckets, plus an in-memory counter store with TTL-based expiry.
//!
//! ## Overview
//!
//! Floodgate is the algorithm core of an admission-control engine. It is
//! deliberately synchronous and dependency-light: every time-dependent
//! operation takes `now: SystemTime` as a parameter, so callers control
//! the clock and tests can simulate the passage of time.
//!
//! Two counting algorithms are provided:
//!
//! - **Fixed-window counting**: requests are counted per time bucket
//!   (`floor(now / width)`); the count resets at the next bucket
//!   boundary. Several bucket widths (minute/hour/day) can be combined
//!   into one verdict with [`combine_windows`]. This approximates a
//!   sliding window and can admit up to `2x` the limit at a bucket
//!   boundary, a deliberate trade-off for O(1) atomic operations.
//! - **Token bucket**: a capacity of tokens replenished continuously at
//!   a fixed rate; a request consumes tokens and is denied when not
//!   enough remain.
//!
//! ## Quick Start
//!
//! ```
//! use floodgate::{CounterStore, MemoryStore};
//! use std::time::{Duration, SystemTime};
//!
//! let mut store = MemoryStore::new();
//! let now = SystemTime::now();
//!
//! // Count a request in the current one-minute bucket
//! let slot = store
//!     .increment_window("user:42:chat.send:60", Duration::from_secs(60), now)
//!     .unwrap();
//! assert_eq!(slot.count, 1);
//!
//! // Consume 5 tokens from a bucket of 10, refilled at 0.2/s
//! let verdict = store
//!     .consume_tokens("user:42:chat.send", 10.0, 0.2, 5.0, now)
//!     .unwrap();
//! assert!(verdict.allowed);
//! ```
//!
//! ## Store expiry
//!
//! [`MemoryStore`] prunes expired entries with a periodic sweep,
//! configurable through its builder:
//!
//! ```
//! use floodgate::MemoryStore;
//! use std::time::Duration;
//!
//! let store = MemoryStore::builder()
//!     .capacity(100_000)
//!     .sweep_interval(Duration::from_secs(60))
//!     .build();
//! ```
//!
//! ## Thread Safety
//!
//! The store is not thread-safe by itself. For concurrent access, either
//! wrap it in a mutex or own it from a single task and serialize access
//! through a channel.
//!
//! ## Features
//!
//! - `ahash` (default): Use AHash for faster hashing

pub mod core;

pub use core::{
    BucketState, CounterStore, MemoryStore, MemoryStoreBuilder, TokenVerdict, WindowCheck,
    WindowSlot, WindowVerdict, bucket_bounds, bucket_id, combine_windows,
};
