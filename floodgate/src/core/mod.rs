//! Core components of the floodgate counting library
//!
//! This module contains the fundamental building blocks:
//! - [`window`]: fixed-window bucket math and the multi-window combine rule
//! - [`bucket`]: token-bucket refill and consume math
//! - [`store`]: storage for counter and bucket state

pub mod bucket;
pub mod store;
pub mod window;


pub use bucket::{BucketState, TokenVerdict};
pub use store::{CounterStore, MemoryStore, MemoryStoreBuilder, WindowSlot};
pub use window::{WindowCheck, WindowVerdict, bucket_bounds, bucket_id, combine_windows};
