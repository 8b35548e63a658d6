//! Syncmesh Storage
//!
//! Two layers with different lifetimes: a durable tiered file store
//! (hot/warm/cold directories with age-based placement and TTL) and a
//! purely in-memory multi-level LRU cache that demotes instead of
//! discarding.

pub mod cache;
pub mod error;
pub mod tiered;

pub use cache::{CacheEntry, CacheLevel, CacheStats, MultiTierCache, SharedCache};
pub use error::StorageError;
pub use tiered::{PutOptions, StorageKey, StorageStats, StorageTier, StoreConfig, TieredStore};

use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
