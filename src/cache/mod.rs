//! Tiered response cache for offline support.
//!
//! This module provides:
//! - Four named, versioned tiers (static, dynamic, api, images), each FIFO-bounded
//! - A TTL side index for API responses, since tiers have no native expiry
//! - SQLite and in-memory storage backends behind the same traits

mod memory;
mod storage;
mod tiers;
mod traits;

pub use memory::MemoryStorage;
pub use storage::SqliteStorage;
pub use tiers::CacheTiers;
pub use traits::{
  CacheEntry, CacheResult, CacheSource, DurableStore, TierKind, TierStore, TtlStore,
};
