//! Request caching over versioned local stores.
//!
//! This module provides:
//! - Named stores, one per generation, holding whole-response snapshots
//! - The four resolution strategies (network-only, network-first, cache-first,
//!   stale-while-revalidate)
//! - Offline fallbacks so a read request always gets a response

mod layer;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use storage::{CacheEntry, CacheStorage, SqliteStorage};
pub use traits::{CacheSource, RequestKey, Resolved};
