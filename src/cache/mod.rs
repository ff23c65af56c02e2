//! Versioned, TTL-bounded caching over the origin store
//!
//! The cache layer persists fetched values as JSON records in the origin
//! store, serves them while they are fresh on both the TTL and version
//! axes, and coordinates with the broadcaster so every tab of the origin
//! agrees on what is current.

pub mod config;
pub mod entry;
pub mod manager;
pub mod stats;

pub use config::{CacheConfig, CacheConfigBuilder};
pub use entry::{record_key, CacheEntry, StoredRecord, CACHE_KEY_PREFIX, INITIAL_VERSION};
pub use manager::{CacheManager, CacheSource, Fetched, GetOptions};
pub use stats::CacheStats;
