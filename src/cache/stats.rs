//! Cache statistics

use serde::{Deserialize, Serialize};

/// Counters describing cache behavior since the manager was created
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    /// Gets served from a fresh persisted entry
    pub hits: u64,
    /// Gets that found no usable entry
    pub misses: u64,
    /// Fetches actually dispatched to the network collaborator
    pub network_fetches: u64,
    /// Gets that joined an already in-flight fetch instead of starting one
    pub shared_flights: u64,
    /// Gets answered from an expired entry after a fetch failure
    pub stale_fallbacks: u64,
    /// Entries removed by invalidate or clear
    pub invalidations: u64,
    /// Updates observed from other tabs
    pub remote_updates: u64,
}

impl CacheStats {
    /// Fraction of lookups served from cache, in `[0, 1]`
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Fraction of lookups that had to go past the cache, in `[0, 1]`
    pub fn miss_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.misses as f64 / total as f64
        }
    }
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "CacheStats {{ hits: {}, misses: {}, hit_rate: {:.2}%, network: {}, shared: {}, stale: {}, invalidated: {}, remote: {} }}",
            self.hits,
            self.misses,
            self.hit_rate() * 100.0,
            self.network_fetches,
            self.shared_flights,
            self.stale_fallbacks,
            self.invalidations,
            self.remote_updates
        )
    }
}
