//! # tabsync
//!
//! Cache coherence and cross-tab synchronization for clients that keep
//! several views of the same origin open at once. One tab's write becomes
//! every tab's truth: cached data, session revocations, and refresh
//! schedules stay consistent without any tab talking to another directly.
//!
//! ## Features
//!
//! - **Two-axis freshness**: a cache entry is served only while its TTL has
//!   not run out *and* its version is at or above the tab's watermark, so
//!   invalidation works by date or by decree
//! - **Cross-tab propagation**: writes land in a shared origin store and
//!   every other tab is notified, with stale and duplicate notifications
//!   filtered by version
//! - **Single-flight fetches**: concurrent cache misses for one key share
//!   one fetch, success or failure
//! - **Stale fallback**: when the network is down, callers may opt into
//!   serving an expired entry instead of an error
//! - **Durable session revocation**: a persisted ledger with a retention
//!   window, per-tab callbacks, and sampled remote reconciliation
//! - **Midnight scheduling**: per-key daily refresh timers aligned to the
//!   local date rollover
//!
//! ## Quick start
//!
//! ```rust
//! use std::time::Duration;
//! use tabsync::{Broadcaster, CacheManager, GetOptions, Origin};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let origin = Origin::in_memory();
//!     let tab = origin.attach();
//!     let broadcaster = Broadcaster::new(&tab);
//!     let cache = CacheManager::new(tab, broadcaster);
//!
//!     let fetched = cache
//!         .get::<Vec<String>, _, _>(
//!             "shifts",
//!             || async { Ok(vec!["opening".to_string(), "closing".to_string()]) },
//!             Duration::from_secs(300),
//!             GetOptions::default(),
//!         )
//!         .await?;
//!
//!     println!("{} (from {})", fetched.data.join(", "), fetched.source);
//!     Ok(())
//! }
//! ```
//!
//! ## Session revocation
//!
//! ```rust
//! use tabsync::{Origin, RevocationLedger};
//!
//! # async fn demo() -> tabsync::Result<()> {
//! let origin = Origin::in_memory();
//! let ledger = RevocationLedger::new(origin.attach()).await;
//!
//! ledger.revoke("session-123").await?;
//! assert!(ledger.is_revoked("session-123"));
//! # Ok(())
//! # }
//! ```

pub mod broadcast;
pub mod cache;
pub mod error;
pub mod revocation;
pub mod schedule;
pub mod store;

pub use broadcast::{Broadcaster, CacheUpdate, Subscription};
pub use cache::{
    CacheConfig, CacheConfigBuilder, CacheEntry, CacheManager, CacheSource, CacheStats, Fetched,
    GetOptions, StoredRecord,
};
pub use error::{BoxError, Result, SyncError};
pub use revocation::{
    LedgerConfig, LedgerConfigBuilder, RevocationCheck, RevocationLedger, RevocationRecord,
    RevocationSubscription, LEDGER_KEY,
};
pub use schedule::{delay_until_next_midnight, MidnightScheduler, DAILY_PERIOD};
pub use store::{Origin, StoreEvent, StoreEvents, TabHandle};
