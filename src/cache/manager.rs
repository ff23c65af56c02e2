//! Cache manager: lookups, fetch orchestration, and version watermarks
//!
//! The manager sits between callers and the origin store. A `get` serves a
//! persisted entry while it is fresh on both axes (TTL not run out, version
//! at or above this tab's watermark) and otherwise runs the caller's fetch,
//! persists the result, and announces it through the [`Broadcaster`].
//!
//! Concurrent gets for the same key share one fetch: the first caller runs
//! it and every later caller waits on the same outcome, success or failure.
//! Updates observed from other tabs raise the local watermark so a version
//! bumped anywhere is honored everywhere without an extra fetch.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::broadcast::{Broadcaster, CacheUpdate, Subscription};
use crate::cache::config::CacheConfig;
use crate::cache::entry::{record_key, CacheEntry, StoredRecord, CACHE_KEY_PREFIX, INITIAL_VERSION};
use crate::cache::stats::CacheStats;
use crate::error::{BoxError, Result, SyncError};
use crate::store::TabHandle;

/// Where a [`Fetched`] value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    /// Served from a fresh persisted entry.
    Cache,
    /// Fetched from the collaborator during this call.
    Network,
    /// Served from an expired entry because the fetch failed.
    StaleFallback,
}

impl std::fmt::Display for CacheSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheSource::Cache => write!(f, "cache"),
            CacheSource::Network => write!(f, "network"),
            CacheSource::StaleFallback => write!(f, "stale-fallback"),
        }
    }
}

/// A value returned by [`CacheManager::get`], with its provenance.
#[derive(Debug, Clone)]
pub struct Fetched<T> {
    /// The value itself.
    pub data: T,
    /// Whether it came from cache, the network, or a stale fallback.
    pub source: CacheSource,
    /// Version of the entry the value was read from.
    pub version: u64,
    /// When that entry was written.
    pub as_of: DateTime<Utc>,
}

/// Per-call options for [`CacheManager::get`].
#[derive(Debug, Clone, Copy, Default)]
pub struct GetOptions {
    /// Skip the cache lookup and always fetch. If a fetch for the key is
    /// already in flight, the call joins it instead of starting another.
    pub force_refresh: bool,
    /// On fetch failure, serve an expired or version-stale entry if one is
    /// still persisted, instead of returning the error.
    pub allow_stale_on_error: bool,
}

type FlightResult = std::result::Result<StoredRecord, String>;

enum FlightRole {
    Leader(watch::Sender<Option<FlightResult>>),
    Follower(watch::Receiver<Option<FlightResult>>),
}

/// Removes the in-flight marker when the leader finishes or is cancelled,
/// so an abandoned fetch never wedges the key.
struct FlightGuard<'a> {
    inner: &'a ManagerInner,
    key: &'a str,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.inner.lock_inflight().remove(self.key);
    }
}

struct ManagerInner {
    tab: TabHandle,
    broadcaster: Broadcaster,
    config: CacheConfig,
    watermarks: RwLock<HashMap<String, u64>>,
    inflight: Mutex<HashMap<String, watch::Receiver<Option<FlightResult>>>>,
    stats: Mutex<CacheStats>,
}

impl ManagerInner {
    fn lock_inflight(&self) -> MutexGuard<'_, HashMap<String, watch::Receiver<Option<FlightResult>>>> {
        match self.inflight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn track(&self, update: impl FnOnce(&mut CacheStats)) {
        if !self.config.enable_metrics {
            return;
        }
        let mut stats = match self.stats.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        update(&mut stats);
    }

    fn watermark(&self, key: &str) -> u64 {
        let watermarks = match self.watermarks.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        watermarks.get(key).copied().unwrap_or(0)
    }

    /// Raises the watermark for `key` to `version` if that is an advance.
    fn raise_watermark(&self, key: &str, version: u64) -> bool {
        let mut watermarks = match self.watermarks.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let current = watermarks.entry(key.to_string()).or_insert(0);
        if version > *current {
            *current = version;
            true
        } else {
            false
        }
    }

    /// Handles an update delivered by the broadcaster, from either tab.
    fn apply_observed(&self, update: &CacheUpdate) {
        if self.raise_watermark(&update.key, update.version) {
            trace!(key = %update.key, version = update.version, "observed update advanced watermark");
            self.track(|s| s.remote_updates += 1);
        }
    }

    async fn persisted_version(&self, record_key: &str) -> Option<u64> {
        let raw = self.tab.load(record_key).await?;
        StoredRecord::parse(&raw).ok().map(|r| r.version)
    }

    async fn purge(&self, record_key: &str) {
        if let Err(e) = self.tab.remove(record_key).await {
            warn!(record_key, error = %e, "failed to purge cache record");
        }
    }

    /// Persists a fetched value and announces it.
    ///
    /// The written version keeps whatever is already persisted unless this
    /// tab's watermark is ahead, in which case the watermark wins; a bump
    /// therefore always produces a strictly newer version on refetch.
    async fn write_entry<T: Serialize>(
        &self,
        key: &str,
        record_key: &str,
        data: &T,
        ttl: Duration,
    ) -> Result<StoredRecord> {
        let persisted = self.persisted_version(record_key).await;
        let version = persisted.unwrap_or(INITIAL_VERSION).max(self.watermark(key));

        let record = CacheEntry::new(key, data, ttl, version)?.to_record()?;
        self.tab.save(record_key, record.to_json()?).await?;
        self.raise_watermark(key, version);
        self.broadcaster.publish(CacheUpdate {
            key: key.to_string(),
            version,
            as_of: record.created_at(),
        });
        debug!(key, version, "cache entry written");
        Ok(record)
    }

    fn join_flight(&self, key: &str) -> FlightRole {
        let mut inflight = self.lock_inflight();
        if let Some(rx) = inflight.get(key) {
            FlightRole::Follower(rx.clone())
        } else {
            let (tx, rx) = watch::channel(None);
            inflight.insert(key.to_string(), rx);
            FlightRole::Leader(tx)
        }
    }
}

/// Versioned, TTL-bounded cache over one tab's origin store.
///
/// Cloning is cheap and clones share all state. Construction must happen
/// inside a Tokio runtime because the paired [`Broadcaster`] listens for
/// other tabs' writes in a background task.
#[derive(Clone)]
pub struct CacheManager {
    inner: Arc<ManagerInner>,
    _watermark_sync: Arc<Subscription>,
}

impl CacheManager {
    /// Creates a manager with the default configuration.
    pub fn new(tab: TabHandle, broadcaster: Broadcaster) -> Self {
        Self::build(tab, broadcaster, CacheConfig::default())
    }

    /// Creates a manager with a custom configuration.
    pub fn with_config(
        tab: TabHandle,
        broadcaster: Broadcaster,
        config: CacheConfig,
    ) -> Result<Self> {
        config.validate().map_err(SyncError::ConfigError)?;
        Ok(Self::build(tab, broadcaster, config))
    }

    fn build(tab: TabHandle, broadcaster: Broadcaster, config: CacheConfig) -> Self {
        let inner = Arc::new(ManagerInner {
            tab,
            broadcaster: broadcaster.clone(),
            config,
            watermarks: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            stats: Mutex::new(CacheStats::default()),
        });

        // The subscription keeps this tab's watermarks in step with every
        // update the broadcaster delivers, whichever tab wrote it. Holding
        // the inner state weakly lets the manager drop normally.
        let weak: Weak<ManagerInner> = Arc::downgrade(&inner);
        let watermark_sync = broadcaster.subscribe_all(move |update| {
            if let Some(inner) = weak.upgrade() {
                inner.apply_observed(update);
            }
        });

        Self {
            inner,
            _watermark_sync: Arc::new(watermark_sync),
        }
    }

    /// Returns the value for `key`, from cache when fresh, otherwise by
    /// running `fetch` and persisting its result with the given TTL.
    ///
    /// All gets for one key must use the same payload type; the entry is
    /// decoded from its persisted JSON form on every cache hit.
    pub async fn get<T, F, Fut>(
        &self,
        key: &str,
        fetch: F,
        ttl: Duration,
        options: GetOptions,
    ) -> Result<Fetched<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, BoxError>>,
    {
        if ttl.is_zero() {
            return Err(SyncError::ConfigError(
                "ttl must be greater than zero".to_string(),
            ));
        }

        let record_key = record_key(key);
        if !options.force_refresh {
            if let Some(found) = self.try_cached::<T>(key, &record_key, options).await {
                self.inner.track(|s| s.hits += 1);
                return Ok(found);
            }
            self.inner.track(|s| s.misses += 1);
        }

        self.fetch_shared(key, &record_key, fetch, ttl, options).await
    }

    /// `get` with the configured default TTL.
    pub async fn get_with_default_ttl<T, F, Fut>(
        &self,
        key: &str,
        fetch: F,
        options: GetOptions,
    ) -> Result<Fetched<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, BoxError>>,
    {
        let ttl = self.inner.config.default_ttl;
        self.get(key, fetch, ttl, options).await
    }

    /// Fetches unconditionally, replacing whatever is cached.
    ///
    /// The persisted version is unchanged unless a bump is outstanding.
    pub async fn refresh<T, F, Fut>(&self, key: &str, fetch: F, ttl: Duration) -> Result<Fetched<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, BoxError>>,
    {
        self.get(
            key,
            fetch,
            ttl,
            GetOptions {
                force_refresh: true,
                allow_stale_on_error: false,
            },
        )
        .await
    }

    /// Removes the persisted entry for `key`. Removing an absent entry is
    /// a no-op.
    pub async fn invalidate(&self, key: &str) -> Result<()> {
        let removed = self.inner.tab.remove(&record_key(key)).await?;
        if removed {
            self.inner.track(|s| s.invalidations += 1);
            debug!(key, "cache entry invalidated");
        }
        Ok(())
    }

    /// Removes every cache record of this origin, leaving unrelated
    /// records (the revocation ledger among them) alone. Returns how many
    /// entries were removed.
    pub async fn clear(&self) -> Result<usize> {
        let keys = self.inner.tab.keys().await;
        let mut removed = 0usize;
        for key in keys {
            if key.starts_with(CACHE_KEY_PREFIX) && self.inner.tab.remove(&key).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            self.inner.track(|s| s.invalidations += removed as u64);
        }
        info!(removed, "cache cleared");
        Ok(removed)
    }

    /// Marks `key` as needing a refetch by raising this tab's watermark
    /// above anything persisted. Returns the new watermark.
    ///
    /// The persisted entry is left in place (it may still serve as a stale
    /// fallback); the next `get` refetches and writes a strictly newer
    /// version, which carries the bump to every other tab.
    pub async fn bump_version(&self, key: &str) -> u64 {
        let persisted = self.inner.persisted_version(&record_key(key)).await;
        let next = {
            let mut watermarks = match self.inner.watermarks.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let current = watermarks.entry(key.to_string()).or_insert(0);
            let next = (*current).max(persisted.unwrap_or(0)) + 1;
            *current = next;
            next
        };
        debug!(key, watermark = next, "version watermark bumped");
        next
    }

    /// This tab's minimum acceptable version for `key` (0 when no update
    /// has been seen and no bump has happened).
    pub fn version_watermark(&self, key: &str) -> u64 {
        self.inner.watermark(key)
    }

    /// Counters collected so far.
    pub fn stats(&self) -> CacheStats {
        let stats = match self.inner.stats.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        stats.clone()
    }

    /// The broadcaster this manager announces writes through.
    pub fn broadcaster(&self) -> &Broadcaster {
        &self.inner.broadcaster
    }

    /// The active configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Serves from the persisted entry when it is usable, purging records
    /// that can never be served again.
    async fn try_cached<T: DeserializeOwned>(
        &self,
        key: &str,
        record_key: &str,
        options: GetOptions,
    ) -> Option<Fetched<T>> {
        let raw = self.inner.tab.load(record_key).await?;
        let record = match StoredRecord::parse(&raw) {
            Ok(record) => record,
            Err(e) => {
                warn!(key, error = %e, "malformed cache record purged");
                self.inner.purge(record_key).await;
                return None;
            }
        };

        let now = Utc::now();
        if record.is_expired(now) {
            debug!(key, "cache entry expired");
            // Kept only when the caller may want it as a fallback.
            if !options.allow_stale_on_error {
                self.inner.purge(record_key).await;
            }
            return None;
        }

        let watermark = self.inner.watermark(key);
        if record.version < watermark {
            debug!(key, version = record.version, watermark, "cache entry below watermark");
            return None;
        }

        match CacheEntry::<T>::from_record(key, &record) {
            Ok(entry) => {
                debug!(key, version = record.version, "cache hit");
                Some(Fetched {
                    data: entry.data,
                    source: CacheSource::Cache,
                    version: record.version,
                    as_of: record.created_at(),
                })
            }
            Err(e) => {
                warn!(key, error = %e, "undecodable cache record purged");
                self.inner.purge(record_key).await;
                None
            }
        }
    }

    /// Runs the fetch as leader, or waits on the outcome of whichever call
    /// got there first.
    async fn fetch_shared<T, F, Fut>(
        &self,
        key: &str,
        record_key: &str,
        fetch: F,
        ttl: Duration,
        options: GetOptions,
    ) -> Result<Fetched<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, BoxError>>,
    {
        match self.inner.join_flight(key) {
            FlightRole::Follower(mut rx) => {
                debug!(key, "joining in-flight fetch");
                self.inner.track(|s| s.shared_flights += 1);

                let outcome = match rx.wait_for(|state| state.is_some()).await {
                    Ok(state) => (*state)
                        .clone()
                        .unwrap_or_else(|| Err("fetch aborted".to_string())),
                    Err(_) => Err("fetch aborted".to_string()),
                };

                match outcome {
                    Ok(record) => {
                        let entry = CacheEntry::<T>::from_record(key, &record)?;
                        Ok(Fetched {
                            data: entry.data,
                            source: CacheSource::Network,
                            version: record.version,
                            as_of: record.created_at(),
                        })
                    }
                    Err(reason) => {
                        self.serve_stale_or_fail(key, record_key, reason, options).await
                    }
                }
            }
            FlightRole::Leader(tx) => {
                debug!(key, "fetching from source");
                self.inner.track(|s| s.network_fetches += 1);
                let guard = FlightGuard {
                    inner: &self.inner,
                    key,
                };

                match fetch().await {
                    Ok(data) => {
                        match self.inner.write_entry(key, record_key, &data, ttl).await {
                            Ok(record) => {
                                drop(guard);
                                let _ = tx.send(Some(Ok(record.clone())));
                                Ok(Fetched {
                                    data,
                                    source: CacheSource::Network,
                                    version: record.version,
                                    as_of: record.created_at(),
                                })
                            }
                            Err(e) => {
                                drop(guard);
                                let _ = tx.send(Some(Err(e.to_string())));
                                Err(e)
                            }
                        }
                    }
                    Err(e) => {
                        let reason = e.to_string();
                        warn!(key, error = %reason, "fetch failed");
                        drop(guard);
                        let _ = tx.send(Some(Err(reason.clone())));
                        self.serve_stale_or_fail(key, record_key, reason, options).await
                    }
                }
            }
        }
    }

    /// After a failed fetch, serves whatever entry is still persisted if
    /// the caller allowed it, else surfaces the failure.
    async fn serve_stale_or_fail<T: DeserializeOwned>(
        &self,
        key: &str,
        record_key: &str,
        reason: String,
        options: GetOptions,
    ) -> Result<Fetched<T>> {
        if options.allow_stale_on_error {
            if let Some(raw) = self.inner.tab.load(record_key).await {
                if let Ok(record) = StoredRecord::parse(&raw) {
                    if let Ok(entry) = CacheEntry::<T>::from_record(key, &record) {
                        warn!(key, reason = %reason, "serving stale entry after failed fetch");
                        self.inner.track(|s| s.stale_fallbacks += 1);
                        return Ok(Fetched {
                            data: entry.data,
                            source: CacheSource::StaleFallback,
                            version: record.version,
                            as_of: record.created_at(),
                        });
                    }
                }
            }
        }
        Err(SyncError::FetchError {
            key: key.to_string(),
            reason,
        })
    }
}
