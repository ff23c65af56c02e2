//! Durable cross-tab session revocation
//!
//! Revocations live in a single ledger record in the origin store, a JSON
//! array of `{ "uid", "timestamp" }` objects, so a session revoked in one
//! tab is revoked in every tab and stays revoked across restarts. Each
//! ledger keeps an in-memory mirror of that record for synchronous
//! [`RevocationLedger::is_revoked`] checks and invokes registered callbacks
//! once per newly observed revocation.
//!
//! Entries older than the retention window are pruned on every write, not
//! on read, so a stale entry remains visible (and keeps its session locked
//! out) until the next write touches the ledger. [`RevocationLedger::verify`]
//! closes the gap for sessions revoked while a client was offline by
//! consulting a caller-supplied remote lookup on a sampled fraction of
//! checks.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use crate::error::{BoxError, Result, SyncError};
use crate::store::TabHandle;

/// Store key under which the ledger record lives.
pub const LEDGER_KEY: &str = "session_revocations";

/// One revoked session in the persisted ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevocationRecord {
    /// Identifier of the revoked session.
    pub uid: String,
    /// Revocation instant, epoch milliseconds.
    pub timestamp: i64,
}

/// Configuration for a [`RevocationLedger`]
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// How long revocations are kept before a write prunes them
    pub retention: Duration,
    /// Fraction of `verify` calls that also consult the remote lookup
    pub remote_check_probability: f64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            remote_check_probability: 0.1,
        }
    }
}

impl LedgerConfig {
    /// Creates a new configuration builder
    pub fn builder() -> LedgerConfigBuilder {
        LedgerConfigBuilder::new()
    }

    /// Validates the configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.retention.is_zero() {
            return Err("retention must be greater than zero".to_string());
        }
        if !self.remote_check_probability.is_finite()
            || !(0.0..=1.0).contains(&self.remote_check_probability)
        {
            return Err("remote_check_probability must be within [0, 1]".to_string());
        }
        Ok(())
    }
}

/// Builder for [`LedgerConfig`]
pub struct LedgerConfigBuilder {
    retention: Option<Duration>,
    remote_check_probability: Option<f64>,
}

impl LedgerConfigBuilder {
    pub fn new() -> Self {
        Self {
            retention: None,
            remote_check_probability: None,
        }
    }

    /// Sets the retention window
    pub fn retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    /// Sets the sampled remote check probability
    pub fn remote_check_probability(mut self, probability: f64) -> Self {
        self.remote_check_probability = Some(probability);
        self
    }

    /// Builds the configuration
    pub fn build(self) -> LedgerConfig {
        let defaults = LedgerConfig::default();
        LedgerConfig {
            retention: self.retention.unwrap_or(defaults.retention),
            remote_check_probability: self
                .remote_check_probability
                .unwrap_or(defaults.remote_check_probability),
        }
    }
}

impl Default for LedgerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of a [`RevocationLedger::verify`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationCheck {
    /// The session is in the local ledger.
    RevokedLocally,
    /// The sampled remote lookup reported the session revoked; it has now
    /// been recorded locally too.
    RevokedRemotely,
    /// No revocation found.
    Clear,
}

type RevocationHandler = Arc<dyn Fn(&str) + Send + Sync>;

struct LedgerInner {
    tab: TabHandle,
    config: LedgerConfig,
    /// uid to revocation instant, epoch milliseconds.
    mirror: RwLock<HashMap<String, i64>>,
    handlers: RwLock<Vec<(u64, RevocationHandler)>>,
    next_id: AtomicU64,
    /// Serializes read-modify-write cycles on the ledger record.
    write_lock: Mutex<()>,
}

impl LedgerInner {
    fn parse_records(raw: &str) -> Vec<RevocationRecord> {
        match serde_json::from_str(raw) {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "revocation ledger is corrupt, treating as empty");
                Vec::new()
            }
        }
    }

    async fn load_records(&self) -> Vec<RevocationRecord> {
        match self.tab.load(LEDGER_KEY).await {
            Some(raw) => Self::parse_records(&raw),
            None => Vec::new(),
        }
    }

    async fn save_records(&self, records: &[RevocationRecord]) -> Result<()> {
        let json = serde_json::to_string(records)
            .map_err(|e| SyncError::SerializationError(e.to_string()))?;
        self.tab.save(LEDGER_KEY, json).await
    }

    /// Replaces the mirror with the given ledger contents and fires the
    /// callbacks once for each uid that was not present before.
    fn replace_mirror(&self, records: Vec<RevocationRecord>) {
        let mut next: HashMap<String, i64> = HashMap::new();
        for record in records {
            let RevocationRecord { uid, timestamp } = record;
            // Latest write wins when a uid appears more than once.
            next.entry(uid)
                .and_modify(|t| {
                    if timestamp > *t {
                        *t = timestamp;
                    }
                })
                .or_insert(timestamp);
        }

        let added: Vec<String> = {
            let mut mirror = match self.mirror.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let added = next
                .keys()
                .filter(|uid| !mirror.contains_key(*uid))
                .cloned()
                .collect();
            *mirror = next;
            added
        };

        if added.is_empty() {
            return;
        }
        debug!(count = added.len(), "new revocations observed");

        // Handlers run outside the locks so they may touch the ledger.
        let handlers: Vec<RevocationHandler> = {
            let handlers = match self.handlers.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            handlers.iter().map(|(_, h)| Arc::clone(h)).collect()
        };
        for uid in &added {
            for handler in &handlers {
                handler(uid);
            }
        }
    }

    fn apply_incoming(&self, new_value: Option<String>) {
        let records = match new_value {
            Some(raw) => Self::parse_records(&raw),
            None => Vec::new(),
        };
        self.replace_mirror(records);
    }

    fn unsubscribe(&self, id: u64) {
        let mut handlers = match self.handlers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers.retain(|(handler_id, _)| *handler_id != id);
    }
}

/// Cross-tab revocation ledger for one tab.
///
/// Cloning is cheap and clones share all state. Must be created inside a
/// Tokio runtime; construction spawns the task that watches for other
/// tabs' ledger writes.
#[derive(Clone)]
pub struct RevocationLedger {
    inner: Arc<LedgerInner>,
}

impl RevocationLedger {
    /// Creates a ledger with the default configuration.
    pub async fn new(tab: TabHandle) -> Self {
        Self::build(tab, LedgerConfig::default()).await
    }

    /// Creates a ledger with a custom configuration.
    pub async fn with_config(tab: TabHandle, config: LedgerConfig) -> Result<Self> {
        config.validate().map_err(SyncError::ConfigError)?;
        Ok(Self::build(tab, config).await)
    }

    async fn build(tab: TabHandle, config: LedgerConfig) -> Self {
        // Subscribe before the initial load so a write landing in between
        // is replayed rather than lost.
        let mut changes = tab.changes();
        let inner = Arc::new(LedgerInner {
            tab,
            config,
            mirror: RwLock::new(HashMap::new()),
            handlers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            write_lock: Mutex::new(()),
        });
        let initial = inner.load_records().await;
        inner.replace_mirror(initial);

        let weak: Weak<LedgerInner> = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(event) = changes.next().await {
                if event.key != LEDGER_KEY {
                    continue;
                }
                let Some(inner) = weak.upgrade() else { break };
                inner.apply_incoming(event.new_value);
            }
            trace!("ledger listener finished");
        });

        Self { inner }
    }

    /// Records `uid` as revoked, durably and in every tab.
    ///
    /// Entries older than the retention window are pruned as part of the
    /// write. Revoking an already revoked session refreshes its timestamp
    /// without firing the callbacks again.
    pub async fn revoke(&self, uid: &str) -> Result<()> {
        let _guard = self.inner.write_lock.lock().await;
        let now = Utc::now().timestamp_millis();
        let cutoff = now - self.inner.config.retention.as_millis() as i64;

        let mut records = self.inner.load_records().await;
        records.retain(|r| r.timestamp > cutoff && r.uid != uid);
        records.push(RevocationRecord {
            uid: uid.to_string(),
            timestamp: now,
        });

        self.inner.save_records(&records).await?;
        self.inner.replace_mirror(records);
        info!(uid, "session revoked");
        Ok(())
    }

    /// Removes `uid` from the ledger once the revocation has been handled.
    /// Acknowledging a session that is not in the ledger is a no-op.
    pub async fn acknowledge(&self, uid: &str) -> Result<()> {
        let _guard = self.inner.write_lock.lock().await;
        let cutoff =
            Utc::now().timestamp_millis() - self.inner.config.retention.as_millis() as i64;

        let mut records = self.inner.load_records().await;
        let before = records.len();
        records.retain(|r| r.uid != uid && r.timestamp > cutoff);

        if records.len() != before {
            self.inner.save_records(&records).await?;
            debug!(uid, "revocation acknowledged");
        }
        self.inner.replace_mirror(records);
        Ok(())
    }

    /// Whether `uid` is currently revoked, answered from the in-memory
    /// mirror without touching the store.
    pub fn is_revoked(&self, uid: &str) -> bool {
        let mirror = match self.inner.mirror.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        mirror.contains_key(uid)
    }

    /// When `uid` was revoked, if it is in the ledger.
    pub fn revoked_at(&self, uid: &str) -> Option<DateTime<Utc>> {
        let mirror = match self.inner.mirror.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let millis = mirror.get(uid).copied()?;
        DateTime::from_timestamp_millis(millis)
    }

    /// All currently revoked session identifiers.
    pub fn revoked_sessions(&self) -> Vec<String> {
        let mirror = match self.inner.mirror.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        mirror.keys().cloned().collect()
    }

    /// Registers a callback fired once per newly observed revocation, from
    /// any tab. Dropping the returned subscription unregisters it.
    pub fn on_revocation(
        &self,
        handler: impl Fn(&str) + Send + Sync + 'static,
    ) -> RevocationSubscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut handlers = match self.inner.handlers.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            handlers.push((id, Arc::new(handler)));
        }
        RevocationSubscription {
            inner: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Whether this `verify` call should also consult the remote lookup.
    pub fn should_check_remote(&self) -> bool {
        rand::random::<f64>() < self.inner.config.remote_check_probability
    }

    /// Checks `uid` against the local ledger and, on a sampled fraction of
    /// calls, against `remote_lookup` as well.
    ///
    /// A remote hit is recorded in the local ledger so every tab sees it
    /// from then on. A failed remote lookup is logged and the local answer
    /// stands; with the default sampling rate the expected number of
    /// verifies before a purely remote revocation is noticed is
    /// `1 / remote_check_probability`.
    pub async fn verify<F, Fut>(&self, uid: &str, remote_lookup: F) -> Result<RevocationCheck>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<bool, BoxError>>,
    {
        if self.is_revoked(uid) {
            return Ok(RevocationCheck::RevokedLocally);
        }
        if !self.should_check_remote() {
            return Ok(RevocationCheck::Clear);
        }

        debug!(uid, "sampled remote revocation check");
        match remote_lookup().await {
            Ok(true) => {
                self.revoke(uid).await?;
                Ok(RevocationCheck::RevokedRemotely)
            }
            Ok(false) => Ok(RevocationCheck::Clear),
            Err(e) => {
                warn!(uid, error = %e, "remote revocation check failed");
                Ok(RevocationCheck::Clear)
            }
        }
    }

    /// The active configuration.
    pub fn config(&self) -> &LedgerConfig {
        &self.inner.config
    }
}

/// Keeps one revocation callback registered; dropping it unregisters.
pub struct RevocationSubscription {
    inner: Weak<LedgerInner>,
    id: u64,
}

impl RevocationSubscription {
    /// Unregisters explicitly. Equivalent to dropping the subscription.
    pub fn cancel(self) {}
}

impl Drop for RevocationSubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.unsubscribe(self.id);
        }
    }
}
