//! Origin-scoped persistent store with per-tab handles
//!
//! An [`Origin`] owns a single key/value record set shared by every tab of
//! the same origin. Each tab works through its own [`TabHandle`], and every
//! write made through one handle is announced to all the *other* handles as
//! a [`StoreEvent`]. A handle never observes its own writes, which mirrors
//! how browsers deliver storage events to every tab of an origin except the
//! one that wrote.
//!
//! The record set is held in memory and can optionally be backed by a JSON
//! file, in which case it is reloaded on construction and rewritten on every
//! mutation so records survive process restarts.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, SyncError};

/// Capacity of the change-signal channel shared by all handles of an origin.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A change to one record of the origin store.
#[derive(Debug, Clone)]
pub struct StoreEvent {
    /// Identity of the handle that performed the write.
    pub writer: Uuid,
    /// Key of the record that changed.
    pub key: String,
    /// New raw value, or `None` when the record was removed.
    pub new_value: Option<String>,
}

struct OriginInner {
    records: RwLock<HashMap<String, String>>,
    events: broadcast::Sender<StoreEvent>,
    backing: Option<PathBuf>,
}

impl OriginInner {
    /// Rewrites the backing file, if any, from the given records.
    fn persist(&self, records: &HashMap<String, String>) -> Result<()> {
        if let Some(path) = &self.backing {
            let json = serde_json::to_string_pretty(records)
                .map_err(|e| SyncError::SerializationError(e.to_string()))?;
            std::fs::write(path, json)?;
        }
        Ok(())
    }

    fn notify(&self, event: StoreEvent) {
        // No receivers is fine; handles poll the shared map directly.
        let _ = self.events.send(event);
    }
}

/// The shared record set for one origin.
///
/// Cloning an `Origin` yields another reference to the same records; use
/// [`Origin::attach`] to create the per-tab handles that actually read and
/// write them.
#[derive(Clone)]
pub struct Origin {
    inner: Arc<OriginInner>,
}

impl Origin {
    /// Creates an origin whose records live only in memory.
    pub fn in_memory() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(OriginInner {
                records: RwLock::new(HashMap::new()),
                events,
                backing: None,
            }),
        }
    }

    /// Creates an origin backed by a JSON file at `path`.
    ///
    /// Existing records are reloaded from the file; a missing file starts
    /// the origin empty, and an unreadable one is logged and treated as
    /// empty rather than failing construction.
    pub fn with_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<HashMap<String, String>>(&raw) {
                Ok(map) => {
                    debug!(records = map.len(), path = %path.display(), "Origin store loaded");
                    map
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Origin store file is corrupt, starting empty");
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            inner: Arc::new(OriginInner {
                records: RwLock::new(records),
                events,
                backing: Some(path),
            }),
        })
    }

    /// Attaches a new tab to this origin.
    pub fn attach(&self) -> TabHandle {
        TabHandle {
            id: Uuid::new_v4(),
            origin: Arc::clone(&self.inner),
        }
    }
}

/// One tab's view of its origin store.
///
/// Handles are cheap to clone; clones share the tab identity, so a clone's
/// writes are still invisible to the original's [`TabHandle::changes`]
/// stream.
#[derive(Clone)]
pub struct TabHandle {
    id: Uuid,
    origin: Arc<OriginInner>,
}

impl TabHandle {
    /// The identity this handle writes under.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Reads the raw value stored under `key`.
    pub async fn load(&self, key: &str) -> Option<String> {
        self.origin.records.read().await.get(key).cloned()
    }

    /// Writes `value` under `key`, replacing any previous record.
    pub async fn save(&self, key: &str, value: String) -> Result<()> {
        {
            let mut records = self.origin.records.write().await;
            records.insert(key.to_string(), value.clone());
            self.origin.persist(&records)?;
        }
        self.origin.notify(StoreEvent {
            writer: self.id,
            key: key.to_string(),
            new_value: Some(value),
        });
        Ok(())
    }

    /// Removes the record under `key`. Returns whether a record existed.
    pub async fn remove(&self, key: &str) -> Result<bool> {
        let removed = {
            let mut records = self.origin.records.write().await;
            let removed = records.remove(key).is_some();
            if removed {
                self.origin.persist(&records)?;
            }
            removed
        };
        if removed {
            self.origin.notify(StoreEvent {
                writer: self.id,
                key: key.to_string(),
                new_value: None,
            });
        }
        Ok(removed)
    }

    /// All keys currently present in the origin store.
    pub async fn keys(&self) -> Vec<String> {
        self.origin.records.read().await.keys().cloned().collect()
    }

    /// A stream of changes written through *other* handles of this origin.
    pub fn changes(&self) -> StoreEvents {
        StoreEvents {
            tab: self.id,
            rx: self.origin.events.subscribe(),
        }
    }
}

/// Stream of [`StoreEvent`]s from the other tabs of an origin.
pub struct StoreEvents {
    tab: Uuid,
    rx: broadcast::Receiver<StoreEvent>,
}

impl StoreEvents {
    /// Waits for the next change made by another tab.
    ///
    /// Returns `None` once the origin has been dropped. A slow consumer that
    /// falls behind the channel capacity skips the overwritten events and
    /// keeps going; the shared map always holds the latest state anyway.
    pub async fn next(&mut self) -> Option<StoreEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.writer == self.tab => continue,
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "store event stream lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
