//! Shared durable slot store with cross-context change notifications.
//!
//! Models the origin-wide durable storage: string slots shared by every
//! context attached to a host, change events delivered only to *other*
//! contexts, an optional byte quota, and an optional JSON snapshot file so
//! slots survive process restarts.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use dashmap::DashMap;
use parking_lot::Mutex;

/// Change callback: `(slot, new_value)`. Only fires when the stored value
/// actually changed, matching platform storage-event semantics.
pub type WatchFn = Arc<dyn Fn(&str, &str) + Send + Sync>;

struct Watcher {
    id: u64,
    token: u64,
    callback: WatchFn,
}

/// Origin-wide slot store. One instance per [`Host`](crate::Host); contexts
/// interact through per-context [`StoreHandle`]s.
pub struct SharedStore {
    slots: DashMap<String, String>,
    watchers: Mutex<Vec<Watcher>>,
    next_token: AtomicU64,
    next_watcher: AtomicU64,
    used: AtomicUsize,
    quota: Option<usize>,
    snapshot_path: Option<PathBuf>,
}

impl SharedStore {
    pub(crate) fn new(quota: Option<usize>, snapshot_path: Option<PathBuf>) -> Self {
        let store = Self {
            slots: DashMap::new(),
            watchers: Mutex::new(Vec::new()),
            next_token: AtomicU64::new(1),
            next_watcher: AtomicU64::new(1),
            used: AtomicUsize::new(0),
            quota,
            snapshot_path,
        };
        store.load_snapshot();
        store
    }

    /// Mint a context-scoped view. Writes through one handle never trigger
    /// watchers registered through a handle with the same token.
    pub fn handle(self: &Arc<Self>) -> StoreHandle {
        StoreHandle {
            store: Arc::clone(self),
            token: self.next_token.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn get(&self, slot: &str) -> Option<String> {
        self.slots.get(slot).map(|v| v.value().clone())
    }

    fn set(&self, token: u64, slot: &str, value: &str) -> Result<()> {
        let incoming = slot.len() + value.len();
        let current = self
            .slots
            .get(slot)
            .map(|v| slot.len() + v.len())
            .unwrap_or(0);

        if let Some(quota) = self.quota {
            let projected = self.used.load(Ordering::Relaxed) - current + incoming;
            if projected > quota {
                bail!("storage quota exceeded writing slot '{slot}'");
            }
        }

        let previous = self.slots.insert(slot.to_owned(), value.to_owned());
        if current > 0 {
            self.used.fetch_sub(current, Ordering::Relaxed);
        }
        self.used.fetch_add(incoming, Ordering::Relaxed);
        self.write_snapshot();

        if previous.as_deref() != Some(value) {
            self.notify(token, slot, value);
        }
        Ok(())
    }

    fn remove(&self, slot: &str) {
        if let Some((k, v)) = self.slots.remove(slot) {
            self.used.fetch_sub(k.len() + v.len(), Ordering::Relaxed);
            self.write_snapshot();
        }
    }

    fn watch(&self, token: u64, callback: WatchFn) -> u64 {
        let id = self.next_watcher.fetch_add(1, Ordering::Relaxed);
        self.watchers.lock().push(Watcher {
            id,
            token,
            callback,
        });
        id
    }

    fn unwatch(&self, id: u64) {
        self.watchers.lock().retain(|w| w.id != id);
    }

    fn notify(&self, from_token: u64, slot: &str, value: &str) {
        // Snapshot first; a watcher may register or remove watchers.
        let targets: Vec<WatchFn> = self
            .watchers
            .lock()
            .iter()
            .filter(|w| w.token != from_token)
            .map(|w| Arc::clone(&w.callback))
            .collect();

        for callback in targets {
            callback(slot, value);
        }
    }

    fn load_snapshot(&self) {
        let Some(path) = &self.snapshot_path else {
            return;
        };
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(_) => return,
        };
        match serde_json::from_str::<BTreeMap<String, String>>(&text) {
            Ok(slots) => {
                for (k, v) in slots {
                    self.used.fetch_add(k.len() + v.len(), Ordering::Relaxed);
                    self.slots.insert(k, v);
                }
            }
            Err(err) => {
                tracing::debug!(path = %path.display(), %err, "ignoring corrupt store snapshot");
            }
        }
    }

    fn write_snapshot(&self) {
        let Some(path) = &self.snapshot_path else {
            return;
        };
        let slots: BTreeMap<String, String> = self
            .slots
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let text = match serde_json::to_string_pretty(&slots) {
            Ok(text) => text,
            Err(_) => return,
        };
        if let Err(err) = std::fs::write(path, text) {
            tracing::debug!(path = %path.display(), %err, "store snapshot write failed");
        }
    }
}

/// A context's view of the [`SharedStore`].
#[derive(Clone)]
pub struct StoreHandle {
    store: Arc<SharedStore>,
    token: u64,
}

impl StoreHandle {
    pub fn get(&self, slot: &str) -> Option<String> {
        self.store.get(slot)
    }

    /// Write a slot. Fails only when the store's byte quota would be passed;
    /// watchers in other contexts fire if the value actually changed.
    pub fn set(&self, slot: &str, value: &str) -> Result<()> {
        self.store.set(self.token, slot, value)
    }

    pub fn remove(&self, slot: &str) {
        self.store.remove(slot)
    }

    /// Register a change watcher. Writes made through this handle's own
    /// token are never reported to it.
    pub fn watch(&self, callback: WatchFn) -> u64 {
        self.store.watch(self.token, callback)
    }

    pub fn unwatch(&self, id: u64) {
        self.store.unwatch(id)
    }
}

/// Per-context short-lived storage, the session-scoped sibling of
/// [`SharedStore`]. Lives and dies with the context that owns it; a reload
/// of the same context keeps it, a new context starts empty.
#[derive(Default)]
pub struct SessionStore {
    slots: DashMap<String, String>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, slot: &str) -> Option<String> {
        self.slots.get(slot).map(|v| v.value().clone())
    }

    pub fn set(&self, slot: &str, value: &str) {
        self.slots.insert(slot.to_owned(), value.to_owned());
    }

    pub fn remove(&self, slot: &str) {
        self.slots.remove(slot);
    }
}
