//! Platform capability surface shared by every context of one "origin".
//!
//! A [`Host`] bundles the two cross-context primitives — the broadcast bus
//! and the shared slot store — behind optional capabilities so tests and
//! degraded environments can disable either one. A detached host has no
//! capabilities at all and models running outside a browsing context.

pub mod bus;
pub mod store;

use std::path::PathBuf;
use std::sync::Arc;

pub use bus::{BroadcastBus, BusHandle, BusSink};
pub use store::{SessionStore, SharedStore, StoreHandle, WatchFn};

struct HostInner {
    bus: Option<Arc<BroadcastBus>>,
    store: Option<Arc<SharedStore>>,
    detached: bool,
}

/// Cloneable handle to one origin's platform capabilities.
#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

impl Host {
    /// Host with every capability enabled and no artificial limits.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> HostBuilder {
        HostBuilder::default()
    }

    /// Host with no capabilities: no bus, no storage, no session scope.
    /// Channels on a detached host degrade to local-only state.
    pub fn detached() -> Self {
        Self {
            inner: Arc::new(HostInner {
                bus: None,
                store: None,
                detached: true,
            }),
        }
    }

    pub fn bus(&self) -> Option<&Arc<BroadcastBus>> {
        self.inner.bus.as_ref()
    }

    pub fn storage(&self) -> Option<&Arc<SharedStore>> {
        self.inner.store.as_ref()
    }

    pub fn is_detached(&self) -> bool {
        self.inner.detached
    }
}

impl Default for Host {
    fn default() -> Self {
        Self::new()
    }
}

/// Capability toggles and failure injection for a [`Host`].
pub struct HostBuilder {
    broadcast: bool,
    storage: bool,
    storage_quota: Option<usize>,
    bus_open_limit: Option<usize>,
    storage_path: Option<PathBuf>,
}

impl Default for HostBuilder {
    fn default() -> Self {
        Self {
            broadcast: true,
            storage: true,
            storage_quota: None,
            bus_open_limit: None,
            storage_path: None,
        }
    }
}

impl HostBuilder {
    /// Enable or disable the native broadcast capability.
    pub fn broadcast(mut self, enabled: bool) -> Self {
        self.broadcast = enabled;
        self
    }

    /// Enable or disable the shared durable store.
    pub fn storage(mut self, enabled: bool) -> Self {
        self.storage = enabled;
        self
    }

    /// Total byte budget for the shared store; writes past it fail the way
    /// a full platform store does.
    pub fn storage_quota(mut self, bytes: usize) -> Self {
        self.storage_quota = Some(bytes);
        self
    }

    /// Cap how many broadcast endpoints may ever be opened. A limit of zero
    /// makes the capability present but failing, which exercises the
    /// storage fallback path.
    pub fn bus_open_limit(mut self, limit: usize) -> Self {
        self.bus_open_limit = Some(limit);
        self
    }

    /// Back the shared store with a JSON snapshot file, loaded at build and
    /// rewritten best-effort on every mutation.
    pub fn storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_path = Some(path.into());
        self
    }

    pub fn build(self) -> Host {
        let bus = self
            .broadcast
            .then(|| Arc::new(BroadcastBus::new(self.bus_open_limit)));
        let store = self
            .storage
            .then(|| Arc::new(SharedStore::new(self.storage_quota, self.storage_path)));
        Host {
            inner: Arc::new(HostInner {
                bus,
                store,
                detached: false,
            }),
        }
    }
}
