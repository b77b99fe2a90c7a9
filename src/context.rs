//! One execution context ("tab") attached to a host.
//!
//! The context owns everything that is per-tab in the original platform:
//! the session store, the lazily minted identity and the ref-counted
//! transport registry. Registries live here, on an explicit object with
//! process lifetime, rather than in hidden module statics — tests build as
//! many isolated contexts as they need.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::channel::{Channel, ChannelOptions};
use crate::host::store::{SessionStore, StoreHandle};
use crate::host::Host;
use crate::identity::IdentityCell;
use crate::transport::registry::TransportRegistry;
use crate::transport::Transport;

struct ContextInner {
    host: Host,
    session: Option<Arc<SessionStore>>,
    store_handle: Option<StoreHandle>,
    identity: IdentityCell,
    transports: TransportRegistry,
}

/// Cloneable handle to one execution context.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Attach a genuinely new context to `host` — a fresh tab with an empty
    /// session scope and its own identity.
    pub fn attach(host: &Host) -> Self {
        let session = (!host.is_detached()).then(|| Arc::new(SessionStore::new()));
        let store_handle = host.storage().map(|s| s.handle());
        Self {
            inner: Arc::new(ContextInner {
                host: host.clone(),
                session,
                store_handle,
                identity: IdentityCell::new(),
                transports: TransportRegistry::new(),
            }),
        }
    }

    /// Model a reload of this same context: module state (identity cache,
    /// transports) starts over, but the session scope and the store view
    /// carry across, so the reloaded context resolves the same identity.
    pub fn reload(&self) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                host: self.inner.host.clone(),
                session: self.inner.session.clone(),
                store_handle: self.inner.store_handle.clone(),
                identity: IdentityCell::new(),
                transports: TransportRegistry::new(),
            }),
        }
    }

    /// This context's identity, minted on first call.
    pub fn identity(&self) -> String {
        self.inner
            .identity
            .get(self.inner.session.as_deref())
            .to_owned()
    }

    pub fn host(&self) -> &Host {
        &self.inner.host
    }

    /// Build a synchronization channel for `key`. The public factory; never
    /// fails — missing capabilities degrade to local-only behavior.
    pub fn channel<T>(&self, key: &str, initial: T, options: ChannelOptions<T>) -> Channel<T>
    where
        T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        Channel::new(self, key, initial, options)
    }

    /// Number of live physical transports, mostly a diagnostic.
    pub fn active_transports(&self) -> usize {
        self.inner.transports.len()
    }

    pub(crate) fn acquire_transport(&self, name: &str) -> Transport {
        let identity = self.identity();
        self.inner.transports.acquire(
            name,
            &self.inner.host,
            &identity,
            self.inner.store_handle.as_ref(),
        )
    }

    pub(crate) fn release_transport(&self, name: &str) {
        self.inner.transports.release(name);
    }

    pub(crate) fn store_handle(&self) -> Option<&StoreHandle> {
        self.inner.store_handle.as_ref()
    }
}
