//! Reference-counted transport cache, one per context.
//!
//! Broadcast endpoints and store watchers are scarce platform resources, so
//! every logical channel that joins the same physical name shares one
//! [`Transport`]. The transport is destroyed exactly when its last user
//! releases it. The registry lives on the owning context instead of a
//! module-level static so isolated instances can be built in tests.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::host::store::StoreHandle;
use crate::host::Host;
use crate::transport::Transport;

struct Entry {
    transport: Transport,
    refs: usize,
}

pub(crate) struct TransportRegistry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Get or build the shared transport for `name`, bumping its refcount.
    pub fn acquire(
        &self,
        name: &str,
        host: &Host,
        identity: &str,
        store_handle: Option<&StoreHandle>,
    ) -> Transport {
        let mut entries = self.entries.lock();
        let entry = entries.entry(name.to_owned()).or_insert_with(|| Entry {
            transport: Transport::open(name, host, identity, store_handle),
            refs: 0,
        });
        entry.refs += 1;
        entry.transport.clone()
    }

    /// Drop one reference; at zero the transport is destroyed and evicted.
    pub fn release(&self, name: &str) {
        let evicted = {
            let mut entries = self.entries.lock();
            match entries.get_mut(name) {
                Some(entry) => {
                    entry.refs -= 1;
                    if entry.refs == 0 {
                        entries.remove(name).map(|e| e.transport)
                    } else {
                        None
                    }
                }
                None => {
                    tracing::debug!(channel = name, "release for unknown transport ignored");
                    None
                }
            }
        };

        // Destroy outside the map lock: teardown unregisters listeners and
        // a re-entrant acquire from a callback must not deadlock.
        if let Some(transport) = evicted {
            transport.destroy();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
