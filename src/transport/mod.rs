//! Physical message transport with capability-dependent strategy selection.
//!
//! One transport exists per physical channel name and context, multiplexing
//! every logical key that shares the name. Selection runs once, in order:
//!
//! 1. detached host → no-op transport;
//! 2. broadcast capability present → try to open a bus endpoint, falling
//!    through if construction fails;
//! 3. shared storage present → storage-event fallback over the slot
//!    `"<prefix>-<name>"`;
//! 4. nothing available → no-op transport.
//!
//! Nothing here ever raises to the caller: publish failures, malformed
//! inbound payloads and panicking listeners are all contained and logged.

pub mod registry;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::envelope::Envelope;
use crate::host::store::StoreHandle;
use crate::host::{BusHandle, BusSink, Host};
use crate::slot_name;

/// Callback receiving every inbound envelope that passed validation and the
/// origin filter.
pub type TransportListener = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// Token returned by [`Transport::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

/// Which strategy a transport ended up on. Mostly useful for diagnostics
/// and for asserting fallback behavior in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Broadcast,
    Storage,
    Noop,
}

/// Listener bookkeeping shared between a transport and its inbound hooks.
/// Dispatch snapshots the list so a listener may subscribe, unsubscribe or
/// destroy re-entrantly without corrupting iteration.
struct ListenerSet {
    entries: Mutex<Vec<(u64, TransportListener)>>,
    next_id: AtomicU64,
    destroyed: AtomicBool,
}

impl ListenerSet {
    fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            destroyed: AtomicBool::new(false),
        }
    }

    fn add(&self, listener: TransportListener) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().push((id, listener));
        id
    }

    fn remove(&self, id: u64) {
        self.entries.lock().retain(|(lid, _)| *lid != id);
    }

    fn dispatch(&self, envelope: &Envelope) {
        if self.destroyed.load(Ordering::Acquire) {
            return;
        }
        let snapshot: Vec<TransportListener> = self
            .entries
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in snapshot {
            // A listener may destroy this transport mid-delivery; stop
            // before invoking anything it already unregistered.
            if self.destroyed.load(Ordering::Acquire) {
                return;
            }
            invoke_guarded(&listener, envelope);
        }
    }

    /// Flip the destroyed flag; returns true when it was already set.
    fn destroy(&self) -> bool {
        self.destroyed.swap(true, Ordering::AcqRel)
    }

    fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// One listener invocation, panic-contained so a faulty consumer cannot
/// block delivery to the rest.
fn invoke_guarded(listener: &TransportListener, envelope: &Envelope) {
    if catch_unwind(AssertUnwindSafe(|| listener(envelope))).is_err() {
        tracing::warn!("transport listener panicked; continuing delivery");
    }
}

enum Strategy {
    Broadcast {
        handle: BusHandle,
    },
    Storage {
        handle: StoreHandle,
        slot: String,
        watcher: u64,
    },
    Noop,
}

struct TransportInner {
    name: String,
    identity: String,
    listeners: Arc<ListenerSet>,
    strategy: Strategy,
}

/// Cloneable handle to one physical transport. All clones share the same
/// listener set and native resource.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

impl Transport {
    /// Run strategy selection for `name` and build the transport. Never
    /// fails; exhausted capabilities end on the no-op strategy.
    pub(crate) fn open(
        name: &str,
        host: &Host,
        identity: &str,
        store_handle: Option<&StoreHandle>,
    ) -> Transport {
        let listeners = Arc::new(ListenerSet::new());

        let strategy = if host.is_detached() {
            Strategy::Noop
        } else {
            Self::select(name, host, identity, store_handle, &listeners)
        };

        if matches!(strategy, Strategy::Noop) {
            tracing::debug!(channel = name, "no messaging capability; transport is local-only");
        }

        Transport {
            inner: Arc::new(TransportInner {
                name: name.to_owned(),
                identity: identity.to_owned(),
                listeners,
                strategy,
            }),
        }
    }

    fn select(
        name: &str,
        host: &Host,
        identity: &str,
        store_handle: Option<&StoreHandle>,
        listeners: &Arc<ListenerSet>,
    ) -> Strategy {
        if let Some(bus) = host.bus() {
            let sink_listeners = Arc::clone(listeners);
            let local = identity.to_owned();
            let sink: BusSink = Arc::new(move |raw| {
                let Some(envelope) = Envelope::parse(raw) else {
                    return;
                };
                if envelope.from_origin(&local) {
                    return;
                }
                sink_listeners.dispatch(&envelope);
            });

            match bus.open(name, sink) {
                Ok(handle) => return Strategy::Broadcast { handle },
                Err(err) => {
                    tracing::debug!(channel = name, %err, "broadcast open failed; trying storage fallback");
                }
            }
        }

        if let Some(handle) = store_handle {
            let slot = slot_name(name);
            let watch_listeners = Arc::clone(listeners);
            let local = identity.to_owned();
            let watched_slot = slot.clone();
            let watcher = handle.watch(Arc::new(move |changed, new_value| {
                if changed != watched_slot {
                    return;
                }
                let Ok(raw) = serde_json::from_str::<Value>(new_value) else {
                    return;
                };
                let Some(envelope) = Envelope::parse(&raw) else {
                    return;
                };
                if envelope.from_origin(&local) {
                    return;
                }
                watch_listeners.dispatch(&envelope);
            }));

            return Strategy::Storage {
                handle: handle.clone(),
                slot,
                watcher,
            };
        }

        Strategy::Noop
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn kind(&self) -> TransportKind {
        match self.inner.strategy {
            Strategy::Broadcast { .. } => TransportKind::Broadcast,
            Strategy::Storage { .. } => TransportKind::Storage,
            Strategy::Noop => TransportKind::Noop,
        }
    }

    /// Fire-and-forget publish. Object payloads go out as-is; bare payloads
    /// are wrapped into a minimal envelope. Transmission failures are
    /// swallowed.
    pub fn publish(&self, payload: Value) {
        if self.inner.listeners.destroyed.load(Ordering::Acquire) {
            return;
        }
        let message = if payload.is_object() {
            payload
        } else {
            Envelope::wrap(payload, &self.inner.identity)
        };

        match &self.inner.strategy {
            Strategy::Broadcast { handle } => handle.post(&message),
            Strategy::Storage { handle, slot, .. } => {
                let Ok(text) = serde_json::to_string(&message) else {
                    return;
                };
                if let Err(err) = handle.set(slot, &text) {
                    tracing::debug!(channel = %self.inner.name, %err, "storage publish dropped");
                }
            }
            Strategy::Noop => {}
        }
    }

    /// Register an inbound listener. On the storage strategy the current
    /// slot content, when it parses to a well-formed envelope, is delivered
    /// to the new listener immediately — without the origin filter the live
    /// path applies, so a late subscriber recovers the latest state even if
    /// its own context wrote it.
    pub fn subscribe(&self, listener: TransportListener) -> ListenerId {
        let id = self.inner.listeners.add(Arc::clone(&listener));

        if let Strategy::Storage { handle, slot, .. } = &self.inner.strategy {
            if let Some(text) = handle.get(slot) {
                if let Ok(raw) = serde_json::from_str::<Value>(&text) {
                    if let Some(envelope) = Envelope::parse(&raw) {
                        invoke_guarded(&listener, &envelope);
                    }
                }
            }
        }

        ListenerId(id)
    }

    pub fn unsubscribe(&self, id: ListenerId) {
        self.inner.listeners.remove(id.0);
    }

    /// Release the native resource and drop all listeners. Idempotent; no
    /// listener fires after this returns.
    pub fn destroy(&self) {
        if self.inner.listeners.destroy() {
            return;
        }
        match &self.inner.strategy {
            Strategy::Broadcast { handle } => handle.close(),
            Strategy::Storage {
                handle, watcher, ..
            } => handle.unwatch(*watcher),
            Strategy::Noop => {}
        }
        self.inner.listeners.clear();
    }

    pub(crate) fn same_instance(&self, other: &Transport) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn collecting(seen: &Arc<Mutex<Vec<Envelope>>>) -> TransportListener {
        let seen = Arc::clone(seen);
        Arc::new(move |env| seen.lock().push(env.clone()))
    }

    fn open_pair(host: &Host, name: &str) -> (Transport, Transport) {
        let store = host.storage().map(|s| s.handle());
        let a = Transport::open(name, host, "tab-a", store.as_ref());
        let store_b = host.storage().map(|s| s.handle());
        let b = Transport::open(name, host, "tab-b", store_b.as_ref());
        (a, b)
    }

    #[test]
    fn selects_broadcast_when_available() {
        let host = Host::new();
        let t = Transport::open("chan", &host, "tab-a", None);
        assert_eq!(t.kind(), TransportKind::Broadcast);
    }

    #[test]
    fn falls_back_to_storage_without_broadcast() {
        let host = Host::builder().broadcast(false).build();
        let handle = host.storage().unwrap().handle();
        let t = Transport::open("chan", &host, "tab-a", Some(&handle));
        assert_eq!(t.kind(), TransportKind::Storage);
    }

    #[test]
    fn bus_open_failure_falls_through_to_storage() {
        let host = Host::builder().bus_open_limit(0).build();
        let handle = host.storage().unwrap().handle();
        let t = Transport::open("chan", &host, "tab-a", Some(&handle));
        assert_eq!(t.kind(), TransportKind::Storage);
    }

    #[test]
    fn detached_host_gets_noop() {
        let host = Host::detached();
        let t = Transport::open("chan", &host, "tab-a", None);
        assert_eq!(t.kind(), TransportKind::Noop);
        // Publishing into the void must not fail.
        t.publish(json!({"value": 1, "tabId": "tab-a"}));
    }

    #[test]
    fn broadcast_suppresses_own_origin() {
        let host = Host::new();
        let (a, b) = open_pair(&host, "chan");

        let seen = Arc::new(Mutex::new(Vec::new()));
        b.subscribe(collecting(&seen));

        // b's own envelope echoed back over the bus is dropped.
        a.publish(json!({"value": 1, "tabId": "tab-b", "timestamp": 0}));
        assert!(seen.lock().is_empty());

        a.publish(json!({"value": 2, "tabId": "tab-a", "timestamp": 0}));
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(seen.lock()[0].value, json!(2));
    }

    #[test]
    fn malformed_inbound_payloads_are_dropped() {
        let host = Host::new();
        let (a, b) = open_pair(&host, "chan");

        let seen = Arc::new(Mutex::new(Vec::new()));
        b.subscribe(collecting(&seen));

        a.publish(json!({"noValue": true}));
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn bare_payloads_are_wrapped_with_identity() {
        let host = Host::new();
        let (a, b) = open_pair(&host, "chan");

        let seen = Arc::new(Mutex::new(Vec::new()));
        b.subscribe(collecting(&seen));

        a.publish(json!(41));
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].value, json!(41));
        assert!(seen[0].from_origin("tab-a"));
    }

    #[test]
    fn storage_round_trip_and_self_suppression() {
        let host = Host::builder().broadcast(false).build();
        let (a, b) = open_pair(&host, "chan");
        assert_eq!(a.kind(), TransportKind::Storage);

        let a_seen = Arc::new(Mutex::new(Vec::new()));
        let b_seen = Arc::new(Mutex::new(Vec::new()));
        a.subscribe(collecting(&a_seen));
        b.subscribe(collecting(&b_seen));

        a.publish(json!({"value": "x", "key": "k", "tabId": "tab-a", "timestamp": 1}));

        // The writer's own context sees nothing on the live path.
        assert!(a_seen.lock().is_empty());
        assert_eq!(b_seen.lock().len(), 1);
        assert_eq!(b_seen.lock()[0].value, json!("x"));
    }

    #[test]
    fn storage_subscribe_replays_current_slot_without_origin_filter() {
        let host = Host::builder().broadcast(false).build();
        let (a, _b) = open_pair(&host, "chan");

        a.publish(json!({"value": 5, "key": "k", "tabId": "tab-a", "timestamp": 1}));

        // A later subscriber in the same context still receives the slot
        // content — the immediate read path has no origin check.
        let seen = Arc::new(Mutex::new(Vec::new()));
        a.subscribe(collecting(&seen));
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(seen.lock()[0].value, json!(5));
    }

    #[test]
    fn corrupt_slot_content_is_ignored_on_subscribe() {
        let host = Host::builder().broadcast(false).build();
        let handle = host.storage().unwrap().handle();
        handle.set(&slot_name("chan"), "{not json").unwrap();

        let t = Transport::open("chan", &host, "tab-a", Some(&handle));
        let seen = Arc::new(Mutex::new(Vec::new()));
        t.subscribe(collecting(&seen));
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn panicking_listener_does_not_block_others() {
        let host = Host::new();
        let (a, b) = open_pair(&host, "chan");

        b.subscribe(Arc::new(|_| panic!("bad listener")));
        let seen = Arc::new(Mutex::new(Vec::new()));
        b.subscribe(collecting(&seen));

        a.publish(json!({"value": 1, "tabId": "tab-a", "timestamp": 0}));
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn destroy_stops_delivery_and_is_idempotent() {
        let host = Host::new();
        let (a, b) = open_pair(&host, "chan");

        let seen = Arc::new(Mutex::new(Vec::new()));
        b.subscribe(collecting(&seen));

        b.destroy();
        b.destroy();

        a.publish(json!({"value": 1, "tabId": "tab-a", "timestamp": 0}));
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let host = Host::new();
        let (a, b) = open_pair(&host, "chan");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let id = b.subscribe(collecting(&seen));
        b.unsubscribe(id);
        b.unsubscribe(id);

        a.publish(json!({"value": 1, "tabId": "tab-a", "timestamp": 0}));
        assert!(seen.lock().is_empty());
    }
}
