//! The public synchronization primitive.
//!
//! A [`Channel`] binds one logical key to a shared physical transport: it
//! owns the current value, an optional persistence slot, and the local
//! subscriber set. Inbound envelopes are filtered by key and by origin
//! before they touch the value; outbound sets update local state
//! synchronously, then publish, then notify. None of the operations here
//! return errors — every fallible step degrades silently, logged.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use anyhow::Result;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::context::Context;
use crate::envelope::Envelope;
use crate::slot_name;
use crate::transport::{ListenerId, Transport, TransportKind, TransportListener};
use crate::DEFAULT_CHANNEL_NAME;

/// Persistence codec: value to slot text.
pub type SerializeFn<T> = Arc<dyn Fn(&T) -> Result<String> + Send + Sync>;
/// Persistence codec: slot text back to a value.
pub type DeserializeFn<T> = Arc<dyn Fn(&str) -> Result<T> + Send + Sync>;

type SubscriberFn<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Pathological codecs can stringify a missing value this way; such text is
/// never written to, and never accepted from, a persistence slot.
const INVALID_ENCODING: &str = "undefined";

/// Configuration for [`Channel`] construction.
pub struct ChannelOptions<T> {
    /// Physical transport to join. Unrelated keys multiplex over the shared
    /// default unless isolated explicitly.
    pub channel_name: String,
    /// Persist the latest value so later channels for the key can seed
    /// from it.
    pub persist: bool,
    serialize: Option<SerializeFn<T>>,
    deserialize: Option<DeserializeFn<T>>,
}

impl<T> Default for ChannelOptions<T> {
    fn default() -> Self {
        Self {
            channel_name: DEFAULT_CHANNEL_NAME.to_owned(),
            persist: false,
            serialize: None,
            deserialize: None,
        }
    }
}

impl<T> Clone for ChannelOptions<T> {
    fn clone(&self) -> Self {
        Self {
            channel_name: self.channel_name.clone(),
            persist: self.persist,
            serialize: self.serialize.clone(),
            deserialize: self.deserialize.clone(),
        }
    }
}

impl<T> ChannelOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel_name(mut self, name: impl Into<String>) -> Self {
        self.channel_name = name.into();
        self
    }

    pub fn persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    /// Replace the default JSON persistence codec.
    pub fn codec<S, D>(mut self, serialize: S, deserialize: D) -> Self
    where
        S: Fn(&T) -> Result<String> + Send + Sync + 'static,
        D: Fn(&str) -> Result<T> + Send + Sync + 'static,
    {
        self.serialize = Some(Arc::new(serialize));
        self.deserialize = Some(Arc::new(deserialize));
        self
    }
}

struct ChannelInner<T> {
    key: String,
    channel_name: String,
    persist: bool,
    serialize: SerializeFn<T>,
    deserialize: DeserializeFn<T>,
    value: Mutex<T>,
    subscribers: Mutex<Vec<(u64, SubscriberFn<T>)>>,
    next_sub: AtomicU64,
    destroyed: AtomicBool,
    ctx: Context,
    transport: Transport,
    transport_listener: Mutex<Option<ListenerId>>,
}

/// Cloneable handle to one logical channel. The last handle dropping (or an
/// explicit [`destroy`](Channel::destroy)) releases the shared transport.
pub struct Channel<T> {
    inner: Arc<ChannelInner<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Channel<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Build a channel bound to `key`. Prefer [`Context::channel`]; this is
    /// the same operation. Never fails.
    pub fn new(ctx: &Context, key: &str, initial: T, options: ChannelOptions<T>) -> Self {
        let serialize = options
            .serialize
            .unwrap_or_else(|| Arc::new(|v: &T| serde_json::to_string(v).map_err(Into::into)));
        let deserialize = options
            .deserialize
            .unwrap_or_else(|| Arc::new(|text: &str| serde_json::from_str(text).map_err(Into::into)));

        let value = if options.persist {
            restore(ctx, key, &deserialize).unwrap_or(initial)
        } else {
            initial
        };

        let transport = ctx.acquire_transport(&options.channel_name);

        let inner = Arc::new(ChannelInner {
            key: key.to_owned(),
            channel_name: options.channel_name,
            persist: options.persist,
            serialize,
            deserialize,
            value: Mutex::new(value),
            subscribers: Mutex::new(Vec::new()),
            next_sub: AtomicU64::new(1),
            destroyed: AtomicBool::new(false),
            ctx: ctx.clone(),
            transport,
            transport_listener: Mutex::new(None),
        });

        // The transport listener only holds a weak reference: the transport
        // must never keep a destroyed channel alive.
        let weak = Arc::downgrade(&inner);
        let listener: TransportListener = Arc::new(move |envelope| {
            if let Some(inner) = weak.upgrade() {
                inner.on_envelope(envelope);
            }
        });
        let id = inner.transport.subscribe(listener);
        *inner.transport_listener.lock() = Some(id);

        Self { inner }
    }

    /// Current value, no side effects.
    pub fn get(&self) -> T {
        self.inner.value.lock().clone()
    }

    /// Accept `value`: update local state synchronously, persist when
    /// enabled, publish to other contexts, then notify local subscribers
    /// exactly once each. A no-op after [`destroy`](Channel::destroy).
    pub fn set(&self, value: T) {
        let inner = &self.inner;
        if inner.destroyed.load(Ordering::Acquire) {
            return;
        }

        *inner.value.lock() = value.clone();
        inner.persist_value(&value);

        match serde_json::to_value(&value) {
            Ok(wire) => {
                let envelope = Envelope::new(wire, &inner.key, &inner.ctx.identity());
                inner.transport.publish(envelope.to_value());
            }
            Err(err) => {
                tracing::debug!(key = %inner.key, %err, "value not wire-encodable; publish skipped");
            }
        }

        inner.notify(&value);
    }

    /// Register `subscriber` and invoke it once, synchronously, with the
    /// current value before returning.
    pub fn subscribe(&self, subscriber: impl Fn(&T) + Send + Sync + 'static) -> Subscription<T> {
        let subscriber: SubscriberFn<T> = Arc::new(subscriber);
        let id = self.inner.next_sub.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .lock()
            .push((id, Arc::clone(&subscriber)));

        let current = self.inner.value.lock().clone();
        notify_one(&subscriber, &current);

        Subscription {
            inner: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Stop all delivery, release the shared transport, clear subscribers.
    /// Idempotent.
    pub fn destroy(&self) {
        self.inner.teardown();
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn channel_name(&self) -> &str {
        &self.inner.channel_name
    }

    /// Strategy the underlying transport selected.
    pub fn transport_kind(&self) -> TransportKind {
        self.inner.transport.kind()
    }
}

fn restore<T>(ctx: &Context, key: &str, deserialize: &DeserializeFn<T>) -> Option<T> {
    let handle = ctx.store_handle()?;
    let text = handle.get(&slot_name(key))?;
    if text.is_empty() || text == INVALID_ENCODING {
        return None;
    }
    match deserialize(&text) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::debug!(key, %err, "persisted value unreadable; using initial");
            None
        }
    }
}

fn notify_one<T>(subscriber: &SubscriberFn<T>, value: &T) {
    if catch_unwind(AssertUnwindSafe(|| subscriber(value))).is_err() {
        tracing::warn!("channel subscriber panicked; continuing");
    }
}

impl<T> ChannelInner<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Inbound path shared by every transport strategy: filter, adopt,
    /// re-persist, fan out.
    fn on_envelope(&self, envelope: &Envelope) {
        if self.destroyed.load(Ordering::Acquire) {
            return;
        }
        if envelope.key.as_deref() != Some(self.key.as_str()) {
            return;
        }
        let value: T = match serde_json::from_value(envelope.value.clone()) {
            Ok(value) => value,
            Err(err) => {
                tracing::debug!(key = %self.key, %err, "inbound value rejected by codec");
                return;
            }
        };

        *self.value.lock() = value.clone();
        self.persist_value(&value);
        self.notify(&value);
    }

    fn persist_value(&self, value: &T) {
        if !self.persist {
            return;
        }
        let Some(handle) = self.ctx.store_handle() else {
            return;
        };
        let text = match (self.serialize)(value) {
            Ok(text) => text,
            Err(err) => {
                tracing::debug!(key = %self.key, %err, "serialize failed; persistence skipped");
                return;
            }
        };
        if text == INVALID_ENCODING {
            tracing::debug!(key = %self.key, "refusing to persist invalid encoding");
            return;
        }
        if let Err(err) = handle.set(&slot_name(&self.key), &text) {
            tracing::debug!(key = %self.key, %err, "persistence write dropped");
        }
    }

    fn notify(&self, value: &T) {
        // Snapshot first: subscribers may re-enter subscribe/unsubscribe.
        let snapshot: Vec<SubscriberFn<T>> = self
            .subscribers
            .lock()
            .iter()
            .map(|(_, s)| Arc::clone(s))
            .collect();
        for subscriber in snapshot {
            if self.destroyed.load(Ordering::Acquire) {
                return;
            }
            notify_one(&subscriber, value);
        }
    }
}

impl<T> ChannelInner<T> {
    fn teardown(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(id) = self.transport_listener.lock().take() {
            self.transport.unsubscribe(id);
        }
        self.ctx.release_transport(&self.channel_name);
        self.subscribers.lock().clear();
    }
}

impl<T> Drop for ChannelInner<T> {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Handle for removing one subscriber. Removal is idempotent; dropping the
/// handle does not unsubscribe.
pub struct Subscription<T> {
    inner: Weak<ChannelInner<T>>,
    id: u64,
}

impl<T> Subscription<T> {
    pub fn unsubscribe(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.subscribers.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::Host;
    use serde_json::json;

    fn ctx() -> Context {
        Context::attach(&Host::new())
    }

    fn recorded<T: Clone + Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl Fn(&T) + Send + Sync) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |v: &T| sink.lock().push(v.clone()))
    }

    #[test]
    fn set_is_read_back_immediately() {
        let ch = ctx().channel("k", 0i64, ChannelOptions::new());
        ch.set(5);
        assert_eq!(ch.get(), 5);
    }

    #[test]
    fn subscribers_see_each_set_exactly_once() {
        let ch = ctx().channel("k", 0i64, ChannelOptions::new());
        let (seen, sink) = recorded();
        ch.subscribe(sink);

        ch.set(1);
        ch.set(2);

        // Initial synchronous delivery plus one per set.
        assert_eq!(seen.lock().as_slice(), &[0, 1, 2]);
    }

    #[test]
    fn subscribe_fires_synchronously_with_current_value() {
        let ch = ctx().channel("k", "hello".to_owned(), ChannelOptions::new());
        let (seen, sink) = recorded();
        ch.subscribe(sink);
        assert_eq!(seen.lock().as_slice(), &["hello".to_owned()]);
    }

    #[test]
    fn notification_order_follows_subscription_order() {
        let ch = ctx().channel("k", 0i64, ChannelOptions::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = Arc::clone(&order);
        ch.subscribe(move |v| first.lock().push(("first", *v)));
        let second = Arc::clone(&order);
        ch.subscribe(move |v| second.lock().push(("second", *v)));

        order.lock().clear();
        ch.set(9);
        assert_eq!(order.lock().as_slice(), &[("first", 9), ("second", 9)]);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let ch = ctx().channel("k", 0i64, ChannelOptions::new());
        let (seen, sink) = recorded();
        let sub = ch.subscribe(sink);
        sub.unsubscribe();
        sub.unsubscribe();

        ch.set(1);
        assert_eq!(seen.lock().as_slice(), &[0]);
    }

    #[test]
    fn panicking_subscriber_does_not_block_the_rest() {
        let ch = ctx().channel("k", 0i64, ChannelOptions::new());
        ch.subscribe(|_| panic!("faulty subscriber"));
        let (seen, sink) = recorded();
        ch.subscribe(sink);

        ch.set(3);
        assert_eq!(seen.lock().as_slice(), &[0, 3]);
    }

    #[test]
    fn same_context_channels_do_not_converge_through_the_transport() {
        let ctx = ctx();
        let a = ctx.channel("k", 0i64, ChannelOptions::new());
        let b = ctx.channel("k", 0i64, ChannelOptions::new());

        a.set(5);

        // Same identity, so the transport suppresses delivery to b.
        assert_eq!(a.get(), 5);
        assert_eq!(b.get(), 0);
    }

    #[test]
    fn same_name_shares_a_transport_different_names_do_not() {
        let ctx = ctx();
        let _a = ctx.channel("a", 0i64, ChannelOptions::new());
        let _b = ctx.channel("b", 0i64, ChannelOptions::new());
        assert_eq!(ctx.active_transports(), 1);

        let _c = ctx.channel("c", 0i64, ChannelOptions::new().channel_name("isolated"));
        assert_eq!(ctx.active_transports(), 2);
    }

    #[test]
    fn destroy_silences_subscribers_and_is_idempotent() {
        let ch = ctx().channel("k", 0i64, ChannelOptions::new());
        let (seen, sink) = recorded();
        ch.subscribe(sink);

        ch.destroy();
        ch.destroy();
        ch.set(7);

        assert_eq!(seen.lock().as_slice(), &[0]);
        assert_eq!(ch.get(), 0);
    }

    #[test]
    fn destroy_releases_the_shared_transport() {
        let ctx = ctx();
        let a = ctx.channel("a", 0i64, ChannelOptions::new());
        let b = ctx.channel("b", 0i64, ChannelOptions::new());
        assert_eq!(ctx.active_transports(), 1);

        a.destroy();
        assert_eq!(ctx.active_transports(), 1);
        b.destroy();
        assert_eq!(ctx.active_transports(), 0);
    }

    #[test]
    fn dropping_the_last_handle_releases_the_transport() {
        let ctx = ctx();
        {
            let ch = ctx.channel("k", 0i64, ChannelOptions::new());
            let _clone = ch.clone();
            assert_eq!(ctx.active_transports(), 1);
        }
        assert_eq!(ctx.active_transports(), 0);
    }

    #[test]
    fn persistence_round_trip() {
        let host = Host::new();
        let ctx = Context::attach(&host);
        let ch = ctx.channel("name", String::new(), ChannelOptions::new().persist(true));
        ch.set("x".to_owned());

        let slot = host
            .storage()
            .unwrap()
            .handle()
            .get(&slot_name("name"))
            .unwrap();
        assert_eq!(slot, json!("x").to_string());

        // A later channel for the same key seeds from the slot, whatever
        // its initial value says.
        let revived = Context::attach(&host).channel(
            "name",
            "other-default".to_owned(),
            ChannelOptions::new().persist(true),
        );
        assert_eq!(revived.get(), "x");
    }

    #[test]
    fn persistence_disabled_never_writes() {
        let host = Host::new();
        let ctx = Context::attach(&host);
        let ch = ctx.channel("quiet", 0i64, ChannelOptions::new());
        ch.set(1);

        assert!(host
            .storage()
            .unwrap()
            .handle()
            .get(&slot_name("quiet"))
            .is_none());
    }

    #[test]
    fn corrupted_persisted_data_falls_back_to_initial() {
        let host = Host::new();
        let handle = host.storage().unwrap().handle();
        handle.set(&slot_name("bad"), "{definitely not json").unwrap();

        let ch = Context::attach(&host).channel("bad", 42i64, ChannelOptions::new().persist(true));
        assert_eq!(ch.get(), 42);
    }

    #[test]
    fn literal_undefined_in_slot_is_ignored() {
        let host = Host::new();
        let handle = host.storage().unwrap().handle();
        handle.set(&slot_name("u"), "undefined").unwrap();

        let ch = Context::attach(&host).channel(
            "u",
            "seed".to_owned(),
            ChannelOptions::new().persist(true),
        );
        assert_eq!(ch.get(), "seed");
    }

    #[test]
    fn unsafe_codec_output_is_never_persisted() {
        let host = Host::new();
        let ctx = Context::attach(&host);
        let ch = ctx.channel(
            "enc",
            0i64,
            ChannelOptions::new().persist(true).codec(
                |_: &i64| Ok("undefined".to_owned()),
                |text| serde_json::from_str(text).map_err(Into::into),
            ),
        );
        ch.set(1);

        assert!(host
            .storage()
            .unwrap()
            .handle()
            .get(&slot_name("enc"))
            .is_none());
    }

    #[test]
    fn key_isolation_on_the_inbound_path() {
        let host = Host::new();
        let a_ctx = Context::attach(&host);
        let b_ctx = Context::attach(&host);

        let a = a_ctx.channel("a", "initial".to_owned(), ChannelOptions::new());
        let other = b_ctx.channel("b", String::new(), ChannelOptions::new());

        other.set("for-b-only".to_owned());
        assert_eq!(a.get(), "initial");
    }

    #[test]
    fn detached_host_channel_is_purely_local() {
        let ctx = Context::attach(&Host::detached());
        let ch = ctx.channel("k", 0i64, ChannelOptions::new().persist(true));
        assert_eq!(ch.transport_kind(), TransportKind::Noop);

        let (seen, sink) = recorded();
        ch.subscribe(sink);
        ch.set(1);

        assert_eq!(ch.get(), 1);
        assert_eq!(seen.lock().as_slice(), &[0, 1]);
    }
}
