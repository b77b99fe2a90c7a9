//! Consumer-facing binding layer.
//!
//! UI components (or any short-lived consumers) attach to a key through
//! [`Bindings`], which keeps one [`Channel`] alive per `(channel_name, key)`
//! pair and reference-counts the consumers. Detaching is RAII: dropping a
//! [`SharedState`] releases its reference, and the underlying channel is
//! destroyed exactly when the last consumer for its key detaches.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::channel::{Channel, ChannelOptions, Subscription};
use crate::context::Context;

struct Entry {
    channel: Box<dyn Any + Send + Sync>,
    refs: usize,
}

struct BindingsInner {
    ctx: Context,
    entries: Mutex<HashMap<(String, String), Entry>>,
}

/// Per-context cache of channels shared across consumer bindings.
#[derive(Clone)]
pub struct Bindings {
    inner: Arc<BindingsInner>,
}

impl Bindings {
    pub fn new(ctx: &Context) -> Self {
        Self {
            inner: Arc::new(BindingsInner {
                ctx: ctx.clone(),
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Attach a consumer to `key`, creating the channel on first use. The
    /// only error is rebinding an existing key with a different value type.
    pub fn bind<T>(
        &self,
        key: &str,
        initial: T,
        options: ChannelOptions<T>,
    ) -> Result<SharedState<T>>
    where
        T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let cache_key = (options.channel_name.clone(), key.to_owned());
        let mut entries = self.inner.entries.lock();

        if !entries.contains_key(&cache_key) {
            let channel = self.inner.ctx.channel(key, initial, options);
            entries.insert(
                cache_key.clone(),
                Entry {
                    channel: Box::new(channel),
                    refs: 0,
                },
            );
        }

        let entry = entries.get_mut(&cache_key).expect("entry just ensured");
        let Some(channel) = entry.channel.downcast_ref::<Channel<T>>() else {
            bail!(
                "key '{key}' on channel '{}' is already bound with a different value type",
                cache_key.0
            );
        };
        entry.refs += 1;
        let channel = channel.clone();

        Ok(SharedState {
            bindings: self.clone(),
            cache_key,
            channel,
        })
    }

    /// Number of distinct bound keys, a diagnostic.
    pub fn bound_keys(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// Returns true when the entry was evicted (last consumer detached).
    fn release(&self, cache_key: &(String, String)) -> bool {
        let mut entries = self.inner.entries.lock();
        match entries.get_mut(cache_key) {
            Some(entry) => {
                entry.refs -= 1;
                if entry.refs == 0 {
                    entries.remove(cache_key);
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }
}

/// One consumer's view of a shared keyed value. Attach on creation,
/// detach on drop.
pub struct SharedState<T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static> {
    bindings: Bindings,
    cache_key: (String, String),
    channel: Channel<T>,
}

impl<T> SharedState<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn get(&self) -> T {
        self.channel.get()
    }

    pub fn set(&self, value: T) {
        self.channel.set(value)
    }

    /// Functional update: compute the next value from the current one.
    pub fn update(&self, f: impl FnOnce(&T) -> T) {
        let next = f(&self.channel.get());
        self.channel.set(next);
    }

    /// Observe changes; fires immediately with the current value.
    pub fn on_change(&self, f: impl Fn(&T) + Send + Sync + 'static) -> Subscription<T> {
        self.channel.subscribe(f)
    }

    /// The shared channel behind this binding.
    pub fn channel(&self) -> &Channel<T> {
        &self.channel
    }
}

impl<T> Drop for SharedState<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if self.bindings.release(&self.cache_key) {
            self.channel.destroy();
        }
    }
}
