//! Synchronous named broadcast bus.
//!
//! Stands in for the platform's native broadcast primitive: every handle
//! opened on a topic receives what the *other* handles post, never its own
//! posts. Delivery is synchronous and unordered across topics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use parking_lot::Mutex;
use serde_json::Value;

/// Inbound message callback installed when a handle is opened.
pub type BusSink = Arc<dyn Fn(&Value) + Send + Sync>;

struct Endpoint {
    id: u64,
    sink: BusSink,
}

/// Process-shared broadcast fabric. One instance per [`Host`](crate::Host).
pub struct BroadcastBus {
    topics: Mutex<HashMap<String, Vec<Endpoint>>>,
    next_id: AtomicU64,
    /// Remaining successful opens, `None` for unlimited. Exhaustion models
    /// native construction failure and forces callers onto their fallback.
    open_budget: Mutex<Option<usize>>,
}

impl BroadcastBus {
    pub(crate) fn new(open_limit: Option<usize>) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            open_budget: Mutex::new(open_limit),
        }
    }

    /// Open an endpoint on `topic`. `sink` is invoked synchronously for every
    /// value posted by other endpoints on the same topic.
    pub fn open(self: &Arc<Self>, topic: &str, sink: BusSink) -> Result<BusHandle> {
        {
            let mut budget = self.open_budget.lock();
            if let Some(remaining) = budget.as_mut() {
                if *remaining == 0 {
                    bail!("broadcast open limit exhausted for topic '{topic}'");
                }
                *remaining -= 1;
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.topics
            .lock()
            .entry(topic.to_owned())
            .or_default()
            .push(Endpoint { id, sink });

        Ok(BusHandle {
            bus: Arc::clone(self),
            topic: topic.to_owned(),
            id,
            closed: AtomicBool::new(false),
        })
    }

    fn post(&self, topic: &str, from: u64, value: &Value) {
        // Snapshot under the lock, dispatch outside it: a sink may open or
        // close handles on this same bus while we iterate.
        let sinks: Vec<BusSink> = {
            let topics = self.topics.lock();
            match topics.get(topic) {
                Some(endpoints) => endpoints
                    .iter()
                    .filter(|e| e.id != from)
                    .map(|e| Arc::clone(&e.sink))
                    .collect(),
                None => return,
            }
        };

        for sink in sinks {
            sink(value);
        }
    }

    fn close(&self, topic: &str, id: u64) {
        let mut topics = self.topics.lock();
        if let Some(endpoints) = topics.get_mut(topic) {
            endpoints.retain(|e| e.id != id);
            if endpoints.is_empty() {
                topics.remove(topic);
            }
        }
    }

    #[cfg(test)]
    fn endpoint_count(&self, topic: &str) -> usize {
        self.topics.lock().get(topic).map_or(0, Vec::len)
    }
}

/// An open endpoint on one topic. Posting never delivers back to this handle.
pub struct BusHandle {
    bus: Arc<BroadcastBus>,
    topic: String,
    id: u64,
    closed: AtomicBool,
}

impl BusHandle {
    /// Deliver `value` to every other endpoint on this topic.
    pub fn post(&self, value: &Value) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.bus.post(&self.topic, self.id, value);
    }

    /// Detach from the topic. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.bus.close(&self.topic, self.id);
        }
    }
}

impl Drop for BusHandle {
    fn drop(&mut self) {
        self.close();
    }
}
