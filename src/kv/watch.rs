//! One-shot watch bus.
//!
//! Subscriptions are keyed by exact key in the primary table; range
//! subscriptions live in a secondary list scanned linearly on every event
//! (watch traffic is low compared to puts). A subscription fires at most
//! once; the apply path dispatches each PUT/DELETE event, fires every
//! matching armed subscription and removes it. Cancellation before fire
//! removes the entry cleanly.

use crate::kv::index::Kv;
use bitflags::bitflags;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::oneshot;

bitflags! {
    /// Event filters for a watch subscription.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct WatchFilters: u32 {
        /// Suppress PUT events.
        const NO_PUT = 0b0000_0001;
        /// Suppress DELETE events.
        const NO_DELETE = 0b0000_0010;
    }
}

impl Default for WatchFilters {
    fn default() -> Self {
        Self::empty()
    }
}

/// Event type for watch notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    /// Key was created or updated.
    Put,
    /// Key was deleted.
    Delete,
}

/// A key-value event emitted by the apply engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEvent {
    /// Type of event.
    pub event_type: EventType,

    /// The mutated record (empty value for deletes).
    pub kv: Kv,

    /// Previous record; populated only when the previous generation was
    /// open (the key carried a value).
    pub prev_kv: Option<Kv>,
}

/// Identifier of a registered subscription, used for cancellation.
pub type WatchId = u64;

struct Subscription {
    id: WatchId,
    key: Vec<u8>,
    range_end: Vec<u8>,
    start_revision: i64,
    filters: WatchFilters,
    need_prev: bool,
    ack: oneshot::Sender<KvEvent>,
}

impl Subscription {
    fn matches_key(&self, key: &[u8]) -> bool {
        if self.range_end.is_empty() {
            key == self.key.as_slice()
        } else if self.range_end == [0u8] {
            key >= self.key.as_slice()
        } else {
            key >= self.key.as_slice() && key < self.range_end.as_slice()
        }
    }

    fn admits(&self, event: &KvEvent) -> bool {
        let filtered = match event.event_type {
            EventType::Put => self.filters.contains(WatchFilters::NO_PUT),
            EventType::Delete => self.filters.contains(WatchFilters::NO_DELETE),
        };
        !filtered && self.start_revision <= event.kv.mod_revision
    }
}

#[derive(Default)]
struct WatchBusInner {
    /// Exact-key subscriptions.
    by_key: HashMap<Vec<u8>, Vec<Subscription>>,
    /// Range subscriptions, scanned linearly per event.
    ranged: Vec<Subscription>,
    next_id: WatchId,
}

/// The one-shot subscription table.
#[derive(Default)]
pub struct WatchBus {
    inner: Mutex<WatchBusInner>,
}

impl WatchBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a one-shot subscription.
    ///
    /// The returned receiver resolves with the first matching event; it is
    /// closed without a value if the bus is dropped first.
    pub fn subscribe(
        &self,
        key: Vec<u8>,
        range_end: Vec<u8>,
        start_revision: i64,
        filters: WatchFilters,
        need_prev: bool,
    ) -> (WatchId, oneshot::Receiver<KvEvent>) {
        let (ack, rx) = oneshot::channel();
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        let sub = Subscription {
            id,
            key: key.clone(),
            range_end: range_end.clone(),
            start_revision,
            filters,
            need_prev,
            ack,
        };
        if range_end.is_empty() {
            inner.by_key.entry(key).or_default().push(sub);
        } else {
            inner.ranged.push(sub);
        }
        (id, rx)
    }

    /// Remove a subscription before it fires.
    pub fn cancel(&self, id: WatchId) -> bool {
        let mut inner = self.inner.lock();
        let mut emptied: Option<Vec<u8>> = None;
        let mut found = false;
        for (key, subs) in inner.by_key.iter_mut() {
            if let Some(slot) = subs.iter().position(|s| s.id == id) {
                subs.remove(slot);
                if subs.is_empty() {
                    emptied = Some(key.clone());
                }
                found = true;
                break;
            }
        }
        if let Some(key) = emptied {
            inner.by_key.remove(&key);
        }
        if found {
            return true;
        }
        if let Some(slot) = inner.ranged.iter().position(|s| s.id == id) {
            inner.ranged.remove(slot);
            return true;
        }
        false
    }

    /// Fire every armed subscription matching `event`, exactly once each.
    ///
    /// Subscriptions whose start revision is above the event revision, or
    /// whose filter suppresses the event type, stay armed.
    pub fn dispatch(&self, event: &KvEvent) {
        let mut inner = self.inner.lock();
        let mut fired = 0usize;

        let mut exact_emptied = false;
        if let Some(subs) = inner.by_key.get_mut(&event.kv.key) {
            fired += fire_matching(subs, event, |_| true);
            exact_emptied = subs.is_empty();
        }
        if exact_emptied {
            inner.by_key.remove(&event.kv.key);
        }

        fired += fire_matching(&mut inner.ranged, event, |sub| {
            sub.matches_key(&event.kv.key)
        });

        if fired > 0 {
            tracing::debug!(
                key = ?event.kv.key,
                revision = event.kv.mod_revision,
                fired,
                "watch subscriptions fired"
            );
        }
    }

    /// Number of armed subscriptions.
    pub fn subscription_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.by_key.values().map(Vec::len).sum::<usize>() + inner.ranged.len()
    }
}

fn fire_matching<F>(subs: &mut Vec<Subscription>, event: &KvEvent, extra: F) -> usize
where
    F: Fn(&Subscription) -> bool,
{
    let mut fired = 0usize;
    let mut slot = 0usize;
    while slot < subs.len() {
        if extra(&subs[slot]) && subs[slot].admits(event) {
            let sub = subs.remove(slot);
            let mut notify = event.clone();
            if !sub.need_prev {
                notify.prev_kv = None;
            }
            // A dropped receiver means the client went away; the
            // subscription is consumed either way.
            let _ = sub.ack.send(notify);
            fired += 1;
        } else {
            slot += 1;
        }
    }
    fired
}
