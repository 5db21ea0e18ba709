// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// A correlation primitive: one or more waiters block on a key until another
// task sets a value for it. Used for both the result wait-map and the
// cluster-formation wait-map. A later `set()` for a key already holding a
// value overwrites it rather than queueing, so waiters always observe the
// most recent value.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

struct Slot<V> {
    value: Option<V>,
    notify: Arc<Notify>,
}

impl<V> Slot<V> {
    fn pending() -> Self {
        Self {
            value: None,
            notify: Arc::new(Notify::new()),
        }
    }
}

struct Inner<K, V> {
    slots: HashMap<K, Slot<V>>,
    /// Keys in the order they were first resolved, used to evict the
    /// least-recently-resolved entry once `capacity` is exceeded.
    resolved_order: VecDeque<K>,
}

/// `capacity == 0` means unbounded: no eviction ever runs.
pub struct WaitMap<K, V> {
    capacity: usize,
    inner: Mutex<Inner<K, V>>,
}

impl<K, V> WaitMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner {
                slots: HashMap::new(),
                resolved_order: VecDeque::new(),
            }),
        }
    }

    /// Stores `(key, value)`, waking every current waiter on `key`.
    /// Re-setting an already-resolved key silently overwrites the value
    /// (last-writer-wins) without re-waking already-returned waiters.
    pub fn set(&self, key: K, value: V) {
        let mut inner = self.inner.lock();
        let newly_resolved = {
            let slot = inner
                .slots
                .entry(key.clone())
                .or_insert_with(Slot::pending);
            let newly_resolved = slot.value.is_none();
            slot.value = Some(value);
            slot.notify.notify_waiters();
            newly_resolved
        };
        if newly_resolved {
            inner.resolved_order.push_back(key);
        }

        if self.capacity > 0 {
            while inner.slots.len() > self.capacity {
                // Eviction only ever removes keys this same method pushed
                // onto `resolved_order`, i.e. keys that were resolved at
                // some point; an unresolved key is never a candidate.
                match inner.resolved_order.pop_front() {
                    Some(oldest) => {
                        inner.slots.remove(&oldest);
                    }
                    None => break,
                }
            }
        }
    }

    /// Non-blocking lookup.
    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.lock().slots.get(key).and_then(|s| s.value.clone())
    }

    /// Blocks until `key` resolves or `cancel` fires. A waiter registered
    /// before `set` is guaranteed to observe the value; a waiter registered
    /// after `set` observes it immediately on the first `get` below. The
    /// `Notify` handle is obtained *before* the post-lock `get` recheck so a
    /// `set` racing between the two can never be missed: a tokio
    /// `notify_waiters()` call that lands after this `Notified` value is
    /// created, but before it is awaited, still wakes it.
    pub async fn wait_for(&self, key: &K, cancel: &CancellationToken) -> Option<V> {
        let notify = {
            let mut inner = self.inner.lock();
            let slot = inner
                .slots
                .entry(key.clone())
                .or_insert_with(Slot::pending);
            Arc::clone(&slot.notify)
        };
        let notified = notify.notified();

        if let Some(v) = self.get(key) {
            return Some(v);
        }

        tokio::select! {
            _ = notified => {}
            _ = cancel.cancelled() => return None,
        }

        self.get(key)
    }

    /// Drops `key` unconditionally. Caller contract: never evict an
    /// unresolved key — this is enforced by convention at the call site,
    /// not re-checked here, since eviction is always initiated by the
    /// owner of a key it knows is resolved.
    pub fn evict(&self, key: &K) {
        self.inner.lock().slots.remove(key);
    }
}
