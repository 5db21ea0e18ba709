// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Bounded collection of outstanding roll-call windows. Used only by the
// head role: one entry per in-flight request waiting for workers to
// acknowledge a roll-call broadcast.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use b7s_node_data::ids::{PeerId, RequestId};
use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

use crate::error::AdmissionError;

/// One pending roll-call: created at issue, completed when the accumulator
/// reaches `required` responses or the collection window elapses, removed
/// (popped) when the owning caller consumes it via `RollCallQueue::collect`.
pub struct RollCallEntry {
    pub request_id: RequestId,
    pub origin: PeerId,
    pub required: usize,
    responded: Mutex<HashSet<PeerId>>,
    notify: Notify,
    // Held for the entry's lifetime; dropping it frees the queue slot it
    // occupied, which is how overflow is bounded against the configured
    // capacity.
    _permit: OwnedSemaphorePermit,
}

impl RollCallEntry {
    fn record(&self, peer: PeerId) {
        let mut responded = self.responded.lock();
        responded.insert(peer);
        if responded.len() >= self.required {
            self.notify.notify_waiters();
        }
    }

    fn snapshot(&self) -> Vec<PeerId> {
        self.responded.lock().iter().copied().collect()
    }
}

pub struct RollCallQueue {
    entries: Mutex<HashMap<RequestId, Arc<RollCallEntry>>>,
    slots: Arc<Semaphore>,
}

impl RollCallQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            slots: Arc::new(Semaphore::new(capacity)),
        }
    }

    /// Pushes a new collection window. Fails immediately (rather than
    /// queueing) when the queue is already at capacity — the caller
    /// surfaces this as an overloaded admission error.
    pub fn try_push(
        &self,
        request_id: RequestId,
        origin: PeerId,
        required: usize,
    ) -> Result<Arc<RollCallEntry>, AdmissionError> {
        let permit = Arc::clone(&self.slots)
            .try_acquire_owned()
            .map_err(|_| AdmissionError::Overloaded)?;

        let entry = Arc::new(RollCallEntry {
            request_id: request_id.clone(),
            origin,
            required,
            responded: Mutex::new(HashSet::new()),
            notify: Notify::new(),
            _permit: permit,
        });
        self.entries.lock().insert(request_id, Arc::clone(&entry));
        Ok(entry)
    }

    /// Records an inbound `MsgRollCallResponse` against its collector, if
    /// one is still pending for `request_id`.
    pub fn record_response(&self, request_id: &RequestId, peer: PeerId) {
        if let Some(entry) = self.entries.lock().get(request_id).cloned() {
            entry.record(peer);
        }
    }

    /// Blocks until `entry` reaches its required count or `window` elapses,
    /// then pops it from the queue (freeing its slot) and returns whichever
    /// peers had responded by then.
    pub async fn collect(&self, entry: &Arc<RollCallEntry>, window: Duration) -> Vec<PeerId> {
        let _ = tokio::time::timeout(window, entry.notify.notified()).await;
        self.entries.lock().remove(&entry.request_id);
        entry.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn collects_responses_up_to_the_required_count() {
        let queue = RollCallQueue::new(4);
        let origin = PeerId::from_seed(1);
        let request_id = RequestId::new();
        let entry = queue
            .try_push(request_id.clone(), origin, 2)
            .expect("room in the queue");

        queue.record_response(&request_id, PeerId::from_seed(2));
        queue.record_response(&request_id, PeerId::from_seed(3));

        let peers = queue.collect(&entry, Duration::from_millis(200)).await;
        assert_eq!(peers.len(), 2);
    }

    #[tokio::test]
    async fn collect_times_out_with_a_partial_set() {
        let queue = RollCallQueue::new(4);
        let origin = PeerId::from_seed(1);
        let request_id = RequestId::new();
        let entry = queue
            .try_push(request_id.clone(), origin, 3)
            .expect("room in the queue");

        queue.record_response(&request_id, PeerId::from_seed(2));

        let peers = queue.collect(&entry, Duration::from_millis(30)).await;
        assert_eq!(peers.len(), 1);
    }

    #[test]
    fn push_fails_once_the_queue_is_full() {
        let queue = RollCallQueue::new(1);
        let origin = PeerId::from_seed(1);
        let _first = queue
            .try_push(RequestId::new(), origin, 1)
            .expect("first push has room");
        let second = queue.try_push(RequestId::new(), origin, 1);
        assert!(matches!(second, Err(AdmissionError::Overloaded)));
    }

    #[tokio::test]
    async fn collecting_frees_the_queue_slot() {
        let queue = RollCallQueue::new(1);
        let origin = PeerId::from_seed(1);
        let request_id = RequestId::new();
        let entry = queue
            .try_push(request_id, origin, 1)
            .expect("first push has room");
        queue.collect(&entry, Duration::from_millis(10)).await;

        let second = queue.try_push(RequestId::new(), origin, 1);
        assert!(second.is_ok());
    }
}
