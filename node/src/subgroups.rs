// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Tracks pubsub topic subscriptions and the per-topic peer sets discovered
// through roll-call traffic on that topic.

use std::collections::{BTreeSet, HashMap};

use b7s_node_data::ids::PeerId;
use b7s_node_data::ports::Network;
use parking_lot::RwLock;

struct Subgroup {
    receiver: async_channel::Receiver<b7s_node_data::message::Envelope>,
    peers: BTreeSet<PeerId>,
}

pub struct WorkSubgroups {
    topics: RwLock<HashMap<String, Subgroup>>,
}

impl Default for WorkSubgroups {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkSubgroups {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribes to `topic` on first use and returns its receive handle;
    /// subsequent calls for an already-subscribed topic are a cheap clone of
    /// the existing handle, not a second subscription.
    pub fn subscribe(
        &self,
        topic: &str,
        network: &dyn Network,
    ) -> async_channel::Receiver<b7s_node_data::message::Envelope> {
        if let Some(sg) = self.topics.read().get(topic) {
            return sg.receiver.clone();
        }
        let mut topics = self.topics.write();
        if let Some(sg) = topics.get(topic) {
            return sg.receiver.clone();
        }
        let receiver = network.subscribe(topic);
        topics.insert(
            topic.to_string(),
            Subgroup {
                receiver: receiver.clone(),
                peers: BTreeSet::new(),
            },
        );
        receiver
    }

    /// Drops a topic's subscription handle and known-peer set. The next
    /// `subscribe` for the same topic re-subscribes from scratch.
    pub fn unsubscribe(&self, topic: &str) {
        self.topics.write().remove(topic);
    }

    /// Records that `peer` is known to be listening on `topic`, typically
    /// learned from a roll-call response. A no-op if the topic was never
    /// subscribed.
    pub fn note_peer(&self, topic: &str, peer: PeerId) {
        if let Some(sg) = self.topics.write().get_mut(topic) {
            sg.peers.insert(peer);
        }
    }

    pub fn peers_of(&self, topic: &str) -> BTreeSet<PeerId> {
        self.topics
            .read()
            .get(topic)
            .map(|sg| sg.peers.clone())
            .unwrap_or_default()
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.topics.read().contains_key(topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use b7s_node_data::message::Envelope;

    struct StubNetwork;

    #[async_trait]
    impl Network for StubNetwork {
        async fn send(&self, _peer: PeerId, _msg: Envelope) -> anyhow::Result<()> {
            Ok(())
        }
        async fn broadcast(&self, _topic: &str, _msg: Envelope) -> anyhow::Result<()> {
            Ok(())
        }
        fn subscribe(&self, _topic: &str) -> async_channel::Receiver<Envelope> {
            async_channel::unbounded().1
        }
    }

    #[test]
    fn subscribe_is_idempotent_per_topic() {
        let groups = WorkSubgroups::new();
        let network = StubNetwork;
        groups.subscribe("t1", &network);
        assert!(groups.is_subscribed("t1"));
        groups.subscribe("t1", &network);
        assert_eq!(groups.topics.read().len(), 1);
    }

    #[test]
    fn unsubscribe_removes_the_topic_record() {
        let groups = WorkSubgroups::new();
        let network = StubNetwork;
        groups.subscribe("t1", &network);
        groups.unsubscribe("t1");
        assert!(!groups.is_subscribed("t1"));
    }

    #[test]
    fn note_peer_tracks_known_peers_per_topic() {
        let groups = WorkSubgroups::new();
        let network = StubNetwork;
        groups.subscribe("t1", &network);
        groups.note_peer("t1", PeerId::from_seed(1));
        groups.note_peer("t1", PeerId::from_seed(2));
        assert_eq!(groups.peers_of("t1").len(), 2);
    }
}
