// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// A cluster's internal peer-to-peer channel, scoped to one request-id.
// Kept separate from `b7s_node_data::ports::Network` (the node-wide
// message bus) the same way a real Raft/PBFT library multiplexes its own
// RPCs over a shared host transport: the `Node` orchestrator is
// responsible for demultiplexing inbound wire envelopes by request-id and
// handing each cluster instance its own narrow channel.

use async_trait::async_trait;
use b7s_node_data::ids::PeerId;

#[async_trait]
pub trait ClusterTransport: Send + Sync {
    async fn send(&self, peer: PeerId, bytes: Vec<u8>) -> anyhow::Result<()>;

    fn inbound(&self) -> async_channel::Receiver<(PeerId, Vec<u8>)>;
}

/// In-memory transport used by tests and by the in-process multi-peer
/// harness: every cluster member shares a registry of inbound channels
/// keyed by peer id.
pub struct InMemoryClusterTransport {
    self_id: PeerId,
    peers: parking_lot::RwLock<
        std::collections::HashMap<PeerId, async_channel::Sender<(PeerId, Vec<u8>)>>,
    >,
    inbound_rx: async_channel::Receiver<(PeerId, Vec<u8>)>,
    inbound_tx: async_channel::Sender<(PeerId, Vec<u8>)>,
}

impl InMemoryClusterTransport {
    pub fn new(self_id: PeerId) -> std::sync::Arc<Self> {
        let (inbound_tx, inbound_rx) = async_channel::unbounded();
        std::sync::Arc::new(Self {
            self_id,
            peers: parking_lot::RwLock::new(std::collections::HashMap::new()),
            inbound_rx,
            inbound_tx,
        })
    }

    /// Wires two transports together so each can reach the other by peer id.
    pub fn connect(a: &std::sync::Arc<Self>, b: &std::sync::Arc<Self>) {
        a.peers.write().insert(b.self_id, b.inbound_tx.clone());
        b.peers.write().insert(a.self_id, a.inbound_tx.clone());
    }
}

#[async_trait]
impl ClusterTransport for InMemoryClusterTransport {
    async fn send(&self, peer: PeerId, bytes: Vec<u8>) -> anyhow::Result<()> {
        let sender = self
            .peers
            .read()
            .get(&peer)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown peer {peer}"))?;
        sender
            .send((self.self_id, bytes))
            .await
            .map_err(|e| anyhow::anyhow!("send failed: {e}"))
    }

    fn inbound(&self) -> async_channel::Receiver<(PeerId, Vec<u8>)> {
        self.inbound_rx.clone()
    }
}
