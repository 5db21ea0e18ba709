// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Bridges one cluster's `b7s_consensus::ClusterTransport` onto the node-wide
// `Network`. A real Raft/PBFT library multiplexes its RPCs over a shared
// host transport; here the `Node` demultiplexes inbound `MsgConsensus`
// envelopes by request-id and hands each cluster instance its own narrow
// channel (consensus/src/transport.rs's module comment spells out why this
// lives on the `Node` side rather than inside the consensus crate).

use std::sync::Arc;

use async_trait::async_trait;
use b7s_consensus::ClusterTransport;
use b7s_node_data::ids::{PeerId, RequestId};
use b7s_node_data::message::{ConsensusEnvelope, Envelope, Payload};
use b7s_node_data::ports::Network;

pub struct NetworkClusterTransport {
    self_id: PeerId,
    request_id: RequestId,
    network: Arc<dyn Network>,
    inbound_tx: async_channel::Sender<(PeerId, Vec<u8>)>,
    inbound_rx: async_channel::Receiver<(PeerId, Vec<u8>)>,
}

impl NetworkClusterTransport {
    pub fn new(self_id: PeerId, request_id: RequestId, network: Arc<dyn Network>) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = async_channel::unbounded();
        Arc::new(Self {
            self_id,
            request_id,
            network,
            inbound_tx,
            inbound_rx,
        })
    }

    /// Feeds a `MsgConsensus` envelope the `Node`'s dispatch loop routed
    /// here because its `request_id` matched this transport.
    pub fn deliver(&self, from: PeerId, bytes: Vec<u8>) {
        if self.inbound_tx.try_send((from, bytes)).is_err() {
            tracing::warn!(
                request_id = %self.request_id,
                %from,
                "cluster transport inbound channel closed or full, dropping message"
            );
        }
    }
}

#[async_trait]
impl ClusterTransport for NetworkClusterTransport {
    async fn send(&self, peer: PeerId, bytes: Vec<u8>) -> anyhow::Result<()> {
        let envelope = Envelope::new(
            self.self_id,
            Payload::Consensus(ConsensusEnvelope {
                request_id: self.request_id.clone(),
                bytes,
            }),
        );
        self.network.send(peer, envelope).await
    }

    fn inbound(&self) -> async_channel::Receiver<(PeerId, Vec<u8>)> {
        self.inbound_rx.clone()
    }
}
