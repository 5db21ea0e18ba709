// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use async_channel::TrySendError;
use serde::{Deserialize, Serialize};

use crate::execute::{ConsensusKind, ExecuteRequest, ResultCode, ResultMap};
use crate::ids::{FunctionId, PeerId, RequestId};

/// Message type tag, matching the wire's `type` field one-to-one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topics {
    RollCall,
    RollCallResponse,
    FormCluster,
    FormClusterResponse,
    Execute,
    ExecuteResponse,
    Install,
    InstallResponse,
    Health,
    /// Internal passthrough carrying one cluster's raft/pbft wire bytes,
    /// demultiplexed by `request_id` to the matching `ClusterTransport`.
    /// Not part of the externally documented wire vocabulary, the same way
    /// a gossip node carries internal topics alongside its documented
    /// consensus messages.
    Consensus,
    Unknown,
}

impl Topics {
    /// Total number of *known* topics; used to size fixed routing tables
    /// indexed by `Topics::index`.
    pub const COUNT: usize = 10;

    pub fn index(self) -> Option<usize> {
        match self {
            Topics::RollCall => Some(0),
            Topics::RollCallResponse => Some(1),
            Topics::FormCluster => Some(2),
            Topics::FormClusterResponse => Some(3),
            Topics::Execute => Some(4),
            Topics::ExecuteResponse => Some(5),
            Topics::Install => Some(6),
            Topics::InstallResponse => Some(7),
            Topics::Health => Some(8),
            Topics::Consensus => Some(9),
            Topics::Unknown => None,
        }
    }
}

impl From<&str> for Topics {
    fn from(tag: &str) -> Self {
        match tag {
            "MsgRollCall" => Topics::RollCall,
            "MsgRollCallResponse" => Topics::RollCallResponse,
            "MsgFormCluster" => Topics::FormCluster,
            "MsgFormClusterResponse" => Topics::FormClusterResponse,
            "MsgExecute" => Topics::Execute,
            "MsgExecuteResponse" => Topics::ExecuteResponse,
            "MsgInstallFunction" => Topics::Install,
            "MsgInstallFunctionResponse" => Topics::InstallResponse,
            "MsgHealth" => Topics::Health,
            "MsgConsensus" => Topics::Consensus,
            _ => Topics::Unknown,
        }
    }
}

/// W3C-trace-context-shaped propagation info. Carried either in the ambient
/// cancellation/context of the caller or embedded in the message; the two
/// are never merged (see `Envelope::trace_or`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceInfo {
    pub trace_id: String,
    pub span_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub baggage: Vec<(String, String)>,
}

impl TraceInfo {
    pub fn is_empty(&self) -> bool {
        self.trace_id.is_empty() && self.span_id.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollCallRequest {
    pub function_id: FunctionId,
    pub request_id: RequestId,
    #[serde(default)]
    pub attributes: Vec<String>,
    #[serde(default)]
    pub consensus: ConsensusKind,
    #[serde(default)]
    pub topic: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollCallResponse {
    pub function_id: FunctionId,
    pub request_id: RequestId,
    pub code: ResultCode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormClusterRequest {
    pub request_id: RequestId,
    pub peers: Vec<PeerId>,
    pub consensus: ConsensusKind,
    #[serde(default)]
    pub trace: Option<TraceInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormClusterResponse {
    pub request_id: RequestId,
    pub consensus: ConsensusKind,
    pub code: ResultCode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteWireRequest {
    pub request_id: RequestId,
    pub request: ExecuteRequest,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteWireResponse {
    pub request_id: RequestId,
    pub code: ResultCode,
    pub results: ResultMap,
    #[serde(default)]
    pub cluster: Option<ConsensusKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallRequest {
    pub cid: FunctionId,
    pub manifest_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallResponse {
    pub code: ResultCode,
    pub cid: FunctionId,
}

/// One cluster's raft/pbft wire bytes, opaque to everything except the
/// `ConsensusExecutor` instance handling `request_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusEnvelope {
    pub request_id: RequestId,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    RollCall(RollCallRequest),
    RollCallResponse(RollCallResponse),
    FormCluster(FormClusterRequest),
    FormClusterResponse(FormClusterResponse),
    Execute(Box<ExecuteWireRequest>),
    ExecuteResponse(Box<ExecuteWireResponse>),
    Install(InstallRequest),
    InstallResponse(InstallResponse),
    Health,
    Consensus(ConsensusEnvelope),
    /// Payload for a tag the core does not recognize; dropped by the router
    /// with a warning rather than treated as an error.
    Unknown,
}

impl Payload {
    pub fn topic(&self) -> Topics {
        match self {
            Payload::RollCall(_) => Topics::RollCall,
            Payload::RollCallResponse(_) => Topics::RollCallResponse,
            Payload::FormCluster(_) => Topics::FormCluster,
            Payload::FormClusterResponse(_) => Topics::FormClusterResponse,
            Payload::Execute(_) => Topics::Execute,
            Payload::ExecuteResponse(_) => Topics::ExecuteResponse,
            Payload::Install(_) => Topics::Install,
            Payload::InstallResponse(_) => Topics::InstallResponse,
            Payload::Health => Topics::Health,
            Payload::Consensus(_) => Topics::Consensus,
            Payload::Unknown => Topics::Unknown,
        }
    }
}

/// Every inbound and outbound message: type tag (implicit via `payload`),
/// sender identity, optional trace info. `request_id` is carried at the
/// payload level for request-correlating messages and surfaced here for
/// convenience by `Envelope::request_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub from: PeerId,
    pub payload: Payload,
    #[serde(default)]
    pub trace: Option<TraceInfo>,
}

impl Envelope {
    pub fn new(from: PeerId, payload: Payload) -> Self {
        Self {
            from,
            payload,
            trace: None,
        }
    }

    pub fn with_trace(mut self, trace: TraceInfo) -> Self {
        self.trace = Some(trace);
        self
    }

    pub fn topic(&self) -> Topics {
        self.payload.topic()
    }

    pub fn request_id(&self) -> Option<&RequestId> {
        match &self.payload {
            Payload::RollCall(p) => Some(&p.request_id),
            Payload::RollCallResponse(p) => Some(&p.request_id),
            Payload::FormCluster(p) => Some(&p.request_id),
            Payload::FormClusterResponse(p) => Some(&p.request_id),
            Payload::Execute(p) => Some(&p.request_id),
            Payload::ExecuteResponse(p) => Some(&p.request_id),
            Payload::Consensus(p) => Some(&p.request_id),
            Payload::Install(_)
            | Payload::InstallResponse(_)
            | Payload::Health
            | Payload::Unknown => None,
        }
    }

    /// Prefers the ambient context if non-empty, else falls back to what
    /// is embedded in the message. The two sources are never merged
    /// field-by-field.
    pub fn trace_or(&self, ambient: Option<&TraceInfo>) -> Option<TraceInfo> {
        match ambient {
            Some(t) if !t.is_empty() => Some(t.clone()),
            _ => self.trace.clone(),
        }
    }
}

/// Thin wrapper around `async_channel`, used for both inbound and outbound
/// per-topic message routing.
#[derive(Clone)]
pub struct AsyncQueue<M: Clone> {
    receiver: async_channel::Receiver<M>,
    sender: async_channel::Sender<M>,
}

impl<M: Clone> Default for AsyncQueue<M> {
    fn default() -> Self {
        let (sender, receiver) = async_channel::unbounded();
        Self { receiver, sender }
    }
}

impl<M: Clone> AsyncQueue<M> {
    pub fn send(&self, msg: M) -> async_channel::Send<'_, M> {
        self.sender.send(msg)
    }

    pub fn try_send(&self, msg: M) -> Result<(), TrySendError<M>> {
        self.sender.try_send(msg)
    }

    pub fn recv(&self) -> async_channel::Recv<'_, M> {
        self.receiver.recv()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_tag_maps_to_unknown_topic() {
        assert_eq!(Topics::from("MsgBogus"), Topics::Unknown);
        assert_eq!(Topics::from("MsgHealth"), Topics::Health);
    }

    #[test]
    fn trace_prefers_ambient_over_embedded() {
        let env = Envelope::new(PeerId::from_seed(1), Payload::Health)
            .with_trace(TraceInfo {
                trace_id: "embedded".into(),
                span_id: "embedded-span".into(),
                baggage: vec![],
            });

        let ambient = TraceInfo {
            trace_id: "ambient".into(),
            span_id: "ambient-span".into(),
            baggage: vec![],
        };

        let resolved = env.trace_or(Some(&ambient));
        assert_eq!(resolved.unwrap().trace_id, "ambient");

        let resolved = env.trace_or(None);
        assert_eq!(resolved.unwrap().trace_id, "embedded");
    }

    #[tokio::test]
    async fn async_queue_delivers_in_fifo_order() {
        let q: AsyncQueue<u32> = AsyncQueue::default();
        q.send(1).await.unwrap();
        q.send(2).await.unwrap();
        assert_eq!(q.recv().await.unwrap(), 1);
        assert_eq!(q.recv().await.unwrap(), 2);
    }
}
