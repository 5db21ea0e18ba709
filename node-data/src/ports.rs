// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Trait contracts for the node's external collaborators: the concrete
// transport, sandboxed executor, function store, and similar out-of-scope
// integrations. Defined here, rather than in the `node` or `consensus`
// crate that calls them, so both the orchestrator and the consensus-
// executor variants can depend on the same contract without a crate cycle
// between `node` and `consensus`.

use async_trait::async_trait;

use crate::execute::{ExecuteRequest, NodeResult};
use crate::ids::{FunctionId, PeerId};
use crate::message::Envelope;

/// The WASM runtime executor, abstracted as a blocking `execute` capability.
/// Expected to be safe for concurrent calls.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, request: &ExecuteRequest) -> NodeResult;
}

/// Content-addressed function fetch/cache, abstracted away from the core.
#[async_trait]
pub trait FunctionStore: Send + Sync {
    async fn install(
        &self,
        function_id: &FunctionId,
        manifest_url: &str,
    ) -> anyhow::Result<()>;
}

/// The pubsub/libp2p transport, abstracted as a message bus. `send` targets
/// one peer; `broadcast` fans out to a topic's subscribers.
#[async_trait]
pub trait Network: Send + Sync {
    async fn send(&self, peer: PeerId, msg: Envelope) -> anyhow::Result<()>;
    async fn broadcast(
        &self,
        topic: &str,
        msg: Envelope,
    ) -> anyhow::Result<()>;
    fn subscribe(&self, topic: &str) -> async_channel::Receiver<Envelope>;
}

/// Loads and advertises node attributes at startup when `load_attributes` is
/// set; queried once per process, not on the hot path.
pub trait AttributeLoader: Send + Sync {
    fn load(&self, peer: &PeerId) -> anyhow::Result<Vec<String>>;
}

/// Plug point producing per-result metadata, queried after execution to
/// annotate a `NodeResult` before it is cached or sent to the origin.
pub trait MetadataProvider: Send + Sync {
    fn metadata(
        &self,
        request: &ExecuteRequest,
        stdout: &str,
    ) -> Option<serde_json::Value>;
}

/// A no-op `MetadataProvider`, used as the default when no provider is
/// configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMetadata;

impl MetadataProvider for NoMetadata {
    fn metadata(
        &self,
        _request: &ExecuteRequest,
        _stdout: &str,
    ) -> Option<serde_json::Value> {
        None
    }
}
