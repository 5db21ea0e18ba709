// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// In-process test doubles shared by the integration tests: a pubsub hub
// standing in for the real libp2p/Kadcast transport, plus a trivial
// executor and function store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use b7s_node_data::execute::{ExecuteRequest, NodeResult, ResultCode};
use b7s_node_data::ids::{FunctionId, PeerId};
use b7s_node_data::message::{Envelope, Payload};
use b7s_node_data::ports::{Executor, FunctionStore, Network};
use parking_lot::Mutex;

#[derive(Default)]
struct HubInner {
    inboxes: HashMap<PeerId, async_channel::Sender<Envelope>>,
    topics: HashMap<String, Vec<async_channel::Sender<Envelope>>>,
}

/// Shared message hub standing in for the pubsub transport: every peer that
/// joins gets its own inbox, and broadcasting to a topic fans out to every
/// peer that has subscribed to it.
pub struct NetworkHub {
    inner: Mutex<HubInner>,
}

impl NetworkHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(HubInner::default()),
        })
    }

    pub fn join(self: &Arc<Self>, peer_id: PeerId) -> Arc<InMemoryNetwork> {
        let (tx, rx) = async_channel::unbounded();
        self.inner.lock().inboxes.insert(peer_id, tx);
        Arc::new(InMemoryNetwork {
            self_id: peer_id,
            hub: Arc::clone(self),
            inbox: rx,
        })
    }
}

pub struct InMemoryNetwork {
    self_id: PeerId,
    hub: Arc<NetworkHub>,
    inbox: async_channel::Receiver<Envelope>,
}

#[async_trait]
impl Network for InMemoryNetwork {
    async fn send(&self, peer: PeerId, msg: Envelope) -> anyhow::Result<()> {
        let sender = self
            .hub
            .inner
            .lock()
            .inboxes
            .get(&peer)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown peer {peer}"))?;
        sender
            .send(msg)
            .await
            .map_err(|e| anyhow::anyhow!("send failed: {e}"))
    }

    async fn broadcast(&self, topic: &str, msg: Envelope) -> anyhow::Result<()> {
        let subscribers: Vec<_> = self
            .hub
            .inner
            .lock()
            .topics
            .get(topic)
            .cloned()
            .unwrap_or_default();
        for sender in subscribers {
            let _ = sender.send(msg.clone()).await;
        }
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> async_channel::Receiver<Envelope> {
        let own_sender = self.hub.inner.lock().inboxes.get(&self.self_id).cloned();
        if let Some(sender) = own_sender {
            self.hub
                .inner
                .lock()
                .topics
                .entry(topic.to_string())
                .or_default()
                .push(sender);
        }
        self.inbox.clone()
    }
}

/// Wraps a node's `Network` and silently drops its outbound PBFT `Commit`
/// broadcasts, simulating a replica that stops voting to commit without
/// otherwise going offline (it still relays pre-prepare/prepare and still
/// answers roll-call and form-cluster). The wire bytes are consensus-opaque
/// to `Network`, so the fault is detected the same way any other observer
/// of the wire would: by sniffing the externally-tagged JSON for the
/// `Commit` variant.
pub struct DropCommitNetwork {
    inner: Arc<dyn Network>,
}

impl DropCommitNetwork {
    pub fn wrap(inner: Arc<dyn Network>) -> Arc<dyn Network> {
        Arc::new(Self { inner })
    }
}

fn is_pbft_commit(msg: &Envelope) -> bool {
    match &msg.payload {
        Payload::Consensus(env) => std::str::from_utf8(&env.bytes)
            .map(|s| s.contains("\"Commit\""))
            .unwrap_or(false),
        _ => false,
    }
}

#[async_trait]
impl Network for DropCommitNetwork {
    async fn send(&self, peer: PeerId, msg: Envelope) -> anyhow::Result<()> {
        if is_pbft_commit(&msg) {
            return Ok(());
        }
        self.inner.send(peer, msg).await
    }

    async fn broadcast(&self, topic: &str, msg: Envelope) -> anyhow::Result<()> {
        if is_pbft_commit(&msg) {
            return Ok(());
        }
        self.inner.broadcast(topic, msg).await
    }

    fn subscribe(&self, topic: &str) -> async_channel::Receiver<Envelope> {
        self.inner.subscribe(topic)
    }
}

/// Returns the request's method string as stdout, annotated with the
/// executing peer once `Node` stamps the result.
pub struct EchoExecutor;

#[async_trait]
impl Executor for EchoExecutor {
    async fn execute(&self, request: &ExecuteRequest) -> NodeResult {
        NodeResult {
            code: ResultCode::Ok,
            stdout: request.method.clone(),
            stderr: String::new(),
            exit_code: 0,
            metadata: None,
            peer: None,
        }
    }
}

/// Installs instantly, recording every call for assertions.
#[derive(Default)]
pub struct RecordingFunctionStore {
    installed: Mutex<Vec<FunctionId>>,
}

#[async_trait]
impl FunctionStore for RecordingFunctionStore {
    async fn install(&self, function_id: &FunctionId, _manifest_url: &str) -> anyhow::Result<()> {
        self.installed.lock().push(function_id.clone());
        Ok(())
    }
}

impl RecordingFunctionStore {
    pub fn installed(&self) -> Vec<FunctionId> {
        self.installed.lock().clone()
    }
}

/// Never completes within any test's timeout, used to exercise the
/// install-timeout path.
pub struct HangingFunctionStore;

#[async_trait]
impl FunctionStore for HangingFunctionStore {
    async fn install(&self, _function_id: &FunctionId, _manifest_url: &str) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}

/// Holds the admission permit for longer than any test's polling window,
/// used to exercise the overloaded-admission path.
pub struct SlowExecutor(pub Duration);

#[async_trait]
impl Executor for SlowExecutor {
    async fn execute(&self, request: &ExecuteRequest) -> NodeResult {
        tokio::time::sleep(self.0).await;
        NodeResult {
            code: ResultCode::Ok,
            stdout: request.method.clone(),
            stderr: String::new(),
            exit_code: 0,
            metadata: None,
            peer: None,
        }
    }
}
