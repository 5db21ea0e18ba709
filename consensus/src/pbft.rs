// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Practical Byzantine Fault Tolerance over an ephemeral, per-request
// cluster: pre-prepare / prepare / commit, with a view-change path when
// the primary fails to drive a request to commit before its timeout.
//
// Cluster size must satisfy `n >= 3f+1` for some `f >= 1`; `f` is derived
// from cluster size unless overridden (`PbftConfig::max_faulty_override`).
// Quorums are `2f+1` throughout, matching the classical construction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use b7s_node_data::execute::{ConsensusKind, ExecuteRequest, NodeResult, ResultCode, ResultMap};
use b7s_node_data::ids::{PeerId, RequestId};
use b7s_node_data::ports::Executor;
use indexmap::IndexSet;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::errors::{ConsensusError, ShutdownError};
use crate::executor::{run_post_processors, ConsensusExecutor, PostProcessor, ResultCache};
use crate::transport::ClusterTransport;

/// Authenticates an inbound pre-prepare as genuinely originating from the
/// claimed peer, over the `(view, seq, digest)` tuple it commits to. A
/// no-op `AlwaysValid` is provided for tests and for transports (e.g. a
/// TLS-authenticated stream) that authenticate at a lower layer; production
/// deployments supply a signature-checking impl keyed to peer identity.
pub trait Verifier: Send + Sync {
    fn verify(&self, peer: PeerId, view: u64, seq: u64, digest: &str) -> bool;
}

pub struct AlwaysValid;
impl Verifier for AlwaysValid {
    fn verify(&self, _peer: PeerId, _view: u64, _seq: u64, _digest: &str) -> bool {
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum PbftMessage {
    PrePrepare {
        view: u64,
        seq: u64,
        digest: String,
        origin: PeerId,
        request_id: RequestId,
        request: ExecuteRequest,
    },
    Prepare { view: u64, seq: u64, digest: String },
    Commit { view: u64, seq: u64, digest: String },
    ViewChange { new_view: u64 },
}

fn digest_of(request_id: &RequestId, request: &ExecuteRequest) -> String {
    // Cheap content digest; not a cryptographic commitment, only used to
    // detect divergent proposals for the same (view, seq).
    let serialized = serde_json::to_string(request).unwrap_or_default();
    format!("{request_id}:{:x}", simple_hash(serialized.as_bytes()))
}

fn simple_hash(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

struct RoundState {
    digest: Option<String>,
    prepares: IndexSet<PeerId>,
    commits: IndexSet<PeerId>,
    request: Option<(PeerId, RequestId, ExecuteRequest)>,
    committed_notify: Arc<Notify>,
    committed: bool,
    own_result: Option<NodeResult>,
}

impl Default for RoundState {
    fn default() -> Self {
        Self {
            digest: None,
            prepares: IndexSet::new(),
            commits: IndexSet::new(),
            request: None,
            committed_notify: Arc::new(Notify::new()),
            committed: false,
            own_result: None,
        }
    }
}

pub struct PbftCluster {
    self_id: PeerId,
    members: Vec<PeerId>,
    f: usize,
    quorum: usize,
    primary: Mutex<PeerId>,
    view: AtomicU64,
    next_seq: AtomicU64,
    transport: Arc<dyn ClusterTransport>,
    executor: Arc<dyn Executor>,
    result_cache: Arc<dyn ResultCache>,
    post_processors: Vec<PostProcessor>,
    verifier: Arc<dyn Verifier>,
    view_change_timeout: Duration,
    rounds: Mutex<HashMap<u64, RoundState>>,
    seen: Mutex<IndexSet<(PeerId, u64, u64, &'static str)>>,
    shutdown: AtomicBool,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl PbftCluster {
    pub fn new(
        self_id: PeerId,
        mut members: Vec<PeerId>,
        transport: Arc<dyn ClusterTransport>,
        executor: Arc<dyn Executor>,
        result_cache: Arc<dyn ResultCache>,
        post_processors: Vec<PostProcessor>,
        verifier: Arc<dyn Verifier>,
        view_change_timeout: Duration,
        max_faulty_override: Option<usize>,
    ) -> Result<Arc<Self>, ConsensusError> {
        members.sort();
        members.dedup();
        let n = members.len();
        let f = max_faulty_override.unwrap_or_else(|| (n.saturating_sub(1)) / 3);
        if f < 1 || n < 3 * f + 1 {
            return Err(ConsensusError::ClusterTooSmall { size: n, f });
        }
        let quorum = 2 * f + 1;
        let primary = members.first().copied().unwrap_or(self_id);

        let cluster = Arc::new(Self {
            self_id,
            members,
            f,
            quorum,
            primary: Mutex::new(primary),
            view: AtomicU64::new(0),
            next_seq: AtomicU64::new(1),
            transport,
            executor,
            result_cache,
            post_processors,
            verifier,
            view_change_timeout,
            rounds: Mutex::new(HashMap::new()),
            seen: Mutex::new(IndexSet::new()),
            shutdown: AtomicBool::new(false),
            listener: Mutex::new(None),
        });

        let listener_cluster = Arc::clone(&cluster);
        let handle = tokio::spawn(async move { listener_cluster.run_inbound().await });
        *cluster.listener.lock() = Some(handle);
        Ok(cluster)
    }

    fn is_primary(&self) -> bool {
        *self.primary.lock() == self.self_id
    }

    async fn broadcast(&self, message: &PbftMessage) {
        let bytes = match serde_json::to_vec(message) {
            Ok(b) => b,
            Err(err) => {
                tracing::warn!("failed to encode pbft message: {err}");
                return;
            }
        };
        for peer in self.members.iter().filter(|p| **p != self.self_id) {
            if let Err(err) = self.transport.send(*peer, bytes.clone()).await {
                tracing::warn!(%peer, "failed to send pbft message: {err}");
            }
        }
    }

    async fn run_inbound(self: Arc<Self>) {
        let inbound = self.transport.inbound();
        while let Ok((from, bytes)) = inbound.recv().await {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            let message: PbftMessage = match serde_json::from_slice(&bytes) {
                Ok(m) => m,
                Err(err) => {
                    tracing::warn!(%from, "dropping malformed pbft message: {err}");
                    continue;
                }
            };
            self.handle_message(from, message).await;
        }
    }

    fn dedup(&self, peer: PeerId, view: u64, seq: u64, phase: &'static str) -> bool {
        self.seen.lock().insert((peer, view, seq, phase))
    }

    async fn handle_message(&self, from: PeerId, message: PbftMessage) {
        match message {
            PbftMessage::PrePrepare { view, seq, digest, origin, request_id, request } => {
                if !self.verifier.verify(from, view, seq, &digest) {
                    tracing::warn!(%from, "rejecting pre-prepare with bad authenticator");
                    return;
                }
                if !self.dedup(from, view, seq, "pre-prepare") {
                    return;
                }
                {
                    let mut rounds = self.rounds.lock();
                    let round = rounds.entry(seq).or_default();
                    round.digest = Some(digest.clone());
                    round.request = Some((origin, request_id, request));
                }
                let prepare = PbftMessage::Prepare { view, seq, digest: digest.clone() };
                self.record_prepare(self.self_id, seq, &digest);
                self.broadcast(&prepare).await;
            }
            PbftMessage::Prepare { view, seq, digest } => {
                if !self.dedup(from, view, seq, "prepare") {
                    return;
                }
                self.record_prepare(from, seq, &digest);
                if self.prepare_quorum_reached(seq, &digest) {
                    let commit = PbftMessage::Commit { view, seq, digest: digest.clone() };
                    self.record_commit(self.self_id, seq, &digest);
                    self.broadcast(&commit).await;
                }
            }
            PbftMessage::Commit { view: _, seq, digest } => {
                if !self.dedup(from, self.view.load(Ordering::Acquire), seq, "commit") {
                    return;
                }
                self.record_commit(from, seq, &digest);
                self.try_apply_commit(seq).await;
            }
            PbftMessage::ViewChange { new_view } => {
                let mut primary = self.primary.lock();
                let idx = (new_view as usize) % self.members.len().max(1);
                *primary = self.members[idx];
                self.view.store(new_view, Ordering::Release);
            }
        }
    }

    fn record_prepare(&self, peer: PeerId, seq: u64, digest: &str) {
        let mut rounds = self.rounds.lock();
        let round = rounds.entry(seq).or_default();
        if round.digest.as_deref() == Some(digest) || round.digest.is_none() {
            round.digest.get_or_insert_with(|| digest.to_string());
            round.prepares.insert(peer);
        }
    }

    fn record_commit(&self, peer: PeerId, seq: u64, digest: &str) {
        let mut rounds = self.rounds.lock();
        let round = rounds.entry(seq).or_default();
        if round.digest.as_deref() == Some(digest) || round.digest.is_none() {
            round.digest.get_or_insert_with(|| digest.to_string());
            round.commits.insert(peer);
        }
    }

    fn prepare_quorum_reached(&self, seq: u64, digest: &str) -> bool {
        let rounds = self.rounds.lock();
        rounds
            .get(&seq)
            .map(|r| r.digest.as_deref() == Some(digest) && r.prepares.len() >= self.quorum)
            .unwrap_or(false)
    }

    async fn try_apply_commit(&self, seq: u64) {
        let (should_apply, request, notify) = {
            let mut rounds = self.rounds.lock();
            let Some(round) = rounds.get_mut(&seq) else {
                return;
            };
            if round.committed || round.commits.len() < self.quorum {
                (false, None, round.committed_notify.clone())
            } else {
                round.committed = true;
                (true, round.request.clone(), round.committed_notify.clone())
            }
        };

        if !should_apply {
            return;
        }
        let Some((origin, request_id, request)) = request else {
            return;
        };

        let result = self.executor.execute(&request).await;
        let mut results = ResultMap::new();
        results.insert(self.self_id, result.clone());
        self.result_cache.set(&request_id, results);

        if self.is_primary() {
            run_post_processors(&self.post_processors, &request_id, &origin, &request, &result);
        }
        metrics::counter!(crate::CONSENSUS_COMMITS_TOTAL, "kind" => "pbft").increment(1);

        if let Some(round) = self.rounds.lock().get_mut(&seq) {
            round.own_result = Some(result);
        }
        notify.notify_one();
    }

    async fn watch_for_timeout(&self, seq: u64) -> bool {
        let notify = {
            let mut rounds = self.rounds.lock();
            rounds.entry(seq).or_default().committed_notify.clone()
        };
        matches!(
            tokio::time::timeout(self.view_change_timeout, notify.notified()).await,
            Ok(())
        )
    }

    async fn initiate_view_change(&self) {
        let new_view = self.view.fetch_add(1, Ordering::SeqCst) + 1;
        let idx = (new_view as usize) % self.members.len().max(1);
        *self.primary.lock() = self.members[idx];
        metrics::counter!(crate::CONSENSUS_VIEW_CHANGES_TOTAL).increment(1);
        self.broadcast(&PbftMessage::ViewChange { new_view }).await;
    }
}

#[async_trait]
impl ConsensusExecutor for PbftCluster {
    fn kind(&self) -> ConsensusKind {
        ConsensusKind::Pbft
    }

    async fn execute(
        &self,
        origin: PeerId,
        request_id: RequestId,
        _timestamp: SystemTime,
        request: ExecuteRequest,
    ) -> Result<(ResultCode, Option<NodeResult>), ConsensusError> {
        if !self.is_primary() {
            return Err(ConsensusError::TaskTerminated(
                "execute called on a non-primary pbft replica".to_string(),
            ));
        }

        let view = self.view.load(Ordering::Acquire);
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let digest = digest_of(&request_id, &request);

        {
            let mut rounds = self.rounds.lock();
            let round = rounds.entry(seq).or_default();
            round.digest = Some(digest.clone());
            round.request = Some((origin, request_id.clone(), request.clone()));
        }
        self.record_prepare(self.self_id, seq, &digest);

        let pre_prepare = PbftMessage::PrePrepare {
            view,
            seq,
            digest: digest.clone(),
            origin,
            request_id: request_id.clone(),
            request: request.clone(),
        };
        self.broadcast(&pre_prepare).await;

        let mut attempts = 0usize;
        const MAX_VIEW_CHANGES: usize = 3;
        loop {
            if self.watch_for_timeout(seq).await {
                break;
            }
            attempts += 1;
            if attempts > MAX_VIEW_CHANGES {
                return Err(ConsensusError::ViewChangeExhausted(attempts));
            }
            self.initiate_view_change().await;
        }

        let result = self
            .rounds
            .lock()
            .get(&seq)
            .and_then(|r| r.own_result.clone())
            .ok_or_else(|| ConsensusError::NoQuorum(format!("pbft seq {seq}")))?;
        Ok((ResultCode::Ok, Some(result)))
    }

    async fn shutdown(&self, timeout: Duration) -> Result<(), ShutdownError> {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let handle = self.listener.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            match tokio::time::timeout(timeout, handle).await {
                Ok(_) => Ok(()),
                Err(_) => Err(ShutdownError::TimedOut(timeout)),
            }
        } else {
            Ok(())
        }
    }
}
