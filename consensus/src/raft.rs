// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Leader-ordered log replication over an ephemeral, per-request cluster.
//
// There is no separate leader-election RPC phase: because membership is
// fixed for the lifetime of the cluster and known to every member up
// front, each replica deterministically picks the member with the
// lexicographically smallest `PeerId` as leader (see the design notes for
// why this replaces a full Raft election for single-term, short-lived
// clusters). The leader appends the accepted request to its local log,
// replicates it to followers, and applies it to the (deterministic) FSM
// on every replica; only the leader runs the post-commit callbacks that
// cache the result and forward it to the request's origin.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use b7s_node_data::execute::{ConsensusKind, ExecuteRequest, NodeResult, ResultCode, ResultMap};
use b7s_node_data::ids::{PeerId, RequestId};
use b7s_node_data::ports::Executor;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::errors::{ConsensusError, ShutdownError};
use crate::executor::{run_post_processors, ConsensusExecutor, PostProcessor, ResultCache};
use crate::transport::ClusterTransport;

#[derive(Debug, Clone, Serialize, Deserialize)]
enum RaftMessage {
    AppendEntries {
        index: u64,
        origin: PeerId,
        request_id: RequestId,
        timestamp_unix_ms: u64,
        request: ExecuteRequest,
    },
    AppendAck {
        index: u64,
        voter: PeerId,
    },
}

struct LogEntry {
    #[allow(dead_code)]
    index: u64,
    origin: PeerId,
    request_id: RequestId,
    request: ExecuteRequest,
}

#[derive(Serialize)]
struct PersistedLogEntry<'a> {
    index: u64,
    origin: PeerId,
    request: &'a ExecuteRequest,
}

/// Appends committed entries to `<workspace>/<request-id>/log` as newline-
/// delimited JSON. No snapshotting, no compaction: clusters here are
/// per-request and short-lived, so the log never grows past one request's
/// worth of entries. A `None` workspace disables persistence entirely,
/// which is what every in-process test uses.
struct PersistentLog {
    workspace: Option<PathBuf>,
}

impl PersistentLog {
    fn new(workspace: Option<PathBuf>) -> Self {
        Self { workspace }
    }

    fn append(&self, request_id: &RequestId, entry: &PersistedLogEntry<'_>) {
        let Some(workspace) = &self.workspace else {
            return;
        };
        let dir = workspace.join(request_id.as_str());
        if let Err(err) = std::fs::create_dir_all(&dir) {
            tracing::warn!(%request_id, "failed to create raft log directory: {err}");
            return;
        }
        let line = match serde_json::to_string(entry) {
            Ok(l) => l,
            Err(err) => {
                tracing::warn!(%request_id, "failed to encode raft log entry: {err}");
                return;
            }
        };
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file(&dir))
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(err) = result {
            tracing::warn!(%request_id, "failed to persist raft log entry: {err}");
        }
    }
}

fn log_file(dir: &Path) -> PathBuf {
    dir.join("log")
}

struct PendingCommit {
    acks: std::collections::HashSet<PeerId>,
    notify: Arc<Notify>,
}

pub struct RaftCluster {
    self_id: PeerId,
    leader: PeerId,
    members: Vec<PeerId>,
    majority: usize,
    transport: Arc<dyn ClusterTransport>,
    executor: Arc<dyn Executor>,
    result_cache: Arc<dyn ResultCache>,
    post_processors: Vec<PostProcessor>,
    append_timeout: Duration,
    next_index: AtomicU64,
    log: Mutex<Vec<LogEntry>>,
    persistent_log: PersistentLog,
    pending: Mutex<HashMap<u64, PendingCommit>>,
    shutdown: AtomicBool,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl RaftCluster {
    pub fn new(
        self_id: PeerId,
        mut members: Vec<PeerId>,
        transport: Arc<dyn ClusterTransport>,
        executor: Arc<dyn Executor>,
        result_cache: Arc<dyn ResultCache>,
        post_processors: Vec<PostProcessor>,
        append_timeout: Duration,
        workspace: Option<PathBuf>,
    ) -> Arc<Self> {
        members.sort();
        members.dedup();
        let leader = members.first().copied().unwrap_or(self_id);
        let majority = members.len() / 2 + 1;

        let cluster = Arc::new(Self {
            self_id,
            leader,
            members,
            majority,
            transport,
            executor,
            result_cache,
            post_processors,
            append_timeout,
            next_index: AtomicU64::new(1),
            log: Mutex::new(Vec::new()),
            persistent_log: PersistentLog::new(workspace),
            pending: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
            listener: Mutex::new(None),
        });

        let listener_cluster = Arc::clone(&cluster);
        let handle = tokio::spawn(async move { listener_cluster.run_inbound().await });
        *cluster.listener.lock() = Some(handle);
        cluster
    }

    fn is_leader(&self) -> bool {
        self.self_id == self.leader
    }

    async fn run_inbound(self: Arc<Self>) {
        let inbound = self.transport.inbound();
        while let Ok((from, bytes)) = inbound.recv().await {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            let message: RaftMessage = match serde_json::from_slice(&bytes) {
                Ok(m) => m,
                Err(err) => {
                    tracing::warn!(%from, "dropping malformed raft message: {err}");
                    continue;
                }
            };
            match message {
                RaftMessage::AppendEntries {
                    index,
                    origin,
                    request_id,
                    request,
                    ..
                } => self.on_append_entries(from, index, origin, request_id, request).await,
                RaftMessage::AppendAck { index, voter } => self.on_append_ack(index, voter),
            }
        }
    }

    async fn on_append_entries(
        &self,
        leader: PeerId,
        index: u64,
        origin: PeerId,
        request_id: RequestId,
        request: ExecuteRequest,
    ) {
        self.log.lock().push(LogEntry {
            index,
            origin,
            request_id: request_id.clone(),
            request: request.clone(),
        });
        self.persistent_log.append(
            &request_id,
            &PersistedLogEntry { index, origin, request: &request },
        );

        // Deterministic apply: every replica runs the same function against
        // the same inputs, matching redundant/crash-tolerant execution.
        let result = self.executor.execute(&request).await;
        let mut results = ResultMap::new();
        results.insert(self.self_id, result);
        self.result_cache.set(&request_id, results);

        let ack = RaftMessage::AppendAck { index, voter: self.self_id };
        if let Ok(bytes) = serde_json::to_vec(&ack) {
            if let Err(err) = self.transport.send(leader, bytes).await {
                tracing::warn!(%leader, "failed to ack append-entries: {err}");
            }
        }
    }

    fn on_append_ack(&self, index: u64, voter: PeerId) {
        let mut pending = self.pending.lock();
        if let Some(commit) = pending.get_mut(&index) {
            commit.acks.insert(voter);
            if commit.acks.len() >= self.majority {
                commit.notify.notify_one();
            }
        }
    }

    async fn replicate_and_wait(
        &self,
        index: u64,
        origin: PeerId,
        request_id: RequestId,
        request: ExecuteRequest,
    ) -> Result<(), ConsensusError> {
        let notify = Arc::new(Notify::new());
        {
            let mut pending = self.pending.lock();
            let mut acks = std::collections::HashSet::new();
            acks.insert(self.self_id);
            let reached_alone = acks.len() >= self.majority;
            pending.insert(
                index,
                PendingCommit { acks, notify: Arc::clone(&notify) },
            );
            if reached_alone {
                pending.remove(&index);
                return Ok(());
            }
        }

        let timestamp_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let message = RaftMessage::AppendEntries {
            index,
            origin,
            request_id,
            timestamp_unix_ms,
            request,
        };
        let bytes = serde_json::to_vec(&message)
            .map_err(|e| ConsensusError::TaskTerminated(e.to_string()))?;

        for peer in self.members.iter().filter(|p| **p != self.self_id) {
            if let Err(err) = self.transport.send(*peer, bytes.clone()).await {
                tracing::warn!(%peer, "failed to replicate entry: {err}");
            }
        }

        let wait = tokio::time::timeout(self.append_timeout, notify.notified());
        let majority_reached = match wait.await {
            Ok(()) => true,
            Err(_) => {
                let pending = self.pending.lock();
                pending
                    .get(&index)
                    .map(|c| c.acks.len() >= self.majority)
                    .unwrap_or(false)
            }
        };
        self.pending.lock().remove(&index);

        if majority_reached {
            Ok(())
        } else {
            Err(ConsensusError::NoQuorum(format!("raft index {index}")))
        }
    }
}

#[async_trait]
impl ConsensusExecutor for RaftCluster {
    fn kind(&self) -> ConsensusKind {
        ConsensusKind::Raft
    }

    async fn execute(
        &self,
        origin: PeerId,
        request_id: RequestId,
        _timestamp: SystemTime,
        request: ExecuteRequest,
    ) -> Result<(ResultCode, Option<NodeResult>), ConsensusError> {
        if !self.is_leader() {
            // Followers only apply entries replicated to them; a direct
            // client call on a follower is a routing mistake upstream.
            return Err(ConsensusError::TaskTerminated(
                "execute called on a non-leader raft replica".to_string(),
            ));
        }

        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        self.log.lock().push(LogEntry {
            index,
            origin,
            request_id: request_id.clone(),
            request: request.clone(),
        });
        self.persistent_log.append(
            &request_id,
            &PersistedLogEntry { index, origin, request: &request },
        );

        let result = self.executor.execute(&request).await;

        self.replicate_and_wait(index, origin, request_id.clone(), request.clone())
            .await?;

        let mut results = ResultMap::new();
        results.insert(self.self_id, result.clone());
        self.result_cache.set(&request_id, results);
        run_post_processors(&self.post_processors, &request_id, &origin, &request, &result);
        metrics::counter!(crate::CONSENSUS_COMMITS_TOTAL, "kind" => "raft").increment(1);

        Ok((ResultCode::Ok, Some(result)))
    }

    async fn shutdown(&self, timeout: Duration) -> Result<(), ShutdownError> {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.is_leader() {
            tracing::info!(leader = %self.self_id, "renouncing raft leadership before shutdown");
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryClusterTransport;

    struct EchoExecutor;

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

    struct NullCache;
    impl ResultCache for NullCache {
        fn set(&self, _request_id: &RequestId, _result: ResultMap) {}
        fn evict(&self, _request_id: &RequestId) {}
    }

    fn request() -> ExecuteRequest {
        ExecuteRequest::new(b7s_node_data::ids::FunctionId::new("fn-1"), "main")
    }

    #[tokio::test]
    async fn single_node_cluster_commits_without_peers() {
        let peer = PeerId::from_seed(1);
        let transport = InMemoryClusterTransport::new(peer);
        let cluster = RaftCluster::new(
            peer,
            vec![peer],
            transport,
            Arc::new(EchoExecutor),
            Arc::new(NullCache),
            vec![],
            Duration::from_millis(200),
            None,
        );

        let (code, result) = cluster
            .execute(peer, RequestId::new(), SystemTime::now(), request())
            .await
            .expect("commit succeeds");
        assert_eq!(code, ResultCode::Ok);
        assert_eq!(result.unwrap().stdout, "main");
    }

    #[tokio::test]
    async fn committed_entries_are_persisted_under_the_workspace() {
        let peer = PeerId::from_seed(1);
        let transport = InMemoryClusterTransport::new(peer);
        let workspace = std::env::temp_dir().join(format!("b7s-raft-test-{}", peer));
        let _ = std::fs::remove_dir_all(&workspace);
        let cluster = RaftCluster::new(
            peer,
            vec![peer],
            transport,
            Arc::new(EchoExecutor),
            Arc::new(NullCache),
            vec![],
            Duration::from_millis(200),
            Some(workspace.clone()),
        );

        let request_id = RequestId::new();
        cluster
            .execute(peer, request_id.clone(), SystemTime::now(), request())
            .await
            .expect("commit succeeds");

        let contents = std::fs::read_to_string(workspace.join(request_id.as_str()).join("log"))
            .expect("log file was written");
        assert!(contents.contains("\"index\":1"));
        std::fs::remove_dir_all(&workspace).ok();
    }

    #[tokio::test]
    async fn two_node_cluster_replicates_to_follower() {
        let leader_id = PeerId::from_seed(1);
        let follower_id = PeerId::from_seed(2);
        let (leader_id, follower_id) = if leader_id < follower_id {
            (leader_id, follower_id)
        } else {
            (follower_id, leader_id)
        };

        let leader_transport = InMemoryClusterTransport::new(leader_id);
        let follower_transport = InMemoryClusterTransport::new(follower_id);
        InMemoryClusterTransport::connect(&leader_transport, &follower_transport);

        let members = vec![leader_id, follower_id];
        let leader = RaftCluster::new(
            leader_id,
            members.clone(),
            leader_transport,
            Arc::new(EchoExecutor),
            Arc::new(NullCache),
            vec![],
            Duration::from_millis(500),
            None,
        );
        let _follower = RaftCluster::new(
            follower_id,
            members,
            follower_transport,
            Arc::new(EchoExecutor),
            Arc::new(NullCache),
            vec![],
            Duration::from_millis(500),
            None,
        );

        let (code, result) = leader
            .execute(leader_id, RequestId::new(), SystemTime::now(), request())
            .await
            .expect("commit reaches majority");
        assert_eq!(code, ResultCode::Ok);
        assert!(result.is_some());
    }
}
