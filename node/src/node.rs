// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// The node orchestrator: constructed once per process, owns every shared
// resource (cluster registry, both wait-maps, the roll-call queue, the
// admission semaphore, the subgroup table) and dispatches inbound messages
// through one of two role-selected receive loops, `run_head` vs.
// `run_worker`, rather than a per-message role check.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use b7s_consensus::{AlwaysValid, ConsensusExecutor, PbftCluster, PostProcessor, RaftCluster, ResultCache, Verifier};
use b7s_node_data::config::{NodeConfig, Role};
use b7s_node_data::error::ValidationError;
use b7s_node_data::execute::{ConsensusKind, ExecuteRequest, NodeResult, ResultCode, ResultMap};
use b7s_node_data::ids::{FunctionId, PeerId, RequestId};
use b7s_node_data::message::{
    Envelope, ExecuteWireRequest, ExecuteWireResponse, FormClusterRequest, FormClusterResponse,
    InstallResponse, Payload, RollCallRequest, RollCallResponse,
};
use b7s_node_data::ports::{AttributeLoader, Executor, FunctionStore, MetadataProvider, Network, NoMetadata};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::cluster_transport::NetworkClusterTransport;
use crate::error::{AdmissionError, NodeError};
use crate::metrics;
use crate::registry::ClusterRegistry;
use crate::roll_call::RollCallQueue;
use crate::subgroups::WorkSubgroups;
use crate::wait_map::WaitMap;

/// Raft clusters are not sized by the roll-call; quorum sizing is left
/// external to the core, so the orchestrator picks one fixed, odd-majority
/// default. Operators wanting a different size front this with their own
/// roll-call attribute filter (out of scope here).
const DEFAULT_RAFT_CLUSTER_SIZE: usize = 3;

struct WaitMapResultCache(Arc<WaitMap<RequestId, ResultMap>>);

impl ResultCache for WaitMapResultCache {
    fn set(&self, request_id: &RequestId, result: ResultMap) {
        self.0.set(request_id.clone(), result);
    }

    fn evict(&self, request_id: &RequestId) {
        self.0.evict(request_id);
    }
}

pub struct Node {
    config: NodeConfig,
    self_id: PeerId,
    network: Arc<dyn Network>,
    executor: Arc<dyn Executor>,
    function_store: Arc<dyn FunctionStore>,
    attribute_loader: Option<Arc<dyn AttributeLoader>>,
    metadata_provider: Arc<dyn MetadataProvider>,
    pbft_verifier: Arc<dyn Verifier>,
    registry: ClusterRegistry,
    result_wait: Arc<WaitMap<RequestId, ResultMap>>,
    form_cluster_wait: WaitMap<RequestId, ConsensusKind>,
    roll_calls: RollCallQueue,
    subgroups: WorkSubgroups,
    admission: Arc<Semaphore>,
    cluster_transports: Mutex<HashMap<RequestId, Arc<NetworkClusterTransport>>>,
}

impl Node {
    pub fn new(
        config: NodeConfig,
        self_id: PeerId,
        network: Arc<dyn Network>,
        executor: Arc<dyn Executor>,
        function_store: Arc<dyn FunctionStore>,
    ) -> Arc<Self> {
        let admission = Arc::new(Semaphore::new(config.concurrency));
        let roll_calls = RollCallQueue::new(config.roll_call_queue_capacity);
        let result_wait = Arc::new(WaitMap::new(config.result_cache_capacity));
        // Unbounded: mirrors the teacher's `waitmap.New[...](0)` for
        // consensus-ack correlation, which is never capacity-evicted.
        let form_cluster_wait = WaitMap::new(0);

        Arc::new(Self {
            config,
            self_id,
            network,
            executor,
            function_store,
            attribute_loader: None,
            metadata_provider: Arc::new(NoMetadata),
            pbft_verifier: Arc::new(AlwaysValid),
            registry: ClusterRegistry::new(),
            result_wait,
            form_cluster_wait,
            roll_calls,
            subgroups: WorkSubgroups::new(),
            admission,
            cluster_transports: Mutex::new(HashMap::new()),
        })
    }

    /// Builder-style setters for the optional external collaborators;
    /// `new` wires the mandatory ones (network/executor/function-store) so
    /// tests that don't care about attributes/metadata/pbft signing can
    /// skip them.
    pub fn with_attribute_loader(mut self: Arc<Self>, loader: Arc<dyn AttributeLoader>) -> Arc<Self> {
        Arc::get_mut(&mut self)
            .expect("with_attribute_loader must run before Node is shared")
            .attribute_loader = Some(loader);
        self
    }

    pub fn with_metadata_provider(mut self: Arc<Self>, provider: Arc<dyn MetadataProvider>) -> Arc<Self> {
        Arc::get_mut(&mut self)
            .expect("with_metadata_provider must run before Node is shared")
            .metadata_provider = provider;
        self
    }

    pub fn with_pbft_verifier(mut self: Arc<Self>, verifier: Arc<dyn Verifier>) -> Arc<Self> {
        Arc::get_mut(&mut self)
            .expect("with_pbft_verifier must run before Node is shared")
            .pbft_verifier = verifier;
        self
    }

    /// Loads and advertises this node's attributes once at startup, if
    /// `load_attributes` is configured.
    pub fn load_attributes(&self) -> anyhow::Result<Vec<String>> {
        if !self.config.load_attributes {
            return Ok(Vec::new());
        }
        match &self.attribute_loader {
            Some(loader) => loader.load(&self.self_id),
            None => Ok(Vec::new()),
        }
    }

    fn required_peers(&self, consensus: ConsensusKind) -> usize {
        match consensus {
            ConsensusKind::None => 1,
            ConsensusKind::Raft => DEFAULT_RAFT_CLUSTER_SIZE,
            ConsensusKind::Pbft => {
                let f = self.config.consensus.pbft.max_faulty_override.unwrap_or(1).max(1);
                3 * f + 1
            }
        }
    }

    // ---- Public operations --------------------------------------------

    pub async fn install(&self, function_id: FunctionId, uri: &str) -> Result<(), NodeError> {
        if function_id.is_empty() {
            return Err(ValidationError::EmptyCid.into());
        }
        if uri.is_empty() {
            return Err(ValidationError::EmptyUri.into());
        }

        tracing::info!(cid = %function_id, uri, "installing function");
        tokio::time::timeout(
            self.config.execution_timeout,
            self.function_store.install(&function_id, uri),
        )
        .await
        .map_err(|_| NodeError::Timeout("install timed out".to_string()))?
        .map_err(|e| NodeError::Transport(e.to_string()))
    }

    pub async fn execute(
        self: &Arc<Self>,
        request: ExecuteRequest,
    ) -> Result<(RequestId, ResultCode, ResultMap), NodeError> {
        let _permit = Arc::clone(&self.admission)
            .try_acquire_owned()
            .map_err(|_| NodeError::Admission(AdmissionError::Overloaded))?;
        metrics::set_admission_inflight(
            self.config.metrics_enabled,
            (self.config.concurrency - self.admission.available_permits()) as i64,
        );

        match self.config.role {
            Role::Head => self.execute_as_head(request).await,
            Role::Worker => self.execute_locally(request).await,
        }
    }

    async fn execute_as_head(
        self: &Arc<Self>,
        request: ExecuteRequest,
    ) -> Result<(RequestId, ResultCode, ResultMap), NodeError> {
        let request_id = RequestId::new();
        let topic = b7s_node_data::config::DEFAULT_TOPIC.to_string();
        let required = self.required_peers(request.config.consensus);

        tracing::info!(
            request_id = %request_id,
            required,
            "issuing roll call for function {}",
            request.function_id
        );

        let entry = self
            .roll_calls
            .try_push(request_id.clone(), self.self_id, required)
            .map_err(|e| {
                metrics::record_rollcall_overloaded(self.config.metrics_enabled);
                NodeError::Admission(e)
            })?;

        let roll_call = RollCallRequest {
            function_id: request.function_id.clone(),
            request_id: request_id.clone(),
            attributes: request.config.attributes_required.clone(),
            consensus: request.config.consensus,
            topic: Some(topic.clone()),
        };
        self.network
            .broadcast(&topic, Envelope::new(self.self_id, Payload::RollCall(roll_call)))
            .await
            .map_err(|e| NodeError::Transport(e.to_string()))?;

        let peers = self.roll_calls.collect(&entry, self.config.roll_call_timeout).await;
        if peers.len() < required {
            return Err(NodeError::ClusterFormation(format!(
                "only {} of {required} required peers responded within the roll-call window",
                peers.len()
            )));
        }
        let members: Vec<PeerId> = peers.into_iter().take(required).collect();

        if request.config.consensus.is_consensus_required() {
            self.form_cluster_and_dispatch(request_id, members, request).await
        } else {
            self.dispatch_direct(request_id, members[0], request).await
        }
    }

    async fn form_cluster_and_dispatch(
        self: &Arc<Self>,
        request_id: RequestId,
        members: Vec<PeerId>,
        request: ExecuteRequest,
    ) -> Result<(RequestId, ResultCode, ResultMap), NodeError> {
        let form_msg = FormClusterRequest {
            request_id: request_id.clone(),
            peers: members.clone(),
            consensus: request.config.consensus,
            trace: None,
        };
        for peer in &members {
            self.network
                .send(
                    *peer,
                    Envelope::new(self.self_id, Payload::FormCluster(form_msg.clone())),
                )
                .await
                .map_err(|e| NodeError::Transport(e.to_string()))?;
        }

        let cancel = CancellationToken::new();
        let ack = tokio::time::timeout(
            self.config.cluster_formation_timeout,
            self.form_cluster_wait.wait_for(&request_id, &cancel),
        )
        .await;
        self.form_cluster_wait.evict(&request_id);

        match ack {
            Ok(Some(kind)) if kind == request.config.consensus => {}
            Ok(Some(_)) => {
                return Err(NodeError::ClusterFormation(
                    "peer acknowledged a different consensus kind than requested".to_string(),
                ))
            }
            _ => {
                return Err(NodeError::ClusterFormation(
                    "cluster formation window elapsed before any peer acknowledged".to_string(),
                ))
            }
        }

        let mut sorted = members.clone();
        sorted.sort();
        let leader = sorted[0];

        self.send_execute_and_await(request_id, leader, request).await
    }

    async fn dispatch_direct(
        self: &Arc<Self>,
        request_id: RequestId,
        peer: PeerId,
        request: ExecuteRequest,
    ) -> Result<(RequestId, ResultCode, ResultMap), NodeError> {
        self.send_execute_and_await(request_id, peer, request).await
    }

    async fn send_execute_and_await(
        self: &Arc<Self>,
        request_id: RequestId,
        peer: PeerId,
        request: ExecuteRequest,
    ) -> Result<(RequestId, ResultCode, ResultMap), NodeError> {
        let timeout = request.config.timeout;
        let wire = ExecuteWireRequest {
            request_id: request_id.clone(),
            request,
            timestamp: now_unix_millis(),
        };
        self.network
            .send(peer, Envelope::new(self.self_id, Payload::Execute(Box::new(wire))))
            .await
            .map_err(|e| NodeError::Transport(e.to_string()))?;

        let cancel = CancellationToken::new();
        let results = tokio::time::timeout(timeout, self.result_wait.wait_for(&request_id, &cancel))
            .await
            .map_err(|_| NodeError::Timeout(format!("execute request {request_id} timed out")))?
            .ok_or_else(|| {
                NodeError::Timeout(format!("execute request {request_id} produced no result"))
            })?;

        Ok((request_id, ResultCode::Ok, results))
    }

    /// Worker role direct execution: no roll-call, no cluster, just the
    /// local executor.
    async fn execute_locally(
        &self,
        request: ExecuteRequest,
    ) -> Result<(RequestId, ResultCode, ResultMap), NodeError> {
        let request_id = RequestId::new();
        let result = self.run_local(&request).await;
        let mut results = ResultMap::new();
        results.insert(self.self_id, result.clone());
        self.result_wait.set(request_id.clone(), results.clone());
        Ok((request_id, result.code, results))
    }

    async fn run_local(&self, request: &ExecuteRequest) -> NodeResult {
        let mut result = self.executor.execute(request).await;
        result.peer = Some(self.self_id);
        if let Some(meta) = self.metadata_provider.metadata(request, &result.stdout) {
            result.metadata = Some(meta);
        }
        result
    }

    pub async fn join_cluster(self: &Arc<Self>, from: PeerId, msg: FormClusterRequest) -> Result<(), NodeError> {
        if self.registry.get(&msg.request_id).await.is_some() {
            tracing::debug!(request_id = %msg.request_id, "join_cluster: already registered, re-acking");
            self.ack_form_cluster(from, &msg).await;
            return Ok(());
        }

        tracing::info!(
            request_id = %msg.request_id,
            peers = msg.peers.len(),
            consensus = ?msg.consensus,
            "joining cluster"
        );

        let cache: Arc<dyn ResultCache> = Arc::new(WaitMapResultCache(Arc::clone(&self.result_wait)));
        let post_processors = self.build_post_processors();
        let transport =
            NetworkClusterTransport::new(self.self_id, msg.request_id.clone(), Arc::clone(&self.network));
        self.cluster_transports
            .lock()
            .insert(msg.request_id.clone(), Arc::clone(&transport));

        let executor: Arc<dyn ConsensusExecutor> = match msg.consensus {
            ConsensusKind::Raft => RaftCluster::new(
                self.self_id,
                msg.peers.clone(),
                transport,
                Arc::clone(&self.executor),
                cache,
                post_processors,
                self.config.consensus.raft.election_timeout,
                Some(self.config.workspace.clone()),
            ),
            ConsensusKind::Pbft => PbftCluster::new(
                self.self_id,
                msg.peers.clone(),
                transport,
                Arc::clone(&self.executor),
                cache,
                post_processors,
                Arc::clone(&self.pbft_verifier),
                self.config.consensus.pbft.view_change_timeout,
                self.config.consensus.pbft.max_faulty_override,
            )
            .map_err(NodeError::from)?,
            ConsensusKind::None => {
                self.cluster_transports.lock().remove(&msg.request_id);
                return Err(ValidationError::UnknownConsensusKind(0).into());
            }
        };

        self.registry.insert(msg.request_id.clone(), executor).await?;
        metrics::set_clusters_active(self.config.metrics_enabled, self.registry.len().await as i64);
        self.ack_form_cluster(from, &msg).await;
        Ok(())
    }

    async fn ack_form_cluster(&self, from: PeerId, msg: &FormClusterRequest) {
        let response = FormClusterResponse {
            request_id: msg.request_id.clone(),
            consensus: msg.consensus,
            code: ResultCode::Ok,
        };
        if let Err(err) = self
            .network
            .send(from, Envelope::new(self.self_id, Payload::FormClusterResponse(response)))
            .await
        {
            tracing::warn!(request_id = %msg.request_id, "failed to ack form-cluster: {err}");
        }
    }

    /// Builds the cluster's post-commit callbacks. Caching the result is
    /// already handled by the `ResultCache` capability passed into the
    /// consensus executor, so the only post-processor needed here is the
    /// one forwarding the result to the request's origin.
    fn build_post_processors(self: &Arc<Self>) -> Vec<PostProcessor> {
        let network = Arc::clone(&self.network);
        let self_id = self.self_id;
        let send_timeout = self.config.consensus_cluster_send_timeout;

        let send: PostProcessor = Arc::new(move |request_id, origin, _request, result| {
            let network = Arc::clone(&network);
            let origin = *origin;
            let request_id = request_id.clone();
            let mut results = ResultMap::new();
            results.insert(self_id, result.clone());
            let response = ExecuteWireResponse {
                request_id: request_id.clone(),
                code: result.code,
                results,
                cluster: None,
            };
            let envelope = Envelope::new(self_id, Payload::ExecuteResponse(Box::new(response)));

            tokio::spawn(async move {
                match tokio::time::timeout(send_timeout, network.send(origin, envelope)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        tracing::warn!(%request_id, "failed to send execute response to origin: {err}")
                    }
                    Err(_) => {
                        tracing::warn!(%request_id, "timed out sending execute response to origin")
                    }
                }
            });
        });

        vec![send]
    }

    pub async fn leave_cluster(&self, request_id: &RequestId, timeout: Duration) -> Result<(), NodeError> {
        let executor = self.registry.get(request_id).await.ok_or_else(|| {
            NodeError::ClusterFormation(format!("no cluster registered for request {request_id}"))
        })?;

        tracing::info!(%request_id, "leave_cluster: awaiting result before shutdown");
        let cancel = CancellationToken::new();
        let _ = tokio::time::timeout(timeout, self.result_wait.wait_for(request_id, &cancel)).await;

        tracing::info!(%request_id, "leave_cluster: shutting down consensus executor");
        let shutdown_result = executor.shutdown(timeout).await;
        match &shutdown_result {
            Ok(()) => tracing::info!(%request_id, "cluster shutdown complete"),
            Err(err) => tracing::warn!(%request_id, "cluster shutdown error: {err}"),
        }

        let still_live = shutdown_result
            .as_ref()
            .err()
            .map(|e| e.cluster_still_live())
            .unwrap_or(false);
        if !still_live {
            self.cluster_transports.lock().remove(request_id);
            self.registry.remove(request_id).await;
            tracing::info!(%request_id, "cluster registry entry removed");
            metrics::set_clusters_active(self.config.metrics_enabled, self.registry.len().await as i64);
        }

        shutdown_result.map_err(NodeError::from)
    }

    // ---- Inbound message dispatch --------------------------------------

    pub async fn run(self: Arc<Self>) {
        match self.config.role {
            Role::Head => self.run_head().await,
            Role::Worker => self.run_worker().await,
        }
    }

    async fn fan_in_subscriptions(self: &Arc<Self>) -> async_channel::Receiver<Envelope> {
        let (tx, rx) = async_channel::unbounded::<Envelope>();
        for topic in self.config.effective_topics() {
            let receiver = self.subgroups.subscribe(&topic, self.network.as_ref());
            let tx = tx.clone();
            tokio::spawn(async move {
                while let Ok(envelope) = receiver.recv().await {
                    if tx.send(envelope).await.is_err() {
                        break;
                    }
                }
            });
        }
        rx
    }

    async fn run_head(self: Arc<Self>) {
        let rx = self.fan_in_subscriptions().await;
        while let Ok(envelope) = rx.recv().await {
            let node = Arc::clone(&self);
            tokio::spawn(async move { node.handle_head_envelope(envelope).await });
        }
    }

    async fn run_worker(self: Arc<Self>) {
        let rx = self.fan_in_subscriptions().await;
        while let Ok(envelope) = rx.recv().await {
            let node = Arc::clone(&self);
            tokio::spawn(async move { node.handle_worker_envelope(envelope).await });
        }
    }

    async fn handle_head_envelope(self: Arc<Self>, envelope: Envelope) {
        match envelope.payload {
            Payload::RollCallResponse(resp) => {
                self.roll_calls.record_response(&resp.request_id, envelope.from);
            }
            Payload::FormClusterResponse(resp) => {
                self.form_cluster_wait.set(resp.request_id.clone(), resp.consensus);
            }
            Payload::ExecuteResponse(resp) => {
                self.result_wait.set(resp.request_id.clone(), resp.results.clone());
            }
            Payload::InstallResponse(resp) => {
                tracing::debug!(cid = %resp.cid, code = ?resp.code, "install response received");
            }
            Payload::Consensus(env) => self.route_consensus_message(envelope.from, env),
            Payload::Health => {}
            other => {
                tracing::warn!(topic = ?other.topic(), "head received a message it does not dispatch, dropping");
            }
        }
    }

    async fn handle_worker_envelope(self: Arc<Self>, envelope: Envelope) {
        match envelope.payload {
            Payload::RollCall(roll_call) => self.respond_to_roll_call(envelope.from, roll_call).await,
            Payload::FormCluster(msg) => {
                if let Err(err) = self.join_cluster(envelope.from, msg).await {
                    tracing::warn!("join_cluster failed: {err}");
                }
            }
            Payload::Execute(wire) => self.handle_inbound_execute(envelope.from, *wire).await,
            Payload::Install(req) => {
                let code = match self.install(req.cid.clone(), &req.manifest_url).await {
                    Ok(()) => ResultCode::Ok,
                    Err(err) => {
                        tracing::warn!("install failed: {err}");
                        ResultCode::Error
                    }
                };
                let response = InstallResponse { code, cid: req.cid };
                if let Err(err) = self
                    .network
                    .send(envelope.from, Envelope::new(self.self_id, Payload::InstallResponse(response)))
                    .await
                {
                    tracing::warn!("failed to send install response: {err}");
                }
            }
            Payload::Consensus(env) => self.route_consensus_message(envelope.from, env),
            Payload::Health => {}
            other => {
                tracing::warn!(topic = ?other.topic(), "worker received a message it does not dispatch, dropping");
            }
        }
    }

    async fn respond_to_roll_call(&self, from: PeerId, roll_call: RollCallRequest) {
        let response = RollCallResponse {
            function_id: roll_call.function_id,
            request_id: roll_call.request_id.clone(),
            code: ResultCode::Ok,
        };
        if let Err(err) = self
            .network
            .send(from, Envelope::new(self.self_id, Payload::RollCallResponse(response)))
            .await
        {
            tracing::warn!(request_id = %roll_call.request_id, "failed to ack roll call: {err}");
        }
    }

    async fn handle_inbound_execute(self: Arc<Self>, from: PeerId, wire: ExecuteWireRequest) {
        if let Some(executor) = self.registry.get(&wire.request_id).await {
            let timestamp = UNIX_EPOCH + Duration::from_millis(wire.timestamp);
            if let Err(err) = executor
                .execute(from, wire.request_id.clone(), timestamp, wire.request)
                .await
            {
                tracing::warn!(request_id = %wire.request_id, "consensus execute failed: {err}");
            }
            return;
        }

        // No registered cluster: this is a direct, consensus-free dispatch.
        let result = self.run_local(&wire.request).await;
        let mut results = ResultMap::new();
        results.insert(self.self_id, result.clone());
        self.result_wait.set(wire.request_id.clone(), results.clone());

        let response = ExecuteWireResponse {
            request_id: wire.request_id.clone(),
            code: result.code,
            results,
            cluster: None,
        };
        if let Err(err) = self
            .network
            .send(from, Envelope::new(self.self_id, Payload::ExecuteResponse(Box::new(response))))
            .await
        {
            tracing::warn!(request_id = %wire.request_id, "failed to send direct execute response: {err}");
        }
    }

    fn route_consensus_message(&self, from: PeerId, env: b7s_node_data::message::ConsensusEnvelope) {
        let transport = self.cluster_transports.lock().get(&env.request_id).cloned();
        match transport {
            Some(transport) => transport.deliver(from, env.bytes),
            None => {
                tracing::warn!(request_id = %env.request_id, "consensus message for an unknown or torn-down cluster")
            }
        }
    }
}

fn now_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
