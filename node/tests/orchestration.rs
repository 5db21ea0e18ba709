// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// End-to-end scenarios driven through the public `Node` API rather than
// its internal pieces: roll-call, cluster formation, both consensus
// variants, and the admission/idempotence properties.

mod support;

use std::sync::Arc;
use std::time::Duration;

use b7s_node::{Node, NodeError};
use b7s_node_data::config::{ConsensusConfig, NodeConfig, PbftConfig, RaftConfig, Role};
use b7s_node_data::error::ValidationError;
use b7s_node_data::execute::{ConsensusKind, ExecuteRequest};
use b7s_node_data::ids::{FunctionId, PeerId};
use b7s_node_data::message::FormClusterRequest;
use b7s_node_data::ports::Network;

use support::{EchoExecutor, HangingFunctionStore, NetworkHub, RecordingFunctionStore, SlowExecutor};

fn test_config(role: Role, concurrency: usize) -> NodeConfig {
    NodeConfig {
        role,
        concurrency,
        topics: Default::default(),
        load_attributes: false,
        workspace: std::env::temp_dir(),
        execution_timeout: Duration::from_millis(200),
        roll_call_timeout: Duration::from_millis(300),
        cluster_formation_timeout: Duration::from_millis(400),
        consensus_cluster_send_timeout: Duration::from_millis(300),
        roll_call_queue_capacity: 16,
        result_cache_capacity: 0,
        consensus: ConsensusConfig {
            raft: RaftConfig {
                election_timeout: Duration::from_millis(400),
                heartbeat_interval: Duration::from_millis(50),
            },
            pbft: PbftConfig {
                view_change_timeout: Duration::from_millis(400),
                max_faulty_override: None,
            },
        },
        metrics_enabled: false,
        node_id_seed: None,
    }
}

fn make_node(role: Role, concurrency: usize, self_id: PeerId, hub: &Arc<NetworkHub>) -> Arc<Node> {
    Node::new(
        test_config(role, concurrency),
        self_id,
        hub.join(self_id),
        Arc::new(EchoExecutor),
        Arc::new(RecordingFunctionStore::default()),
    )
}

#[tokio::test]
async fn install_rejects_empty_inputs() {
    let node = make_node(Role::Worker, 4, PeerId::from_seed(1), &NetworkHub::new());

    let err = node.install(FunctionId::new(""), "https://example/fn").await.unwrap_err();
    assert!(matches!(err, NodeError::Validation(ValidationError::EmptyCid)));

    let err = node.install(FunctionId::new("cid"), "").await.unwrap_err();
    assert!(matches!(err, NodeError::Validation(ValidationError::EmptyUri)));
}

#[tokio::test]
async fn install_success_reaches_the_function_store() {
    let store = Arc::new(RecordingFunctionStore::default());
    let node = Node::new(
        test_config(Role::Worker, 4),
        PeerId::from_seed(1),
        NetworkHub::new().join(PeerId::from_seed(1)),
        Arc::new(EchoExecutor),
        Arc::clone(&store) as Arc<dyn b7s_node_data::ports::FunctionStore>,
    );

    node.install(FunctionId::new("Qm1"), "https://example/fn").await.unwrap();
    assert_eq!(store.installed(), vec![FunctionId::new("Qm1")]);
}

#[tokio::test]
async fn install_times_out_when_the_function_store_hangs() {
    let node = Node::new(
        test_config(Role::Worker, 4),
        PeerId::from_seed(1),
        NetworkHub::new().join(PeerId::from_seed(1)),
        Arc::new(EchoExecutor),
        Arc::new(HangingFunctionStore),
    );

    let err = node.install(FunctionId::new("Qm1"), "https://example/fn").await.unwrap_err();
    assert!(matches!(err, NodeError::Timeout(_)));
}

#[tokio::test]
async fn admission_bound_rejects_a_second_concurrent_execute() {
    let node = Node::new(
        test_config(Role::Worker, 1),
        PeerId::from_seed(1),
        NetworkHub::new().join(PeerId::from_seed(1)),
        Arc::new(SlowExecutor(Duration::from_millis(300))),
        Arc::new(RecordingFunctionStore::default()),
    );

    let first = {
        let node = Arc::clone(&node);
        tokio::spawn(async move { node.execute(ExecuteRequest::new(FunctionId::new("fn"), "main")).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let second = node.execute(ExecuteRequest::new(FunctionId::new("fn"), "main")).await;
    assert!(matches!(
        second,
        Err(NodeError::Admission(b7s_node::AdmissionError::Overloaded))
    ));

    let first = first.await.unwrap();
    assert!(first.is_ok());
}

#[tokio::test]
async fn join_cluster_twice_for_the_same_request_id_is_idempotent() {
    let hub = NetworkHub::new();
    let self_id = PeerId::from_seed(1);
    let node = make_node(Role::Worker, 4, self_id, &hub);

    let form = FormClusterRequest {
        request_id: b7s_node_data::ids::RequestId::new(),
        peers: vec![self_id],
        consensus: ConsensusKind::Raft,
        trace: None,
    };

    node.join_cluster(self_id, form.clone()).await.unwrap();
    node.join_cluster(self_id, form).await.unwrap();
}

#[tokio::test]
async fn leave_cluster_is_idempotent_and_second_call_reports_no_cluster() {
    let hub = NetworkHub::new();
    let self_id = PeerId::from_seed(1);
    let node = make_node(Role::Worker, 4, self_id, &hub);

    let request_id = b7s_node_data::ids::RequestId::new();
    let form = FormClusterRequest {
        request_id: request_id.clone(),
        peers: vec![self_id],
        consensus: ConsensusKind::Raft,
        trace: None,
    };
    node.join_cluster(self_id, form).await.unwrap();

    node.leave_cluster(&request_id, Duration::from_millis(100)).await.unwrap();

    let err = node
        .leave_cluster(&request_id, Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, NodeError::ClusterFormation(_)));
}

#[tokio::test]
async fn raft_cluster_round_trip_through_full_node_orchestration() {
    let hub = NetworkHub::new();

    let head_id = PeerId::from_seed(100);
    let worker_ids: Vec<PeerId> = (1..=3).map(PeerId::from_seed).collect();

    let head = make_node(Role::Head, 8, head_id, &hub);
    let workers: Vec<Arc<Node>> = worker_ids
        .iter()
        .map(|id| make_node(Role::Worker, 8, *id, &hub))
        .collect();

    tokio::spawn(Arc::clone(&head).run());
    for worker in &workers {
        tokio::spawn(Arc::clone(worker).run());
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut request = ExecuteRequest::new(FunctionId::new("Qm-raft"), "main");
    request.config.consensus = ConsensusKind::Raft;
    request.config.timeout = Duration::from_secs(2);

    let (_, code, results) =
        tokio::time::timeout(Duration::from_secs(3), head.execute(request))
            .await
            .expect("execute did not time out")
            .expect("raft round trip succeeds");

    assert_eq!(code, b7s_node_data::execute::ResultCode::Ok);
    assert!(!results.is_empty());
    for result in results.values() {
        assert_eq!(result.stdout, "main");
    }
}

#[tokio::test]
async fn pbft_cluster_round_trip_tolerates_the_configured_fault_count() {
    let hub = NetworkHub::new();

    let head_id = PeerId::from_seed(200);
    let worker_ids: Vec<PeerId> = (1..=4).map(PeerId::from_seed).collect();

    // Every member must sort as primary's own membership view, so the
    // lowest id always wins leadership regardless of roll-call response
    // order. Pick the highest id as the faulty replica: it can never be
    // the primary, matching the scenario's "faulty replica's post-
    // processors do not fire" (only the primary ever runs them).
    let mut sorted_workers = worker_ids.clone();
    sorted_workers.sort();
    let faulty_id = *sorted_workers.last().unwrap();

    let mut head_config = test_config(Role::Head, 8);
    head_config.consensus.pbft.max_faulty_override = Some(1);
    let head = Node::new(
        head_config,
        head_id,
        hub.join(head_id),
        Arc::new(EchoExecutor),
        Arc::new(RecordingFunctionStore::default()),
    );

    let mut workers = Vec::new();
    for id in &worker_ids {
        let mut cfg = test_config(Role::Worker, 8);
        cfg.consensus.pbft.max_faulty_override = Some(1);
        let network: Arc<dyn Network> = if *id == faulty_id {
            support::DropCommitNetwork::wrap(hub.join(*id))
        } else {
            hub.join(*id)
        };
        let node = Node::new(
            cfg,
            *id,
            network,
            Arc::new(EchoExecutor),
            Arc::new(RecordingFunctionStore::default()),
        );
        workers.push(node);
    }

    tokio::spawn(Arc::clone(&head).run());
    for worker in &workers {
        tokio::spawn(Arc::clone(worker).run());
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut request = ExecuteRequest::new(FunctionId::new("Qm-pbft"), "main");
    request.config.consensus = ConsensusKind::Pbft;
    request.config.timeout = Duration::from_secs(3);

    let (_, code, results) =
        tokio::time::timeout(Duration::from_secs(4), head.execute(request))
            .await
            .expect("execute did not time out")
            .expect("pbft round trip still commits with one replica withholding its commit vote");

    assert_eq!(code, b7s_node_data::execute::ResultCode::Ok);
    assert_eq!(
        results.len(),
        1,
        "only the primary's post-processor runs and reports to the origin"
    );
    let reporter = *results.keys().next().unwrap();
    assert_ne!(
        reporter, faulty_id,
        "the faulty (non-primary) replica must never be the one reporting the result"
    );
}
