// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default pubsub topic every node subscribes to regardless of `topics`.
pub const DEFAULT_TOPIC: &str = "b7s/default";

/// The role a node plays: Head accepts external work and dispatches it,
/// Worker joins clusters and executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Head,
    Worker,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    #[serde(with = "humantime_serde")]
    pub election_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(75),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PbftConfig {
    #[serde(with = "humantime_serde")]
    pub view_change_timeout: Duration,
    /// Overrides the `f` derived from cluster size; `None` uses `(n-1)/3`.
    pub max_faulty_override: Option<usize>,
}

impl Default for PbftConfig {
    fn default() -> Self {
        Self {
            view_change_timeout: Duration::from_millis(1500),
            max_faulty_override: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsensusConfig {
    pub raft: RaftConfig,
    pub pbft: PbftConfig,
}

/// Configuration options recognized by the core. Loading this from a file,
/// environment, or CLI flags is an external concern; the core only ever
/// consumes an already-populated `NodeConfig` value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub role: Role,
    pub concurrency: usize,
    pub topics: BTreeSet<String>,
    pub load_attributes: bool,
    pub workspace: std::path::PathBuf,
    #[serde(with = "humantime_serde")]
    pub execution_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub roll_call_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub cluster_formation_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub consensus_cluster_send_timeout: Duration,
    pub roll_call_queue_capacity: usize,
    pub result_cache_capacity: usize,
    pub consensus: ConsensusConfig,
    pub metrics_enabled: bool,
    /// Test-only determinism hook: when set, peer-id/consensus randomness
    /// in this process derives from this seed instead of OS entropy.
    pub node_id_seed: Option<u64>,
}

impl NodeConfig {
    /// Returns `topics` with the default topic implicitly included, so a
    /// node is always reachable on `DEFAULT_TOPIC` regardless of what the
    /// operator configured.
    pub fn effective_topics(&self) -> BTreeSet<String> {
        let mut topics = self.topics.clone();
        topics.insert(DEFAULT_TOPIC.to_string());
        topics
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            role: Role::Worker,
            concurrency: 8,
            topics: BTreeSet::new(),
            load_attributes: false,
            workspace: std::path::PathBuf::from("./workspace"),
            execution_timeout: Duration::from_secs(30),
            roll_call_timeout: Duration::from_secs(2),
            cluster_formation_timeout: Duration::from_secs(5),
            consensus_cluster_send_timeout: Duration::from_secs(3),
            roll_call_queue_capacity: 64,
            result_cache_capacity: 1024,
            consensus: ConsensusConfig::default(),
            metrics_enabled: true,
            node_id_seed: None,
        }
    }
}
