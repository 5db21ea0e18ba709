// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ids::{FunctionId, PeerId};

/// Wire encoding of the consensus kind. `0=none, 1=raft, 2=pbft`.
///
/// This encoding is load-bearing: it appears on the wire in `FormCluster`
/// messages and must never be renumbered when new kinds are added. Serde
/// (de)serializes it as the bare integer rather than the variant name.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConsensusKind {
    #[default]
    None = 0,
    Raft = 1,
    Pbft = 2,
}

impl Serialize for ConsensusKind {
    fn serialize<S: serde::Serializer>(
        &self,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        s.serialize_u8(self.to_wire())
    }
}

impl<'de> Deserialize<'de> for ConsensusKind {
    fn deserialize<D: serde::Deserializer<'de>>(
        d: D,
    ) -> Result<Self, D::Error> {
        let v = u8::deserialize(d)?;
        Self::from_wire(v).ok_or_else(|| {
            serde::de::Error::custom(format!("unknown consensus kind {v}"))
        })
    }
}

impl ConsensusKind {
    pub fn from_wire(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::None),
            1 => Some(Self::Raft),
            2 => Some(Self::Pbft),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        self as u8
    }

    pub fn is_consensus_required(self) -> bool {
        !matches!(self, Self::None)
    }
}

/// How per-peer results are folded into the response returned to the caller
/// of `Node::execute`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregationMode {
    /// Return every contributing peer's result, unmerged.
    #[default]
    All,
    /// Merge byte-identical outputs into a single `AggregatedResult`.
    Aggregate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteConfig {
    pub attributes_required: Vec<String>,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub aggregation: AggregationMode,
    pub consensus: ConsensusKind,
}

impl Default for ExecuteConfig {
    fn default() -> Self {
        Self {
            attributes_required: Vec::new(),
            timeout: Duration::from_secs(10),
            aggregation: AggregationMode::default(),
            consensus: ConsensusKind::default(),
        }
    }
}

/// An execute request, immutable once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub function_id: FunctionId,
    pub method: String,
    pub parameters: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub config: ExecuteConfig,
}

impl ExecuteRequest {
    pub fn new(function_id: FunctionId, method: impl Into<String>) -> Self {
        Self {
            function_id,
            method: method.into(),
            parameters: Vec::new(),
            env: BTreeMap::new(),
            config: ExecuteConfig::default(),
        }
    }
}

/// Result code returned in every `MsgExecuteResponse`/`MsgInstallFunctionResponse`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultCode {
    Ok,
    /// The consensus executor accepted the request but has not committed a
    /// result yet; the final outcome arrives asynchronously through the
    /// post-processor/wait-map path.
    Pending,
    Error,
}

impl Default for ResultCode {
    fn default() -> Self {
        Self::Pending
    }
}

/// Outcome of running a function on a single peer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeResult {
    pub code: ResultCode,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub metadata: Option<serde_json::Value>,
    pub peer: Option<PeerId>,
}

impl NodeResult {
    pub fn ok(peer: PeerId, stdout: impl Into<String>) -> Self {
        Self {
            code: ResultCode::Ok,
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
            metadata: None,
            peer: Some(peer),
        }
    }

    /// Two results are considered the same output for aggregation purposes
    /// when stdout, stderr and exit_code are byte-identical; metadata and
    /// peer identity are excluded from the comparison.
    fn output_matches(&self, other: &Self) -> bool {
        self.stdout == other.stdout
            && self.stderr == other.stderr
            && self.exit_code == other.exit_code
    }
}

/// Mapping from peer identity to that peer's `NodeResult`.
pub type ResultMap = BTreeMap<PeerId, NodeResult>;

/// A group of `NodeResult`s whose outputs are byte-identical.
#[derive(Debug, Clone)]
pub struct AggregatedResult {
    pub sample: NodeResult,
    pub count: usize,
    pub attesting_peers: Vec<PeerId>,
}

/// Groups a `ResultMap` into `AggregatedResult`s by byte-identical output.
pub fn aggregate(results: &ResultMap) -> Vec<AggregatedResult> {
    let mut groups: Vec<AggregatedResult> = Vec::new();

    for (peer, result) in results {
        if let Some(group) =
            groups.iter_mut().find(|g| g.sample.output_matches(result))
        {
            group.count += 1;
            group.attesting_peers.push(*peer);
        } else {
            groups.push(AggregatedResult {
                sample: result.clone(),
                count: 1,
                attesting_peers: vec![*peer],
            });
        }
    }

    groups
}
