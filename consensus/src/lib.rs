// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

#![deny(unused_crate_dependencies)]
#![deny(unused_extern_crates)]

pub mod errors;
pub mod executor;
pub mod pbft;
pub mod raft;
pub mod transport;

/// `metrics` instrument names shared by both cluster variants.
pub const CONSENSUS_COMMITS_TOTAL: &str = "node_consensus_commits_total";
pub const CONSENSUS_VIEW_CHANGES_TOTAL: &str = "node_consensus_view_changes_total";

pub use errors::{ConsensusError, ShutdownError};
pub use executor::{run_post_processors, ConsensusExecutor, PostProcessor, ResultCache};
pub use pbft::{AlwaysValid, PbftCluster, Verifier};
pub use raft::RaftCluster;
pub use transport::{ClusterTransport, InMemoryClusterTransport};
