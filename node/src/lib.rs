// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// The node orchestrator: cluster lifecycle, the wait-map correlation
// primitive, the roll-call admission queue, and the concurrency envelope
// tying a `b7s_node_data::ports::Network` and a consensus-executor variant
// from `b7s_consensus` into one process.

#![deny(unused_crate_dependencies)]
#![deny(unused_extern_crates)]

pub mod cluster_transport;
pub mod error;
pub mod metrics;
pub mod node;
pub mod registry;
pub mod roll_call;
pub mod subgroups;
pub mod wait_map;

pub use cluster_transport::NetworkClusterTransport;
pub use error::{AdmissionError, NodeError};
pub use node::Node;
pub use registry::ClusterRegistry;
pub use roll_call::{RollCallEntry, RollCallQueue};
pub use subgroups::WorkSubgroups;
pub use wait_map::WaitMap;
