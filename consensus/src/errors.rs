// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use thiserror::Error;

/// Replication or Byzantine-protocol failure. Surfaced to the caller of
/// `ConsensusExecutor::execute`/`shutdown`; never retried at this layer.
#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("cluster of size {size} cannot run pbft (need 3f+1 with f>=1, got f={f})")]
    ClusterTooSmall { size: usize, f: usize },

    #[error("no quorum reached for request {0}")]
    NoQuorum(String),

    #[error("view change exhausted after {0} attempts")]
    ViewChangeExhausted(usize),

    #[error("message authenticator invalid for peer {0}")]
    BadAuthenticator(String),

    #[error("raft election did not complete within the configured timeout")]
    ElectionTimedOut,

    #[error("operation was canceled")]
    Canceled,

    #[error("background task terminated unexpectedly: {0}")]
    TaskTerminated(String),
}

/// Cluster shutdown failed. Logged by the caller; the registry entry is
/// still deleted unless the error indicates the cluster is still live.
#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("shutdown timed out after {0:?}")]
    TimedOut(std::time::Duration),

    #[error("background task failed to join: {0}")]
    JoinFailed(String),

    #[error("cluster is still processing a commit and cannot be torn down yet")]
    StillLive,
}

impl ShutdownError {
    /// Whether the cluster must be considered still alive, i.e. the
    /// registry entry must *not* be deleted despite the shutdown error.
    pub fn cluster_still_live(&self) -> bool {
        matches!(self, ShutdownError::StillLive)
    }
}
