// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use thiserror::Error;

/// Malformed or missing request inputs. Returned immediately; never
/// retried, unlike the admission/cluster-formation/consensus error kinds
/// that live closer to the orchestrator.
#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    #[error("request id must not be empty")]
    EmptyRequestId,
    #[error("function cid must not be empty")]
    EmptyCid,
    #[error("manifest uri must not be empty")]
    EmptyUri,
    #[error("unknown consensus kind {0}")]
    UnknownConsensusKind(u8),
    #[error("cluster of size {0} cannot tolerate any faults under pbft (need >= 3f+1, f>=1)")]
    ClusterTooSmallForPbft(usize),
}
