// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use b7s_consensus::{ConsensusError, ShutdownError};
use b7s_node_data::error::ValidationError;
use thiserror::Error;

/// The admission semaphore or the roll-call queue is saturated. Surfaced to
/// the caller as a retryable "overloaded", never produced by a blocking
/// wait — both admission points use `try_acquire`/`try_push` so a saturated
/// node fails fast instead of queueing unbounded work.
#[derive(Debug, Clone, Copy, Error)]
pub enum AdmissionError {
    #[error("node is overloaded")]
    Overloaded,
}

/// The node's top-level error kinds. `ClusterFormation` additionally covers
/// "no cluster registered for this request-id" (join/leave/dispatch against
/// an absent or already-torn-down cluster): cluster lifecycle errors belong
/// together rather than inventing a separate not-found variant.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error("cluster formation failed: {0}")]
    ClusterFormation(String),

    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error("execution fault: {0}")]
    Execution(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Shutdown(#[from] ShutdownError),

    #[error("operation timed out: {0}")]
    Timeout(String),
}
