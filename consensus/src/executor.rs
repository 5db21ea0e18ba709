// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use b7s_node_data::execute::{
    ConsensusKind, ExecuteRequest, NodeResult, ResultCode, ResultMap,
};
use b7s_node_data::ids::{PeerId, RequestId};

use crate::errors::{ConsensusError, ShutdownError};

/// Uniform contract over the two cluster variants. Object-safe so the
/// node's cluster registry can hold `Arc<dyn ConsensusExecutor>` regardless
/// of which variant backs a given request.
#[async_trait]
pub trait ConsensusExecutor: Send + Sync {
    fn kind(&self) -> ConsensusKind;

    /// May return immediately after enqueueing the request if execution is
    /// asynchronous (`Ok((ResultCode::Pending, None))`); the final outcome
    /// is then delivered through the registered post-processors, not this
    /// return value.
    async fn execute(
        &self,
        origin: PeerId,
        request_id: RequestId,
        timestamp: SystemTime,
        request: ExecuteRequest,
    ) -> Result<(ResultCode, Option<NodeResult>), ConsensusError>;

    /// Tears down background tasks and releases peer resources within
    /// `timeout`. Idempotent: a second call is a no-op that returns `Ok(())`.
    async fn shutdown(&self, timeout: Duration) -> Result<(), ShutdownError>;
}

/// Narrow capability handed to a `ConsensusExecutor` instance instead of the
/// whole `Node`, avoiding a back-reference cycle between the two crates:
/// the executor can cache a committed result without holding the registry,
/// the admission semaphore, or any other node-owned state.
pub trait ResultCache: Send + Sync {
    fn set(&self, request_id: &RequestId, result: ResultMap);
    fn evict(&self, request_id: &RequestId);
}

/// A callback invoked after a cluster commits a result. Represented as an
/// ordered list of capability values so a cluster can register both a
/// cache callback and a send-to-origin callback, or any number of
/// test/telemetry observers, without the clusters needing to know about
/// each other.
pub type PostProcessor = Arc<
    dyn Fn(&RequestId, &PeerId, &ExecuteRequest, &NodeResult) + Send + Sync,
>;

/// Runs every registered post-processor in order, isolating panics/failures
/// per callback so one observer's bug cannot break the commit path. Errors
/// produced inside a post-processor are logged and swallowed.
pub fn run_post_processors(
    processors: &[PostProcessor],
    request_id: &RequestId,
    origin: &PeerId,
    request: &ExecuteRequest,
    result: &NodeResult,
) {
    for processor in processors {
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(
            || processor(request_id, origin, request, result),
        ));
        if let Err(panic) = outcome {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(
                request_id = %request_id,
                "post-processor panicked: {msg}"
            );
        }
    }
}
