// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// The node's cluster registry: request-id -> consensus-executor instance,
// reader/writer locked, at most one record per request-id.

use std::collections::HashMap;
use std::sync::Arc;

use b7s_consensus::ConsensusExecutor;
use b7s_node_data::ids::RequestId;
use tokio::sync::RwLock;

use crate::error::NodeError;

#[derive(Default)]
pub struct ClusterRegistry {
    inner: RwLock<HashMap<RequestId, Arc<dyn ConsensusExecutor>>>,
}

impl ClusterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a new record. Fails if one already exists for `request_id`,
    /// preserving registry exclusivity: at most one cluster per request.
    pub async fn insert(
        &self,
        request_id: RequestId,
        executor: Arc<dyn ConsensusExecutor>,
    ) -> Result<(), NodeError> {
        let mut guard = self.inner.write().await;
        if guard.contains_key(&request_id) {
            return Err(NodeError::ClusterFormation(format!(
                "cluster already registered for request {request_id}"
            )));
        }
        guard.insert(request_id, executor);
        Ok(())
    }

    pub async fn get(&self, request_id: &RequestId) -> Option<Arc<dyn ConsensusExecutor>> {
        self.inner.read().await.get(request_id).cloned()
    }

    /// Only ever called after the cloned-out executor's `shutdown()` has
    /// already completed; never hold this lock across a `shutdown()` call.
    pub async fn remove(&self, request_id: &RequestId) -> Option<Arc<dyn ConsensusExecutor>> {
        self.inner.write().await.remove(request_id)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use b7s_consensus::{ConsensusError, ShutdownError};
    use b7s_node_data::execute::{ConsensusKind, ExecuteRequest, NodeResult, ResultCode};
    use b7s_node_data::ids::PeerId;
    use std::time::{Duration, SystemTime};

    struct NoopExecutor;

    #[async_trait]
    impl ConsensusExecutor for NoopExecutor {
        fn kind(&self) -> ConsensusKind {
            ConsensusKind::Raft
        }
        async fn execute(
            &self,
            _origin: PeerId,
            _request_id: RequestId,
            _timestamp: SystemTime,
            _request: ExecuteRequest,
        ) -> Result<(ResultCode, Option<NodeResult>), ConsensusError> {
            Ok((ResultCode::Ok, None))
        }
        async fn shutdown(&self, _timeout: Duration) -> Result<(), ShutdownError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn second_insert_for_the_same_request_id_is_rejected() {
        let registry = ClusterRegistry::new();
        let request_id = RequestId::new();
        registry
            .insert(request_id.clone(), Arc::new(NoopExecutor))
            .await
            .expect("first insert succeeds");

        let second = registry.insert(request_id, Arc::new(NoopExecutor)).await;
        assert!(matches!(second, Err(NodeError::ClusterFormation(_))));
    }

    #[tokio::test]
    async fn remove_returns_the_stored_executor_once() {
        let registry = ClusterRegistry::new();
        let request_id = RequestId::new();
        registry
            .insert(request_id.clone(), Arc::new(NoopExecutor))
            .await
            .unwrap();

        assert!(registry.remove(&request_id).await.is_some());
        assert!(registry.remove(&request_id).await.is_none());
    }
}
