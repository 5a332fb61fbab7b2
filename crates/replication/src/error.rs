// Copyright 2024 The Meridian Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Replication error types

use crate::id::{NodeId, RecordId, RequestId};
use crate::message::RemoteError;
use crate::storage::StorageError;
use crate::transport::TransportError;
use meridian_quorum::QuorumError;
use thiserror::Error;

/// Errors surfaced by replicated operations
#[derive(Debug, Error)]
pub enum ReplicationError {
    /// Another request owns the record; retry later
    #[error("Record {rid} is locked by request {owner:?}")]
    RecordLocked { rid: RecordId, owner: Option<RequestId> },

    #[error("Quorum {quorum} not reached for request {request}: {received} responses ({detail})")]
    QuorumNotReached {
        request: RequestId,
        quorum: usize,
        received: usize,
        detail: String,
    },

    #[error("Node {node} is unreachable")]
    NodeUnreachable { node: NodeId },

    /// Two equally large groups both reached the quorum
    #[error("Split brain on request {request}: {groups}")]
    SplitBrain { request: RequestId, groups: String },

    #[error("Node {node} cannot write cluster {cluster}, owned by {owner:?}")]
    NotMaster {
        node: NodeId,
        cluster: String,
        owner: Option<NodeId>,
    },

    #[error("No node available for database {database}")]
    NoNodesAvailable { database: String },

    #[error("Remote failure: {0}")]
    Remote(RemoteError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Quorum(#[from] QuorumError),

    #[error("Unknown database {0}")]
    UnknownDatabase(String),

    #[error("Unknown cluster {0}")]
    UnknownCluster(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Request canceled")]
    Canceled,

    #[error("Replication is shutting down")]
    ShuttingDown,
}

impl ReplicationError {
    /// Only lock conflicts clear up by themselves
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReplicationError::RecordLocked { .. })
    }

    /// Lift a remote failure into the local taxonomy
    pub fn from_remote(err: RemoteError) -> Self {
        match err {
            RemoteError::RecordLocked { rid, owner } => ReplicationError::RecordLocked { rid, owner },
            RemoteError::NotMaster { node, cluster } => ReplicationError::NotMaster {
                node,
                cluster,
                owner: None,
            },
            other => ReplicationError::Remote(other),
        }
    }
}

impl From<RemoteError> for ReplicationError {
    fn from(err: RemoteError) -> Self {
        Self::from_remote(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_lock_conflicts_retry() {
        let locked = ReplicationError::from_remote(RemoteError::RecordLocked {
            rid: RecordId::new(1, 1),
            owner: Some(RequestId::new(2, 3)),
        });
        assert!(locked.is_retryable());

        let missing = ReplicationError::from_remote(RemoteError::RecordNotFound(RecordId::new(1, 1)));
        assert!(!missing.is_retryable());
        assert!(matches!(missing, ReplicationError::Remote(_)));
        assert!(!ReplicationError::Canceled.is_retryable());
    }
}
