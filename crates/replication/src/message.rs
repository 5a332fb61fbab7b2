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

//! Request/response envelopes exchanged between nodes
//!
//! Remote failures travel inside the payload as [`RemoteError`] values, so
//! grouping equivalent responses is plain structural equality over
//! [`Payload`].

use crate::id::{NodeId, RecordId, RequestId};
use crate::task::Task;
use bytes::Bytes;
use meridian_quorum::QuorumType;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Record content with its version and type tag
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RawRecord {
    pub content: Bytes,
    pub version: u32,
    pub record_type: u8,
}

impl RawRecord {
    pub fn new(content: impl Into<Bytes>, version: u32, record_type: u8) -> Self {
        Self {
            content: content.into(),
            version,
            record_type,
        }
    }
}

/// Whether the sender waits for replies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Response,
    NoResponse,
}

/// Failure reported by a remote node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
pub enum RemoteError {
    #[error("Record {rid} is locked by request {owner:?}")]
    RecordLocked { rid: RecordId, owner: Option<RequestId> },

    #[error("Concurrent create in cluster {cluster_id}: expected position {expected}, found {actual}")]
    ConcurrentCreate { cluster_id: i32, expected: i64, actual: i64 },

    #[error("Concurrent modification of {rid}: expected version {expected}, found {actual}")]
    ConcurrentModification { rid: RecordId, expected: u32, actual: u32 },

    #[error("Record {0} not found")]
    RecordNotFound(RecordId),

    #[error("Node {node} is not a master for cluster {cluster}")]
    NotMaster { node: NodeId, cluster: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("{0}")]
    Other(String),
}

/// Successful outcome of a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskResult {
    /// Identity and version assigned to a created record
    Placeholder { rid: RecordId, version: u32 },

    /// New version of an updated record
    Version(u32),

    /// Whether a delete removed something
    Deleted(bool),

    /// Single record read
    Record(Option<RawRecord>),

    /// Batched read, positionally aligned with the requested ids
    Records(Vec<Option<RawRecord>>),

    /// Per-operation results of a transaction
    Tx(Vec<TaskResult>),

    /// Identifier of a created or existing cluster
    Cluster(i32),

    Ack,

    /// Every node's payload, for tasks using the union strategy
    Union(BTreeMap<NodeId, Payload>),
}

/// What a node answers for a task
pub type Payload = Result<TaskResult, RemoteError>;

/// Replicated request envelope
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub sender: NodeId,
    pub database: String,
    pub clusters: BTreeSet<String>,
    pub task: Task,
    pub execution_mode: ExecutionMode,
    pub quorum_type: QuorumType,
}

/// Reply of one node to one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub request_id: RequestId,
    pub executor: NodeId,
    pub sender: NodeId,
    pub payload: Payload,
}

impl Response {
    pub fn new(request_id: RequestId, executor: impl Into<NodeId>, payload: Payload) -> Self {
        let executor = executor.into();
        Self {
            request_id,
            sender: executor.clone(),
            executor,
            payload,
        }
    }
}
