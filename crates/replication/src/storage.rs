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

//! Boundary to the physical storage engine

use crate::id::RecordId;
use crate::message::{RawRecord, RemoteError};
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("Record {0} not found")]
    RecordNotFound(RecordId),

    #[error("Version mismatch on {rid}: expected {expected}, found {actual}")]
    VersionMismatch { rid: RecordId, expected: u32, actual: u32 },

    #[error("Cluster {0} not found")]
    ClusterNotFound(String),

    #[error("Cluster {0} already exists")]
    ClusterExists(String),

    #[error("Storage engine error: {0}")]
    Engine(String),
}

impl From<StorageError> for RemoteError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::RecordNotFound(rid) => RemoteError::RecordNotFound(rid),
            StorageError::VersionMismatch { rid, expected, actual } => {
                RemoteError::ConcurrentModification { rid, expected, actual }
            }
            other => RemoteError::Storage(other.to_string()),
        }
    }
}

/// Record store of one database on one node
///
/// Positions inside a cluster are handed out sequentially and never reused:
/// deleting a record leaves a hole behind.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn read(&self, rid: RecordId) -> Result<Option<RawRecord>, StorageError>;

    /// Append a record to a cluster, returning its identity and first version
    async fn create(&self, cluster_id: i32, content: Bytes, record_type: u8) -> Result<(RecordId, u32), StorageError>;

    /// Overwrite a record, returning the new version
    async fn update(
        &self,
        rid: RecordId,
        content: Bytes,
        expected_version: Option<u32>,
        record_type: u8,
    ) -> Result<u32, StorageError>;

    /// Remove a record; returns false if it was already gone
    async fn delete(&self, rid: RecordId, expected_version: Option<u32>) -> Result<bool, StorageError>;

    /// Write content and version as given, at any position
    async fn put(&self, rid: RecordId, record: RawRecord) -> Result<(), StorageError>;

    /// Position the next create in the cluster will get
    async fn next_position(&self, cluster_id: i32) -> Result<i64, StorageError>;

    async fn cluster_name(&self, cluster_id: i32) -> Option<String>;

    async fn cluster_id(&self, name: &str) -> Option<i32>;

    async fn create_cluster(&self, name: &str) -> Result<i32, StorageError>;
}
