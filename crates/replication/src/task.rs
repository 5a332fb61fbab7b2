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

//! Replicated operations
//!
//! Every operation kind is one [`Task`] variant. Routing, quorum selection,
//! undo and fix construction are exhaustive matches over it, so adding a kind
//! forces every decision point to be revisited.

use crate::id::{RecordId, RequestId};
use crate::message::{Payload, RawRecord, RemoteError, TaskResult};
use bytes::Bytes;
use meridian_quorum::QuorumType;
use std::collections::BTreeSet;

/// Lane selection for a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionKey {
    /// One storage cluster
    Single(i32),

    /// Several storage clusters, executed behind a barrier on their lanes
    Many(Vec<i32>),

    /// Cluster-wide, executed alone behind a barrier on every lane
    All,
}

impl PartitionKey {
    fn from_clusters(clusters: impl IntoIterator<Item = i32>) -> Self {
        let clusters: BTreeSet<i32> = clusters.into_iter().collect();
        if clusters.is_empty() || clusters.iter().any(|cluster| *cluster < 0) {
            return PartitionKey::All;
        }
        let mut clusters: Vec<i32> = clusters.into_iter().collect();
        if clusters.len() == 1 {
            PartitionKey::Single(clusters.remove(0))
        } else {
            PartitionKey::Many(clusters)
        }
    }
}

/// How the final response is built from the collected ones
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStrategy {
    /// Representative of the winning group
    Any,

    /// Map of every node's payload
    Union,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    /// Create a record at the position the coordinator assigned
    CreateRecord { rid: RecordId, record: RawRecord },

    /// Overwrite a record; `record.version` is the version after the update
    UpdateRecord {
        rid: RecordId,
        record: RawRecord,
        previous: Option<RawRecord>,
    },

    /// Delete a record expected at `version`
    DeleteRecord {
        rid: RecordId,
        version: u32,
        previous: Option<RawRecord>,
    },

    ReadRecord { rid: RecordId },

    /// Ordered operations plus one undo task per operation
    Transaction { operations: Vec<Task>, undo: Vec<Task> },

    /// Second phase of a transaction: commit drops the undo, rollback applies it
    CompleteTransaction {
        transaction: RequestId,
        success: bool,
        fixes: Vec<Task>,
        partitions: Vec<i32>,
    },

    /// Recreate a record at the authoritative position, removing a misplaced copy
    FixCreateRecord {
        misplaced: Option<RecordId>,
        rid: RecordId,
        record: RawRecord,
    },

    /// Force a record to the given content and version
    FixUpdateRecord { rid: RecordId, record: RawRecord },

    /// Force a record away
    FixDeleteRecord { rid: RecordId },

    /// Bring a deleted record back, undo of a delete
    ResurrectRecord { rid: RecordId, record: RawRecord },

    /// Batched read used by the background repairer
    RepairRecords { rids: Vec<RecordId> },

    /// Schema-level, executed alone
    CreateCluster { name: String },

    /// Liveness check, answered by the server without touching a database
    Heartbeat,
}

impl Task {
    pub fn name(&self) -> &'static str {
        match self {
            Task::CreateRecord { .. } => "create_record",
            Task::UpdateRecord { .. } => "update_record",
            Task::DeleteRecord { .. } => "delete_record",
            Task::ReadRecord { .. } => "read_record",
            Task::Transaction { .. } => "transaction",
            Task::CompleteTransaction { .. } => "complete_transaction",
            Task::FixCreateRecord { .. } => "fix_create_record",
            Task::FixUpdateRecord { .. } => "fix_update_record",
            Task::FixDeleteRecord { .. } => "fix_delete_record",
            Task::ResurrectRecord { .. } => "resurrect_record",
            Task::RepairRecords { .. } => "repair_records",
            Task::CreateCluster { .. } => "create_cluster",
            Task::Heartbeat => "heartbeat",
        }
    }

    /// Record touched by a single-record task
    pub fn record_id(&self) -> Option<RecordId> {
        match self {
            Task::CreateRecord { rid, .. }
            | Task::UpdateRecord { rid, .. }
            | Task::DeleteRecord { rid, .. }
            | Task::ReadRecord { rid }
            | Task::FixCreateRecord { rid, .. }
            | Task::FixUpdateRecord { rid, .. }
            | Task::FixDeleteRecord { rid }
            | Task::ResurrectRecord { rid, .. } => Some(*rid),
            Task::Transaction { .. }
            | Task::CompleteTransaction { .. }
            | Task::RepairRecords { .. }
            | Task::CreateCluster { .. }
            | Task::Heartbeat => None,
        }
    }

    /// Storage clusters touched by the task
    pub fn partitions(&self) -> Vec<i32> {
        let clusters: BTreeSet<i32> = match self {
            Task::Transaction { operations, .. } => operations
                .iter()
                .filter_map(Task::record_id)
                .map(|rid| rid.cluster_id)
                .collect(),
            Task::CompleteTransaction { partitions, .. } => partitions.iter().copied().collect(),
            Task::RepairRecords { rids } => rids.iter().map(|rid| rid.cluster_id).collect(),
            Task::CreateCluster { .. } | Task::Heartbeat => BTreeSet::new(),
            single => single.record_id().map(|rid| rid.cluster_id).into_iter().collect(),
        };
        clusters.into_iter().collect()
    }

    pub fn partition_key(&self) -> PartitionKey {
        match self {
            Task::CreateCluster { .. } => PartitionKey::All,
            other => PartitionKey::from_clusters(other.partitions()),
        }
    }

    pub fn quorum_type(&self) -> QuorumType {
        match self {
            Task::ReadRecord { .. } => QuorumType::Read,
            Task::CreateRecord { .. }
            | Task::UpdateRecord { .. }
            | Task::DeleteRecord { .. }
            | Task::Transaction { .. } => QuorumType::Write,
            Task::CompleteTransaction { .. }
            | Task::FixCreateRecord { .. }
            | Task::FixUpdateRecord { .. }
            | Task::FixDeleteRecord { .. }
            | Task::ResurrectRecord { .. }
            | Task::RepairRecords { .. }
            | Task::Heartbeat => QuorumType::None,
            Task::CreateCluster { .. } => QuorumType::All,
        }
    }

    pub fn result_strategy(&self) -> ResultStrategy {
        match self {
            Task::RepairRecords { .. } => ResultStrategy::Union,
            _ => ResultStrategy::Any,
        }
    }

    /// Whether re-executing the task leaves the same state
    pub fn is_idempotent(&self) -> bool {
        match self {
            Task::ReadRecord { .. }
            | Task::RepairRecords { .. }
            | Task::CompleteTransaction { .. }
            | Task::FixCreateRecord { .. }
            | Task::FixUpdateRecord { .. }
            | Task::FixDeleteRecord { .. }
            | Task::ResurrectRecord { .. }
            | Task::Heartbeat => true,
            Task::CreateRecord { .. }
            | Task::UpdateRecord { .. }
            | Task::DeleteRecord { .. }
            | Task::Transaction { .. }
            | Task::CreateCluster { .. } => false,
        }
    }

    /// Task reverting the effect this task had on a node that answered `result`
    pub fn undo_task(&self, request_id: RequestId, result: &TaskResult) -> Option<Task> {
        match (self, result) {
            (Task::CreateRecord { .. }, TaskResult::Placeholder { rid, .. }) => Some(Task::FixDeleteRecord { rid: *rid }),
            (
                Task::UpdateRecord {
                    rid,
                    previous: Some(previous),
                    ..
                },
                TaskResult::Version(_),
            ) => Some(Task::FixUpdateRecord {
                rid: *rid,
                record: previous.clone(),
            }),
            (
                Task::DeleteRecord {
                    rid,
                    previous: Some(previous),
                    ..
                },
                TaskResult::Deleted(true),
            ) => Some(Task::ResurrectRecord {
                rid: *rid,
                record: previous.clone(),
            }),
            (Task::Transaction { .. }, TaskResult::Tx(_)) => Some(Task::CompleteTransaction {
                transaction: request_id,
                success: false,
                fixes: Vec::new(),
                partitions: self.partitions(),
            }),
            _ => None,
        }
    }

    /// Task aligning a node that answered `bad` with the winning `good` payload
    ///
    /// Returns `None` when the difference cannot be fixed in place, in which
    /// case the whole operation has to be undone.
    pub fn fix_task(&self, request_id: RequestId, bad: &Payload, good: &Payload) -> Option<Task> {
        let good = good.as_ref().ok()?;
        if matches!(bad, Err(RemoteError::RecordLocked { .. })) {
            return None;
        }

        match (self, good) {
            (Task::CreateRecord { record, .. }, TaskResult::Placeholder { rid, version }) => {
                let misplaced = match bad {
                    Ok(TaskResult::Placeholder { rid: placed, .. }) if placed != rid => Some(*placed),
                    _ => None,
                };
                Some(Task::FixCreateRecord {
                    misplaced,
                    rid: *rid,
                    record: RawRecord {
                        version: *version,
                        ..record.clone()
                    },
                })
            }
            (Task::UpdateRecord { rid, record, .. }, TaskResult::Version(version)) => Some(Task::FixUpdateRecord {
                rid: *rid,
                record: RawRecord {
                    version: *version,
                    ..record.clone()
                },
            }),
            (Task::DeleteRecord { rid, .. }, TaskResult::Deleted(_)) => Some(Task::FixDeleteRecord { rid: *rid }),
            (Task::ReadRecord { rid }, TaskResult::Record(Some(record))) => Some(Task::FixUpdateRecord {
                rid: *rid,
                record: record.clone(),
            }),
            (Task::ReadRecord { rid }, TaskResult::Record(None)) => Some(Task::FixDeleteRecord { rid: *rid }),
            (Task::Transaction { operations, .. }, TaskResult::Tx(results)) => {
                // a participant that failed makes the whole transaction roll back
                if bad.is_err() || operations.len() != results.len() {
                    return None;
                }
                // the bad node rolls back first, so every operation is re-applied
                let rolled_back: Payload = Err(RemoteError::Other("rolled back".to_string()));
                let fixes = operations
                    .iter()
                    .zip(results)
                    .map(|(operation, result)| operation.fix_task(request_id, &rolled_back, &Ok(result.clone())))
                    .collect::<Option<Vec<_>>>()?;
                Some(Task::CompleteTransaction {
                    transaction: request_id,
                    success: false,
                    fixes,
                    partitions: self.partitions(),
                })
            }
            _ => None,
        }
    }
}

/// Record operation as issued by a client, before the coordinator assigned
/// identities and versions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOperation {
    Create {
        cluster: String,
        content: Bytes,
        record_type: u8,
    },

    /// `version` is the version the caller last saw, `None` skips the check
    Update {
        rid: RecordId,
        content: Bytes,
        version: Option<u32>,
        record_type: u8,
    },

    Delete { rid: RecordId, version: Option<u32> },

    Read { rid: RecordId },
}

impl RecordOperation {
    pub fn name(&self) -> &'static str {
        match self {
            RecordOperation::Create { .. } => "create",
            RecordOperation::Update { .. } => "update",
            RecordOperation::Delete { .. } => "delete",
            RecordOperation::Read { .. } => "read",
        }
    }

    /// Existing record the operation works on; creates have none yet
    pub fn record_id(&self) -> Option<RecordId> {
        match self {
            RecordOperation::Create { .. } => None,
            RecordOperation::Update { rid, .. } | RecordOperation::Delete { rid, .. } | RecordOperation::Read { rid } => {
                Some(*rid)
            }
        }
    }

    pub fn is_write(&self) -> bool {
        !matches!(self, RecordOperation::Read { .. })
    }
}
