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

//! Task execution against the local storage
//!
//! Replica-side record tasks take the record lock for their duration and
//! fail with `RecordLocked` when another request owns it. Fix, undo and
//! repair tasks bypass the lock table: they must succeed while a conflicting
//! transaction is still parked on the record.

use crate::error::ReplicationError;
use crate::id::{NodeId, RecordId, RequestId};
use crate::lock_table::RecordLockTable;
use crate::message::{Payload, RawRecord, RemoteError, TaskResult};
use crate::storage::{Storage, StorageError};
use crate::task::{RecordOperation, Task};
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Parked state of a transaction between its two phases
#[derive(Debug, Clone)]
pub struct TxContext {
    pub request_id: RequestId,
    pub locks: Vec<RecordId>,
    /// Aligned with the operations; applied in reverse on rollback
    pub undo: Vec<Task>,
    pub started: Instant,
}

/// Coordinator-side execution of one client operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Performed {
    /// Task replicas have to execute to reach the same state
    pub task: Task,
    pub result: TaskResult,
    pub undo: Option<Task>,
}

pub struct TaskExecutor {
    node: NodeId,
    database: String,
    storage: Arc<dyn Storage>,
    locks: Arc<RecordLockTable>,
    transactions: DashMap<RequestId, TxContext>,
}

impl TaskExecutor {
    pub fn new(node: impl Into<NodeId>, database: impl Into<String>, storage: Arc<dyn Storage>) -> Self {
        Self {
            node: node.into(),
            database: database.into(),
            storage,
            locks: Arc::new(RecordLockTable::new()),
            transactions: DashMap::new(),
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn locks(&self) -> &Arc<RecordLockTable> {
        &self.locks
    }

    /// Execute a task received from a coordinator
    pub async fn execute(&self, request_id: RequestId, task: &Task) -> Payload {
        match task {
            Task::CreateRecord { rid, .. } | Task::UpdateRecord { rid, .. } | Task::DeleteRecord { rid, .. } => {
                self.execute_locked(request_id, *rid, task).await
            }
            Task::Transaction { operations, undo } => self.begin_transaction(request_id, operations, undo).await,
            Task::CompleteTransaction {
                transaction,
                success,
                fixes,
                ..
            } => {
                self.complete_transaction(*transaction, *success, fixes).await;
                Ok(TaskResult::Ack)
            }
            other => self.apply(other).await,
        }
    }

    async fn execute_locked(&self, request_id: RequestId, rid: RecordId, task: &Task) -> Payload {
        let held = self.locks.owner(rid) == Some(request_id);
        if !held && !self.locks.try_lock(rid, request_id) {
            debug!(request = %request_id, rid = %rid, "Record locked on replica");
            return Err(RemoteError::RecordLocked {
                rid,
                owner: self.locks.owner(rid),
            });
        }

        let result = self.apply(task).await;
        if !held {
            self.locks.unlock(rid, request_id);
        }
        result
    }

    /// Apply a task without touching the lock table
    pub async fn apply(&self, task: &Task) -> Payload {
        match task {
            Task::CreateRecord { rid, record } => self.create_at(*rid, record).await,
            Task::UpdateRecord { rid, record, .. } => {
                let version = self
                    .storage
                    .update(
                        *rid,
                        record.content.clone(),
                        Some(record.version.saturating_sub(1)),
                        record.record_type,
                    )
                    .await?;
                Ok(TaskResult::Version(version))
            }
            Task::DeleteRecord { rid, version, .. } => Ok(TaskResult::Deleted(self.storage.delete(*rid, Some(*version)).await?)),
            Task::ReadRecord { rid } => Ok(TaskResult::Record(self.storage.read(*rid).await?)),
            Task::FixCreateRecord { misplaced, rid, record } => {
                if let Some(misplaced) = misplaced {
                    self.storage.delete(*misplaced, None).await?;
                }
                if self.storage.next_position(rid.cluster_id).await? <= rid.position {
                    self.create_at(*rid, record).await?;
                    return Ok(TaskResult::Ack);
                }

                // only a hole or a copy no newer than the created record is replaced
                if let Some(existing) = self.storage.read(*rid).await?
                    && existing.version > record.version
                {
                    warn!(
                        node = %self.node,
                        rid = %rid,
                        existing = existing.version,
                        expected = record.version,
                        "Position holds a newer record, create fix refused"
                    );
                    return Err(RemoteError::ConcurrentModification {
                        rid: *rid,
                        expected: record.version,
                        actual: existing.version,
                    });
                }
                self.storage.put(*rid, record.clone()).await?;
                Ok(TaskResult::Ack)
            }
            Task::FixUpdateRecord { rid, record } | Task::ResurrectRecord { rid, record } => {
                self.storage.put(*rid, record.clone()).await?;
                Ok(TaskResult::Ack)
            }
            Task::FixDeleteRecord { rid } => {
                self.storage.delete(*rid, None).await?;
                Ok(TaskResult::Ack)
            }
            Task::RepairRecords { rids } => {
                let mut records = Vec::with_capacity(rids.len());
                for rid in rids {
                    records.push(self.storage.read(*rid).await?);
                }
                Ok(TaskResult::Records(records))
            }
            Task::CreateCluster { name } => {
                if let Some(id) = self.storage.cluster_id(name).await {
                    return Ok(TaskResult::Cluster(id));
                }
                Ok(TaskResult::Cluster(self.storage.create_cluster(name).await?))
            }
            Task::Heartbeat => Ok(TaskResult::Ack),
            Task::Transaction { .. } | Task::CompleteTransaction { .. } => {
                Err(RemoteError::Other(format!("{} cannot be nested", task.name())))
            }
        }
    }

    /// Place a record exactly at `rid`, closing any gap before it
    async fn create_at(&self, rid: RecordId, record: &RawRecord) -> Payload {
        let mut next = self.storage.next_position(rid.cluster_id).await?;
        if next > rid.position {
            return Err(RemoteError::ConcurrentCreate {
                cluster_id: rid.cluster_id,
                expected: rid.position,
                actual: next,
            });
        }

        while next < rid.position {
            let (hole, _) = self
                .storage
                .create(rid.cluster_id, Bytes::new(), record.record_type)
                .await?;
            self.storage.delete(hole, None).await?;
            next = hole.position + 1;
        }

        self.storage.put(rid, record.clone()).await?;
        Ok(TaskResult::Placeholder {
            rid,
            version: record.version,
        })
    }

    async fn begin_transaction(&self, request_id: RequestId, operations: &[Task], undo: &[Task]) -> Payload {
        let mut locked = Vec::new();
        for rid in operations.iter().filter_map(Task::record_id) {
            if !self.locks.try_lock(rid, request_id) {
                let owner = self.locks.owner(rid);
                self.locks.release_all(request_id);
                debug!(request = %request_id, rid = %rid, "Transaction record locked on replica");
                return Err(RemoteError::RecordLocked { rid, owner });
            }
            locked.push(rid);
        }

        let mut results = Vec::with_capacity(operations.len());
        for (index, operation) in operations.iter().enumerate() {
            match self.apply(operation).await {
                Ok(result) => results.push(result),
                Err(err) => {
                    warn!(request = %request_id, operation = index, error = %err, "Transaction operation failed, undoing prefix");
                    let prefix: Vec<Task> = undo.iter().take(index).rev().cloned().collect();
                    self.apply_undo(request_id, &prefix).await;
                    self.locks.release_all(request_id);
                    return Err(err);
                }
            }
        }

        self.transactions.insert(
            request_id,
            TxContext {
                request_id,
                locks: locked,
                undo: undo.to_vec(),
                started: Instant::now(),
            },
        );
        Ok(TaskResult::Tx(results))
    }

    /// Finish a parked transaction; returns false when no context was found
    pub async fn complete_transaction(&self, transaction: RequestId, success: bool, fixes: &[Task]) -> bool {
        let context = self.take_context(transaction);
        let found = context.is_some();

        if let Some(context) = context
            && !success
        {
            let undo: Vec<Task> = context.undo.into_iter().rev().collect();
            self.apply_undo(transaction, &undo).await;
        }
        self.locks.release_all(transaction);

        for fix in fixes {
            if let Err(err) = self.apply(fix).await {
                error!(request = %transaction, task = fix.name(), error = %err, "Failed to apply transaction fix");
            }
        }

        debug!(request = %transaction, success, found, fixes = fixes.len(), "Transaction completed");
        found
    }

    /// Apply undo tasks in the given order, logging failures
    pub async fn apply_undo(&self, request_id: RequestId, undo: &[Task]) {
        for task in undo {
            if let Err(err) = self.apply(task).await {
                error!(
                    node = %self.node,
                    request = %request_id,
                    task = task.name(),
                    error = %err,
                    "Undo failed, record may need repair"
                );
            }
        }
    }

    pub fn register(&self, context: TxContext) {
        self.transactions.insert(context.request_id, context);
    }

    pub fn take_context(&self, request_id: RequestId) -> Option<TxContext> {
        self.transactions.remove(&request_id).map(|(_, context)| context)
    }

    pub fn has_context(&self, request_id: RequestId) -> bool {
        self.transactions.contains_key(&request_id)
    }

    pub fn pending_transactions(&self) -> usize {
        self.transactions.len()
    }

    async fn rollback_where(&self, reason: &str, predicate: impl Fn(&TxContext) -> bool) -> usize {
        let victims: Vec<RequestId> = self
            .transactions
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| *entry.key())
            .collect();

        let mut rolled_back = 0;
        for request_id in victims {
            if self.complete_transaction(request_id, false, &[]).await {
                rolled_back += 1;
                info!(node = %self.node, database = %self.database, request = %request_id, reason, "Transaction rolled back");
            }
        }
        rolled_back
    }

    /// Roll back transactions started by a node that went away
    pub async fn rollback_from(&self, node_index: u32) -> usize {
        self.rollback_where("coordinator unreachable", |context| context.request_id.node == node_index)
            .await
    }

    /// Roll back transactions parked for longer than `max_age`
    pub async fn expire(&self, max_age: Duration) -> usize {
        self.rollback_where("expired", |context| context.started.elapsed() >= max_age)
            .await
    }

    pub async fn rollback_all(&self) -> usize {
        self.rollback_where("shutdown", |_| true).await
    }

    /// Run a client operation on the coordinator
    ///
    /// Creates get their position from the local storage; the returned task
    /// carries it to the replicas.
    pub async fn perform(&self, operation: &RecordOperation) -> Result<Performed, ReplicationError> {
        match operation {
            RecordOperation::Create {
                cluster,
                content,
                record_type,
            } => {
                let cluster_id = self
                    .storage
                    .cluster_id(cluster)
                    .await
                    .ok_or_else(|| ReplicationError::UnknownCluster(cluster.clone()))?;
                let (rid, version) = self.storage.create(cluster_id, content.clone(), *record_type).await?;
                Ok(Performed {
                    task: Task::CreateRecord {
                        rid,
                        record: RawRecord::new(content.clone(), version, *record_type),
                    },
                    result: TaskResult::Placeholder { rid, version },
                    undo: Some(Task::FixDeleteRecord { rid }),
                })
            }
            RecordOperation::Update {
                rid,
                content,
                version,
                record_type,
            } => {
                let previous = self
                    .storage
                    .read(*rid)
                    .await?
                    .ok_or(StorageError::RecordNotFound(*rid))?;
                let new_version = self.storage.update(*rid, content.clone(), *version, *record_type).await?;
                Ok(Performed {
                    task: Task::UpdateRecord {
                        rid: *rid,
                        record: RawRecord::new(content.clone(), new_version, *record_type),
                        previous: Some(previous.clone()),
                    },
                    result: TaskResult::Version(new_version),
                    undo: Some(Task::FixUpdateRecord {
                        rid: *rid,
                        record: previous,
                    }),
                })
            }
            RecordOperation::Delete { rid, version } => {
                let previous = self.storage.read(*rid).await?;
                let deleted = self.storage.delete(*rid, *version).await?;
                let expected = version.or(previous.as_ref().map(|record| record.version)).unwrap_or(0);
                Ok(Performed {
                    task: Task::DeleteRecord {
                        rid: *rid,
                        version: expected,
                        previous: previous.clone(),
                    },
                    result: TaskResult::Deleted(deleted),
                    undo: previous
                        .filter(|_| deleted)
                        .map(|record| Task::ResurrectRecord { rid: *rid, record }),
                })
            }
            RecordOperation::Read { rid } => Ok(Performed {
                task: Task::ReadRecord { rid: *rid },
                result: TaskResult::Record(self.storage.read(*rid).await?),
                undo: None,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStorage;

    fn executor() -> (TaskExecutor, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::with_clusters(&["person", "audit"]));
        (TaskExecutor::new("node2", "db", storage.clone()), storage)
    }

    fn record(content: &'static str, version: u32) -> RawRecord {
        RawRecord::new(content, version, b'd')
    }

    #[tokio::test]
    async fn test_create_closes_gaps() {
        let (executor, storage) = executor();
        let rid = RecordId::new(0, 3);

        let result = executor
            .execute(RequestId::new(1, 1), &Task::CreateRecord { rid, record: record("a", 1) })
            .await;
        assert_eq!(result, Ok(TaskResult::Placeholder { rid, version: 1 }));

        let records = storage.records(0);
        assert_eq!(records, vec![(rid, record("a", 1))]);
        assert_eq!(storage.next_position(0).await.unwrap(), 4);
        assert!(executor.locks().is_empty());
    }

    #[tokio::test]
    async fn test_create_behind_next_position_conflicts() {
        let (executor, storage) = executor();
        storage.create(0, Bytes::from_static(b"x"), b'd').await.unwrap();
        storage.create(0, Bytes::from_static(b"y"), b'd').await.unwrap();

        let result = executor
            .execute(
                RequestId::new(1, 1),
                &Task::CreateRecord {
                    rid: RecordId::new(0, 1),
                    record: record("a", 1),
                },
            )
            .await;
        assert_eq!(
            result,
            Err(RemoteError::ConcurrentCreate {
                cluster_id: 0,
                expected: 1,
                actual: 2
            })
        );
    }

    #[tokio::test]
    async fn test_create_fix_fills_hole_but_keeps_newer_record() {
        let (executor, storage) = executor();
        let hole = RecordId::new(0, 0);
        let updated = RecordId::new(0, 1);
        storage.put(updated, record("live", 3)).await.unwrap();

        let filled = executor
            .execute(
                RequestId::new(1, 1),
                &Task::FixCreateRecord {
                    misplaced: None,
                    rid: hole,
                    record: record("winner", 1),
                },
            )
            .await;
        assert_eq!(filled, Ok(TaskResult::Ack));
        assert_eq!(storage.read(hole).await.unwrap(), Some(record("winner", 1)));

        let refused = executor
            .execute(
                RequestId::new(1, 2),
                &Task::FixCreateRecord {
                    misplaced: None,
                    rid: updated,
                    record: record("winner", 1),
                },
            )
            .await;
        assert_eq!(
            refused,
            Err(RemoteError::ConcurrentModification {
                rid: updated,
                expected: 1,
                actual: 3
            })
        );
        assert_eq!(storage.read(updated).await.unwrap(), Some(record("live", 3)));
    }

    #[tokio::test]
    async fn test_locked_record_is_reported() {
        let (executor, storage) = executor();
        let (rid, _) = storage.create(0, Bytes::from_static(b"x"), b'd').await.unwrap();
        let owner = RequestId::new(3, 1);
        executor.locks().try_lock(rid, owner);

        let result = executor
            .execute(
                RequestId::new(1, 2),
                &Task::UpdateRecord {
                    rid,
                    record: record("new", 2),
                    previous: None,
                },
            )
            .await;
        assert_eq!(result, Err(RemoteError::RecordLocked { rid, owner: Some(owner) }));

        // fixes ignore the lock
        let fix = executor
            .execute(
                RequestId::new(1, 3),
                &Task::FixUpdateRecord {
                    rid,
                    record: record("fixed", 7),
                },
            )
            .await;
        assert_eq!(fix, Ok(TaskResult::Ack));
        assert_eq!(storage.read(rid).await.unwrap(), Some(record("fixed", 7)));
    }

    #[tokio::test]
    async fn test_update_version_mismatch_is_concurrent_modification() {
        let (executor, storage) = executor();
        let (rid, _) = storage.create(0, Bytes::from_static(b"x"), b'd').await.unwrap();

        let result = executor
            .execute(
                RequestId::new(1, 1),
                &Task::UpdateRecord {
                    rid,
                    record: record("new", 5),
                    previous: None,
                },
            )
            .await;
        assert!(matches!(result, Err(RemoteError::ConcurrentModification { expected: 4, actual: 1, .. })));
    }

    #[tokio::test]
    async fn test_transaction_prefix_undone_on_failure() {
        let (executor, storage) = executor();
        let (first, _) = storage.create(0, Bytes::from_static(b"one"), b'd').await.unwrap();
        let missing = RecordId::new(0, 42);
        let request = RequestId::new(1, 9);

        let result = executor
            .execute(
                request,
                &Task::Transaction {
                    operations: vec![
                        Task::UpdateRecord {
                            rid: first,
                            record: record("changed", 2),
                            previous: Some(record("one", 1)),
                        },
                        Task::UpdateRecord {
                            rid: missing,
                            record: record("nope", 2),
                            previous: None,
                        },
                    ],
                    undo: vec![
                        Task::FixUpdateRecord {
                            rid: first,
                            record: record("one", 1),
                        },
                        Task::FixDeleteRecord { rid: missing },
                    ],
                },
            )
            .await;

        assert_eq!(result, Err(RemoteError::RecordNotFound(missing)));
        assert_eq!(storage.read(first).await.unwrap(), Some(record("one", 1)));
        assert!(executor.locks().is_empty());
        assert!(!executor.has_context(request));
    }

    #[tokio::test]
    async fn test_transaction_rollback_applies_undo() {
        let (executor, storage) = executor();
        let (rid, _) = storage.create(0, Bytes::from_static(b"one"), b'd').await.unwrap();
        let request = RequestId::new(1, 4);

        let result = executor
            .execute(
                request,
                &Task::Transaction {
                    operations: vec![Task::UpdateRecord {
                        rid,
                        record: record("two", 2),
                        previous: Some(record("one", 1)),
                    }],
                    undo: vec![Task::FixUpdateRecord {
                        rid,
                        record: record("one", 1),
                    }],
                },
            )
            .await;
        assert_eq!(result, Ok(TaskResult::Tx(vec![TaskResult::Version(2)])));
        assert_eq!(executor.locks().owner(rid), Some(request));
        assert!(executor.has_context(request));

        let other = executor
            .execute(RequestId::new(2, 1), &Task::DeleteRecord { rid, version: 2, previous: None })
            .await;
        assert!(matches!(other, Err(RemoteError::RecordLocked { .. })));

        assert_eq!(executor.rollback_from(1).await, 1);
        assert_eq!(storage.read(rid).await.unwrap(), Some(record("one", 1)));
        assert!(executor.locks().is_empty());
        assert_eq!(executor.rollback_from(1).await, 0);
    }

    #[tokio::test]
    async fn test_complete_with_fixes() {
        let (executor, storage) = executor();
        let rid = RecordId::new(1, 0);

        let done = executor
            .execute(
                RequestId::new(1, 1),
                &Task::CompleteTransaction {
                    transaction: RequestId::new(1, 1),
                    success: false,
                    fixes: vec![Task::FixCreateRecord {
                        misplaced: None,
                        rid,
                        record: record("fresh", 1),
                    }],
                    partitions: vec![1],
                },
            )
            .await;
        assert_eq!(done, Ok(TaskResult::Ack));
        assert_eq!(storage.read(rid).await.unwrap(), Some(record("fresh", 1)));
    }

    #[tokio::test]
    async fn test_create_cluster_is_idempotent() {
        let (executor, _) = executor();
        let task = Task::CreateCluster { name: "orders".into() };

        let first = executor.execute(RequestId::new(1, 1), &task).await;
        let second = executor.execute(RequestId::new(1, 2), &task).await;
        assert_eq!(first, Ok(TaskResult::Cluster(2)));
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_perform_builds_replica_tasks() {
        let (executor, _) = executor();

        let created = executor
            .perform(&RecordOperation::Create {
                cluster: "person".into(),
                content: Bytes::from_static(b"alice"),
                record_type: b'd',
            })
            .await
            .unwrap();
        let rid = RecordId::new(0, 0);
        assert_eq!(created.result, TaskResult::Placeholder { rid, version: 1 });
        assert_eq!(created.undo, Some(Task::FixDeleteRecord { rid }));

        let updated = executor
            .perform(&RecordOperation::Update {
                rid,
                content: Bytes::from_static(b"bob"),
                version: Some(1),
                record_type: b'd',
            })
            .await
            .unwrap();
        assert_eq!(updated.result, TaskResult::Version(2));
        assert!(matches!(updated.task, Task::UpdateRecord { ref record, .. } if record.version == 2));

        let deleted = executor
            .perform(&RecordOperation::Delete { rid, version: None })
            .await
            .unwrap();
        assert_eq!(deleted.result, TaskResult::Deleted(true));
        assert!(matches!(deleted.task, Task::DeleteRecord { version: 2, .. }));
        assert!(matches!(deleted.undo, Some(Task::ResurrectRecord { .. })));

        let err = executor
            .perform(&RecordOperation::Create {
                cluster: "missing".into(),
                content: Bytes::new(),
                record_type: b'd',
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::UnknownCluster(_)));
    }
}
