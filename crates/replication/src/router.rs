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

//! Client entry point for single-record operations
//!
//! A write runs locally first under the record lock, then replicates the
//! resulting task with the local result counted as one response. When
//! replication fails the local change is undone before the error surfaces.
//!
//! Creates hold the database gate exclusively so that positions are handed
//! out in the same order on every node; everything else shares it.

use crate::async_queue::{CompletionCallback, GateGuard, ReleaseGuard, ReplicationHandle};
use crate::context::OutboundRequest;
use crate::database::DistributedDatabase;
use crate::error::ReplicationError;
use crate::executor::Performed;
use crate::id::{NodeId, RecordId, RequestId};
use crate::lock_table::LockGuard;
use crate::message::{Payload, RawRecord, RemoteError, TaskResult};
use crate::task::{RecordOperation, Task};
use bytes::Bytes;
use futures::future::BoxFuture;
use meridian_quorum::QuorumType;
use meridian_topology::{DatabaseConfig, ReplicationMode};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordVersion {
    pub rid: RecordId,
    pub version: u32,
}

/// Result of a routed operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationResult {
    Created(RecordVersion),
    Updated(RecordVersion),
    Deleted(bool),
    Read(Option<RawRecord>),
}

impl OperationResult {
    /// Project a task result onto the operation that produced it
    pub(crate) fn from_task(task: &Task, result: TaskResult) -> Result<Self, ReplicationError> {
        match (task, result) {
            (Task::CreateRecord { .. }, TaskResult::Placeholder { rid, version }) => {
                Ok(OperationResult::Created(RecordVersion { rid, version }))
            }
            (Task::UpdateRecord { rid, .. }, TaskResult::Version(version)) => {
                Ok(OperationResult::Updated(RecordVersion { rid: *rid, version }))
            }
            (Task::DeleteRecord { .. }, TaskResult::Deleted(deleted)) => Ok(OperationResult::Deleted(deleted)),
            (Task::ReadRecord { .. }, TaskResult::Record(record)) => Ok(OperationResult::Read(record)),
            (task, result) => Err(ReplicationError::Remote(RemoteError::Other(format!(
                "unexpected {} result: {result:?}",
                task.name()
            )))),
        }
    }
}

/// Sync operations finish here; async ones hand back a handle
pub enum Completion {
    Done(OperationResult),
    Pending(ReplicationHandle<OperationResult>),
}

/// Local half of a write, holding its locks until replication is over
struct Prepared {
    request_id: RequestId,
    cluster: String,
    targets: BTreeSet<NodeId>,
    performed: Performed,
    guard: ReleaseGuard,
}

/// Smallest and largest create position among the replies, when they differ
pub fn position_gap(responses: &BTreeMap<NodeId, Payload>) -> Option<(i64, i64)> {
    let positions = responses.values().filter_map(|payload| match payload {
        Ok(TaskResult::Placeholder { rid, .. }) => Some(rid.position),
        _ => None,
    });
    let (low, high) = positions.fold((i64::MAX, i64::MIN), |(low, high), position| {
        (low.min(position), high.max(position))
    });
    (low < high).then_some((low, high))
}

#[derive(Clone)]
pub struct OperationRouter {
    database: Arc<DistributedDatabase>,
}

impl OperationRouter {
    pub fn new(database: Arc<DistributedDatabase>) -> Self {
        Self { database }
    }

    pub async fn create_record(
        &self,
        cluster: &str,
        content: impl Into<Bytes>,
        record_type: u8,
    ) -> Result<RecordVersion, ReplicationError> {
        let operation = RecordOperation::Create {
            cluster: cluster.to_string(),
            content: content.into(),
            record_type,
        };
        match self.execute_sync(operation).await? {
            OperationResult::Created(created) => Ok(created),
            other => Err(unexpected("create", &other)),
        }
    }

    /// Update a record; `version` is the version the caller last saw
    pub async fn update_record(
        &self,
        rid: RecordId,
        content: impl Into<Bytes>,
        version: Option<u32>,
        record_type: u8,
    ) -> Result<RecordVersion, ReplicationError> {
        let operation = RecordOperation::Update {
            rid,
            content: content.into(),
            version,
            record_type,
        };
        match self.execute_sync(operation).await? {
            OperationResult::Updated(updated) => Ok(updated),
            other => Err(unexpected("update", &other)),
        }
    }

    pub async fn delete_record(&self, rid: RecordId, version: Option<u32>) -> Result<bool, ReplicationError> {
        match self.execute_sync(RecordOperation::Delete { rid, version }).await? {
            OperationResult::Deleted(deleted) => Ok(deleted),
            other => Err(unexpected("delete", &other)),
        }
    }

    /// Read locally when the read quorum allows it, else from a quorum of replicas
    pub async fn read_record(&self, rid: RecordId) -> Result<Option<RawRecord>, ReplicationError> {
        let database = &self.database;
        let context = database.context();
        let executor = database.executor();

        let config = context.database_config(database.name()).await?;
        let cluster = self.cluster_name(rid).await?;
        let clusters = BTreeSet::from([cluster.clone()]);
        let quorum = context
            .quorum_for(&config, database.name(), &clusters, QuorumType::Read)
            .await?;

        let local = executor.storage().read(rid).await?;
        if quorum <= 1 {
            return Ok(local);
        }

        let task = Task::ReadRecord { rid };
        let replicated = context
            .send_request(
                OutboundRequest::new(database.name(), task.clone())
                    .clusters(clusters)
                    .targets(config.servers_for_clusters([&cluster]))
                    .local_result(Ok(TaskResult::Record(local.clone())), Arc::clone(executor)),
            )
            .await?;

        match replicated.response.map(|response| response.payload) {
            Some(Ok(TaskResult::Record(record))) => Ok(record),
            Some(Ok(other)) => Err(unexpected("read", &other)),
            Some(Err(err)) => Err(ReplicationError::from_remote(err)),
            None => Ok(local),
        }
    }

    pub async fn create_record_async(
        &self,
        cluster: &str,
        content: impl Into<Bytes>,
        record_type: u8,
        callback: Option<CompletionCallback<OperationResult>>,
    ) -> ReplicationHandle<OperationResult> {
        let operation = RecordOperation::Create {
            cluster: cluster.to_string(),
            content: content.into(),
            record_type,
        };
        self.execute_async(operation, callback).await
    }

    pub async fn update_record_async(
        &self,
        rid: RecordId,
        content: impl Into<Bytes>,
        version: Option<u32>,
        record_type: u8,
        callback: Option<CompletionCallback<OperationResult>>,
    ) -> ReplicationHandle<OperationResult> {
        let operation = RecordOperation::Update {
            rid,
            content: content.into(),
            version,
            record_type,
        };
        self.execute_async(operation, callback).await
    }

    pub async fn delete_record_async(
        &self,
        rid: RecordId,
        version: Option<u32>,
        callback: Option<CompletionCallback<OperationResult>>,
    ) -> ReplicationHandle<OperationResult> {
        self.execute_async(RecordOperation::Delete { rid, version }, callback)
            .await
    }

    /// Run an operation in the database's configured replication mode
    pub async fn execute(&self, operation: RecordOperation) -> Result<Completion, ReplicationError> {
        let config = self.database.context().database_config(self.database.name()).await?;
        if operation.is_write() && config.execution_mode == ReplicationMode::Asynchronous {
            return Ok(Completion::Pending(self.execute_async(operation, None).await));
        }
        Ok(Completion::Done(self.execute_sync(operation).await?))
    }

    #[instrument(skip_all, fields(database = %self.database.name(), operation = operation.name()))]
    pub async fn execute_sync(&self, operation: RecordOperation) -> Result<OperationResult, ReplicationError> {
        if let RecordOperation::Read { rid } = operation {
            return Ok(OperationResult::Read(self.read_record(rid).await?));
        }
        let prepared = self.prepare(&operation).await?;
        self.replicate(prepared).await
    }

    /// Apply locally now, replicate on the background queue
    ///
    /// A local failure resolves the handle immediately. The record locks
    /// and the gate stay held until the replication job is over.
    #[instrument(skip_all, fields(database = %self.database.name(), operation = operation.name()))]
    pub async fn execute_async(
        &self,
        operation: RecordOperation,
        callback: Option<CompletionCallback<OperationResult>>,
    ) -> ReplicationHandle<OperationResult> {
        if let RecordOperation::Read { rid } = operation {
            let result = self.read_record(rid).await.map(OperationResult::Read);
            return resolved(result, callback);
        }

        let prepared = match self.prepare(&operation).await {
            Ok(prepared) => prepared,
            Err(err) => return resolved(Err(err), callback),
        };

        let request_id = prepared.request_id;
        let undo = prepared.performed.undo.clone();
        let executor = Arc::clone(self.database.executor());
        let abandon: BoxFuture<'static, ()> = Box::pin(async move {
            if let Some(undo) = undo {
                warn!(request = %request_id, task = undo.name(), "Replication abandoned, undoing local change");
                executor.apply_undo(request_id, std::slice::from_ref(&undo)).await;
            }
        });

        let router = self.clone();
        self.database
            .replicator()
            .submit_with_abandon(async move { router.replicate(prepared).await }, abandon, callback)
            .await
    }

    async fn prepare(&self, operation: &RecordOperation) -> Result<Prepared, ReplicationError> {
        let database = &self.database;
        let context = database.context();
        let executor = database.executor();
        let settings = context.config();

        let config = context.database_config(database.name()).await?;
        let cluster = match operation {
            RecordOperation::Create { cluster, .. } => cluster.clone(),
            other => match other.record_id() {
                Some(rid) => self.cluster_name(rid).await?,
                None => return Err(ReplicationError::Configuration("operation without record".to_string())),
            },
        };
        self.check_master(&config, &cluster, operation).await?;

        let request_id = context.next_request_id();
        let gate = match operation {
            RecordOperation::Create { .. } => GateGuard::Exclusive(Arc::clone(database.gate()).write_owned().await),
            _ => GateGuard::Shared(Arc::clone(database.gate()).read_owned().await),
        };
        let locks = LockGuard::new(Arc::clone(executor.locks()), request_id);
        if let Some(rid) = operation.record_id() {
            executor
                .locks()
                .lock_with_retry(rid, request_id, settings.lock_retries, settings.lock_retry_delay())
                .await?;
        }

        let performed = executor.perform(operation).await?;
        if let Task::CreateRecord { rid, .. } = &performed.task
            && !executor.locks().try_lock(*rid, request_id)
        {
            let rid = *rid;
            let owner = executor.locks().owner(rid);
            warn!(request = %request_id, rid = %rid, owner = ?owner, "New record position already locked, undoing create");
            if let Some(undo) = &performed.undo {
                executor.apply_undo(request_id, std::slice::from_ref(undo)).await;
            }
            return Err(ReplicationError::RecordLocked { rid, owner });
        }
        debug!(request = %request_id, task = performed.task.name(), cluster = %cluster, "Applied locally");

        Ok(Prepared {
            request_id,
            targets: config.servers_for_clusters([&cluster]),
            cluster,
            performed,
            guard: ReleaseGuard::new(locks, gate),
        })
    }

    async fn replicate(&self, prepared: Prepared) -> Result<OperationResult, ReplicationError> {
        let Prepared {
            request_id,
            cluster,
            targets,
            performed,
            guard,
        } = prepared;
        let database = &self.database;
        let executor = database.executor();

        let outbound = OutboundRequest::new(database.name(), performed.task.clone())
            .id(request_id)
            .clusters(BTreeSet::from([cluster]))
            .targets(targets)
            .local_result(Ok(performed.result.clone()), Arc::clone(executor));

        let result = match database.context().send_request(outbound).await {
            Ok(replicated) => {
                if let Some((low, high)) = position_gap(&replicated.responses) {
                    warn!(request = %request_id, low, high, "Nodes assigned different positions to a create");
                }
                match replicated.response.map(|response| response.payload) {
                    Some(Ok(result)) => OperationResult::from_task(&performed.task, result),
                    Some(Err(err)) => Err(ReplicationError::from_remote(err)),
                    None => OperationResult::from_task(&performed.task, performed.result.clone()),
                }
            }
            Err(err) => {
                if let Some(undo) = &performed.undo {
                    warn!(request = %request_id, error = %err, "Replication failed, undoing local change");
                    executor.apply_undo(request_id, std::slice::from_ref(undo)).await;
                }
                Err(err)
            }
        };

        guard.release();
        result
    }

    async fn cluster_name(&self, rid: RecordId) -> Result<String, ReplicationError> {
        self.database
            .executor()
            .storage()
            .cluster_name(rid.cluster_id)
            .await
            .ok_or_else(|| ReplicationError::UnknownCluster(rid.cluster_id.to_string()))
    }

    /// Replicas cannot write; creates go to the cluster owner while it is up
    async fn check_master(
        &self,
        config: &DatabaseConfig,
        cluster: &str,
        operation: &RecordOperation,
    ) -> Result<(), ReplicationError> {
        if !operation.is_write() {
            return Ok(());
        }
        let context = self.database.context();
        let node = context.node();
        let owner = config.cluster_owner(cluster);

        if !config.is_master(node) {
            return Err(ReplicationError::NotMaster {
                node: node.to_string(),
                cluster: cluster.to_string(),
                owner: owner.map(str::to_string),
            });
        }
        if let RecordOperation::Create { .. } = operation
            && let Some(owner) = owner
            && owner != node
            && context.topology().is_node_available(owner, self.database.name()).await
        {
            return Err(ReplicationError::NotMaster {
                node: node.to_string(),
                cluster: cluster.to_string(),
                owner: Some(owner.to_string()),
            });
        }
        Ok(())
    }
}

fn unexpected(operation: &str, result: &impl std::fmt::Debug) -> ReplicationError {
    ReplicationError::Remote(RemoteError::Other(format!("unexpected {operation} result: {result:?}")))
}

fn resolved(
    result: Result<OperationResult, ReplicationError>,
    callback: Option<CompletionCallback<OperationResult>>,
) -> ReplicationHandle<OperationResult> {
    if let Some(callback) = callback {
        callback(&result);
    }
    ReplicationHandle::ready(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn placeholder(position: i64) -> Payload {
        Ok(TaskResult::Placeholder {
            rid: RecordId::new(3, position),
            version: 1,
        })
    }

    #[test]
    fn test_position_gap() {
        let mut responses = BTreeMap::new();
        responses.insert("a".to_string(), placeholder(4));
        responses.insert("b".to_string(), placeholder(4));
        assert_eq!(position_gap(&responses), None);

        responses.insert("c".to_string(), placeholder(7));
        responses.insert("d".to_string(), Err(RemoteError::Other("down".into())));
        assert_eq!(position_gap(&responses), Some((4, 7)));
    }

    #[test]
    fn test_result_projection() {
        let rid = RecordId::new(3, 1);
        let update = Task::UpdateRecord {
            rid,
            record: RawRecord::new("x", 2, b'd'),
            previous: None,
        };
        assert_eq!(
            OperationResult::from_task(&update, TaskResult::Version(2)).unwrap(),
            OperationResult::Updated(RecordVersion { rid, version: 2 })
        );
        assert!(OperationResult::from_task(&update, TaskResult::Ack).is_err());
    }
}
