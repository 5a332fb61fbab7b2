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

//! Multi-record transactions in two phases
//!
//! Phase one locks and applies every operation locally, then replicates them
//! as a single [`Task::Transaction`]; each participant keeps its undo tasks
//! and locks. Phase two commits or rolls back everywhere with
//! [`Task::CompleteTransaction`]. A participant that failed for any reason
//! other than a lock conflict rolls the whole transaction back.

use crate::async_queue::{CompletionCallback, GateGuard, ReleaseGuard, ReplicationHandle};
use crate::context::OutboundRequest;
use crate::database::DistributedDatabase;
use crate::error::ReplicationError;
use crate::executor::TxContext;
use crate::id::{NodeId, RecordId, RequestId};
use crate::lock_table::LockGuard;
use crate::message::TaskResult;
use crate::router::OperationResult;
use crate::task::{RecordOperation, Task};
use bytes::Bytes;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Operations to run atomically, in order
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    operations: Vec<RecordOperation>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(mut self, cluster: &str, content: impl Into<Bytes>, record_type: u8) -> Self {
        self.operations.push(RecordOperation::Create {
            cluster: cluster.to_string(),
            content: content.into(),
            record_type,
        });
        self
    }

    pub fn update(mut self, rid: RecordId, content: impl Into<Bytes>, version: Option<u32>, record_type: u8) -> Self {
        self.operations.push(RecordOperation::Update {
            rid,
            content: content.into(),
            version,
            record_type,
        });
        self
    }

    pub fn delete(mut self, rid: RecordId, version: Option<u32>) -> Self {
        self.operations.push(RecordOperation::Delete { rid, version });
        self
    }

    pub fn operations(&self) -> &[RecordOperation] {
        &self.operations
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    fn creates_records(&self) -> bool {
        self.operations
            .iter()
            .any(|operation| matches!(operation, RecordOperation::Create { .. }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Begun,
    Locking,
    LocalExecuting,
    Replicating,
    Completing,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReport {
    pub request_id: RequestId,
    pub state: TxState,
    /// One result per operation
    pub results: Vec<OperationResult>,
}

#[derive(Debug, Error)]
#[error("Transaction {request:?} failed while {state:?}: {source}")]
pub struct TxError {
    pub request: Option<RequestId>,
    /// Last state reached
    pub state: TxState,
    /// Undo tasks applied on this node
    pub undo_tasks: usize,
    #[source]
    pub source: ReplicationError,
}

impl TxError {
    pub fn is_retryable(&self) -> bool {
        self.source.is_retryable()
    }
}

impl From<ReplicationError> for TxError {
    fn from(source: ReplicationError) -> Self {
        Self {
            request: None,
            state: TxState::RolledBack,
            undo_tasks: 0,
            source,
        }
    }
}

/// Phase one applied locally, awaiting replication
struct PreparedTx {
    request_id: RequestId,
    clusters: BTreeSet<String>,
    targets: BTreeSet<NodeId>,
    operations: Vec<Task>,
    undo: Vec<Task>,
    results: Vec<TaskResult>,
    guard: ReleaseGuard,
}

#[derive(Clone)]
pub struct TransactionCoordinator {
    database: Arc<DistributedDatabase>,
}

impl TransactionCoordinator {
    pub fn new(database: Arc<DistributedDatabase>) -> Self {
        Self { database }
    }

    #[instrument(skip_all, fields(database = %self.database.name(), operations = transaction.len()))]
    pub async fn commit(&self, transaction: Transaction) -> Result<TxReport, TxError> {
        let prepared = self.prepare(&transaction).await?;
        self.replicate(prepared).await
    }

    /// Run phase one now and the rest on the background queue
    pub async fn commit_async(
        &self,
        transaction: Transaction,
        callback: Option<CompletionCallback<TxReport, TxError>>,
    ) -> ReplicationHandle<TxReport, TxError> {
        let prepared = match self.prepare(&transaction).await {
            Ok(prepared) => prepared,
            Err(err) => {
                let result = Err(err);
                if let Some(callback) = callback {
                    callback(&result);
                }
                return ReplicationHandle::ready(result);
            }
        };
        let coordinator = self.clone();
        self.database
            .replicator()
            .submit(async move { coordinator.replicate(prepared).await }, callback)
            .await
    }

    async fn prepare(&self, transaction: &Transaction) -> Result<PreparedTx, TxError> {
        let database = &self.database;
        let context = database.context();
        let executor = database.executor();
        let settings = context.config();

        if transaction.is_empty() {
            return Err(ReplicationError::Configuration("empty transaction".to_string()).into());
        }
        let config = context.database_config(database.name()).await?;
        if !config.is_master(context.node()) {
            return Err(ReplicationError::NotMaster {
                node: context.node().to_string(),
                cluster: String::new(),
                owner: None,
            }
            .into());
        }

        let request_id = context.next_request_id();
        let failed = |state, undo_tasks, source| TxError {
            request: Some(request_id),
            state,
            undo_tasks,
            source,
        };
        debug!(request = %request_id, state = ?TxState::Begun, "Transaction begun");

        let gate = if transaction.creates_records() {
            GateGuard::Exclusive(Arc::clone(database.gate()).write_owned().await)
        } else {
            GateGuard::Shared(Arc::clone(database.gate()).read_owned().await)
        };
        let locks = LockGuard::new(Arc::clone(executor.locks()), request_id);

        for rid in transaction.operations.iter().filter_map(RecordOperation::record_id) {
            if let Err(err) = executor
                .locks()
                .lock_with_retry(rid, request_id, settings.lock_retries, settings.lock_retry_delay())
                .await
            {
                return Err(failed(TxState::Locking, 0, err));
            }
        }

        let mut clusters = BTreeSet::new();
        let mut operations = Vec::with_capacity(transaction.len());
        let mut undo = Vec::with_capacity(transaction.len());
        let mut results = Vec::with_capacity(transaction.len());
        for operation in &transaction.operations {
            let performed = match executor.perform(operation).await {
                Ok(performed) => performed,
                Err(err) => {
                    let reverse: Vec<Task> = undo.iter().rev().cloned().collect();
                    executor.apply_undo(request_id, &reverse).await;
                    return Err(failed(TxState::LocalExecuting, reverse.len(), err));
                }
            };

            let Some(rid) = performed.task.record_id() else {
                continue;
            };
            if matches!(performed.task, Task::CreateRecord { .. }) && !executor.locks().try_lock(rid, request_id) {
                let owner = executor.locks().owner(rid);
                let mut reverse: Vec<Task> = performed.undo.into_iter().collect();
                reverse.extend(undo.iter().rev().cloned());
                executor.apply_undo(request_id, &reverse).await;
                return Err(failed(
                    TxState::Locking,
                    reverse.len(),
                    ReplicationError::RecordLocked { rid, owner },
                ));
            }
            if let Some(name) = executor.storage().cluster_name(rid.cluster_id).await {
                clusters.insert(name);
            }
            // a delete that found nothing still needs an aligned, harmless undo
            undo.push(performed.undo.unwrap_or(Task::FixDeleteRecord { rid }));
            operations.push(performed.task);
            results.push(performed.result);
        }

        executor.register(TxContext {
            request_id,
            locks: executor.locks().locked_by(request_id),
            undo: undo.clone(),
            started: Instant::now(),
        });

        Ok(PreparedTx {
            request_id,
            targets: config.servers_for_clusters(&clusters),
            clusters,
            operations,
            undo,
            results,
            guard: ReleaseGuard::new(locks, gate),
        })
    }

    async fn replicate(&self, prepared: PreparedTx) -> Result<TxReport, TxError> {
        let PreparedTx {
            request_id,
            clusters,
            targets,
            operations,
            undo,
            results,
            guard,
        } = prepared;
        let database = &self.database;
        let context = database.context();
        let executor = database.executor();
        let settings = context.config();
        let partitions: Vec<i32> = operations
            .iter()
            .flat_map(|task| task.partitions())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let task = Task::Transaction {
            operations: operations.clone(),
            undo: undo.clone(),
        };

        // the first attempt shares the local request id; retries need fresh ones
        let mut attempt = 1;
        let mut attempt_id = request_id;
        let outcome = loop {
            let outbound = OutboundRequest::new(database.name(), task.clone())
                .id(attempt_id)
                .clusters(clusters.clone())
                .targets(targets.clone())
                .local_result(Ok(TaskResult::Tx(results.clone())), Arc::clone(executor));

            match context.send_request(outbound).await {
                Err(err) if err.is_retryable() && attempt < settings.lock_retries => {
                    debug!(request = %request_id, attempt, error = %err, "Transaction hit a locked record, retrying");
                    attempt += 1;
                    attempt_id = context.next_request_id();
                    tokio::time::sleep(settings.lock_retry_delay()).await;
                }
                other => break other,
            }
        };

        let replicated = match outcome {
            Ok(replicated) => replicated,
            Err(err) => {
                warn!(request = %request_id, error = %err, "Transaction failed, rolling back");
                executor.complete_transaction(request_id, false, &[]).await;
                guard.release();
                return Err(TxError {
                    request: Some(request_id),
                    state: TxState::RolledBack,
                    undo_tasks: undo.len(),
                    source: err,
                });
            }
        };

        debug!(request = %request_id, state = ?TxState::Completing, "Committing transaction");
        let commit = Task::CompleteTransaction {
            transaction: attempt_id,
            success: true,
            fixes: Vec::new(),
            partitions,
        };
        let acks = context.deliver(database.name(), &clusters, targets.clone(), commit).await;
        let unacknowledged = targets
            .iter()
            .filter(|node| node.as_str() != context.node() && !matches!(acks.get(*node), Some(Ok(_))))
            .count();
        if unacknowledged > 0 {
            warn!(request = %request_id, unacknowledged, "Commit not acknowledged everywhere, replicas will expire the transaction");
        }
        executor.complete_transaction(request_id, true, &[]).await;
        guard.release();

        let final_results = match replicated.response.map(|response| response.payload) {
            Some(Ok(TaskResult::Tx(winner))) if winner.len() == operations.len() => winner,
            _ => results,
        };
        let results = operations
            .iter()
            .zip(final_results)
            .map(|(task, result)| OperationResult::from_task(task, result))
            .collect::<Result<Vec<_>, _>>()?;

        info!(request = %request_id, operations = operations.len(), attempts = attempt, "Transaction committed");
        Ok(TxReport {
            request_id,
            state: TxState::Committed,
            results,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_keeps_order() {
        let rid = RecordId::new(3, 0);
        let tx = Transaction::new()
            .create("person", "a", b'd')
            .update(rid, "b", Some(1), b'd')
            .delete(RecordId::new(3, 1), None);

        assert_eq!(tx.len(), 3);
        assert!(tx.creates_records());
        assert_eq!(tx.operations()[1].record_id(), Some(rid));
        assert!(!Transaction::new().update(rid, "x", None, b'd').creates_records());
    }

    #[test]
    fn test_error_conversion_keeps_retryability() {
        let err = TxError::from(ReplicationError::RecordLocked {
            rid: RecordId::new(3, 0),
            owner: None,
        });
        assert!(err.is_retryable());
        assert_eq!(err.state, TxState::RolledBack);
        assert_eq!(err.undo_tasks, 0);
    }
}
