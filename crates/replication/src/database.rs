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

//! One replicated database on one node
//!
//! [`DistributedDatabase`] owns the local executor, the inbound lanes, the
//! router gate, the asynchronous replication queue and the background
//! repairer of a database. Client operations enter through
//! [`OperationRouter`] and [`TransactionCoordinator`].

use crate::async_queue::AsyncReplicator;
use crate::context::{OutboundRequest, ReplicationContext};
use crate::dispatcher::RequestDispatcher;
use crate::error::ReplicationError;
use crate::executor::TaskExecutor;
use crate::message::{ExecutionMode, Request, Response, TaskResult};
use crate::repairer::BackgroundRepairer;
use crate::router::OperationRouter;
use crate::storage::Storage;
use crate::task::Task;
use crate::transaction::TransactionCoordinator;
use crate::transport::Transport;
use crate::worker_pool::{LaneHandler, LaneStats, PartitionedWorkerPool};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Runs inbound requests of a lane against the local executor
struct ReplicaLaneHandler {
    node: String,
    executor: Arc<TaskExecutor>,
    transport: Arc<dyn Transport>,
}

#[async_trait]
impl LaneHandler for ReplicaLaneHandler {
    async fn handle(&self, lane: usize, request: Request) -> Result<(), ReplicationError> {
        let payload = self.executor.execute(request.id, &request.task).await;
        debug!(
            lane,
            request = %request.id,
            task = request.task.name(),
            ok = payload.is_ok(),
            "Request executed"
        );

        if request.execution_mode == ExecutionMode::Response {
            let response = Response::new(request.id, self.node.clone(), payload);
            self.transport.send_response(&request.sender, response).await?;
        }
        Ok(())
    }
}

pub struct DistributedDatabase {
    name: String,
    context: ReplicationContext,
    executor: Arc<TaskExecutor>,
    dispatcher: RequestDispatcher,
    /// Shared by ordinary operations, exclusive for creates and schema changes
    gate: Arc<RwLock<()>>,
    replicator: AsyncReplicator,
    repairer: Arc<BackgroundRepairer>,
}

impl DistributedDatabase {
    /// Open the database on this node; must run inside the runtime
    pub fn open(
        name: impl Into<String>,
        context: ReplicationContext,
        storage: Arc<dyn Storage>,
    ) -> Result<Arc<Self>, ReplicationError> {
        let name = name.into();
        let executor = Arc::new(TaskExecutor::new(context.node(), name.clone(), storage));
        let config = context.config().clone();

        let handler = Arc::new(ReplicaLaneHandler {
            node: context.node().to_string(),
            executor: Arc::clone(&executor),
            transport: Arc::clone(context.transport()),
        });
        let pool = PartitionedWorkerPool::new(&name, config.worker_lanes, config.lane_queue_capacity, handler);
        let repairer = Arc::new(BackgroundRepairer::new(
            name.clone(),
            context.clone(),
            Arc::clone(&executor),
            config.repairer.clone(),
        )?);

        info!(node = %context.node(), database = %name, lanes = config.worker_lanes, "Database opened");
        Ok(Arc::new(Self {
            replicator: AsyncReplicator::new(&name, config.async_queue_capacity),
            name,
            context,
            executor,
            dispatcher: RequestDispatcher::new(pool),
            gate: Arc::new(RwLock::new(())),
            repairer,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context(&self) -> &ReplicationContext {
        &self.context
    }

    pub fn executor(&self) -> &Arc<TaskExecutor> {
        &self.executor
    }

    pub fn repairer(&self) -> &Arc<BackgroundRepairer> {
        &self.repairer
    }

    pub fn router(self: &Arc<Self>) -> OperationRouter {
        OperationRouter::new(Arc::clone(self))
    }

    pub fn transactions(self: &Arc<Self>) -> TransactionCoordinator {
        TransactionCoordinator::new(Arc::clone(self))
    }

    pub(crate) fn gate(&self) -> &Arc<RwLock<()>> {
        &self.gate
    }

    pub(crate) fn replicator(&self) -> &AsyncReplicator {
        &self.replicator
    }

    /// Queue an inbound request on its lane
    pub async fn dispatch(&self, request: Request) -> Result<(), ReplicationError> {
        self.dispatcher.dispatch(request).await
    }

    pub fn lane_stats(&self) -> Vec<LaneStats> {
        self.dispatcher.lane_stats()
    }

    /// Create a storage cluster on every server of the database
    ///
    /// Runs alone: no record operation of this node is in flight meanwhile.
    pub async fn create_cluster(&self, name: &str) -> Result<i32, ReplicationError> {
        let _exclusive = self.gate.write().await;
        let config = self.context.database_config(&self.name).await?;
        let request_id = self.context.next_request_id();
        let task = Task::CreateCluster { name: name.to_string() };

        let local = self.executor.execute(request_id, &task).await;
        if let Err(err) = &local {
            return Err(ReplicationError::from_remote(err.clone()));
        }

        let replicated = self
            .context
            .send_request(
                OutboundRequest::new(self.name.clone(), task)
                    .id(request_id)
                    .targets(config.all_servers())
                    .local_result(local.clone(), Arc::clone(&self.executor)),
            )
            .await?;

        let payload = replicated.response.map(|response| response.payload).unwrap_or(local);
        match payload {
            Ok(TaskResult::Cluster(id)) => {
                info!(database = %self.name, cluster = name, id, "Cluster created");
                Ok(id)
            }
            Ok(other) => Err(ReplicationError::Configuration(format!(
                "unexpected result creating cluster {name}: {other:?}"
            ))),
            Err(err) => Err(ReplicationError::from_remote(err)),
        }
    }

    /// Drop everything this database waits for from `node`
    ///
    /// Pending requests stop counting on it and transactions it started
    /// here are rolled back.
    pub async fn on_node_unreachable(&self, node: &str) -> usize {
        let Some(index) = self.context.topology().node_index(node).await else {
            self.context.remove_unreachable_node(node);
            debug!(database = %self.name, node, "Unreachable node has no index");
            return 0;
        };
        self.on_node_gone(node, index).await
    }

    /// Same as [`Self::on_node_unreachable`] for a node already removed
    /// from the topology
    pub async fn on_node_gone(&self, node: &str, index: u32) -> usize {
        self.context.remove_unreachable_node(node);
        let rolled_back = self.executor.rollback_from(index).await;
        if rolled_back > 0 {
            warn!(database = %self.name, node, rolled_back, "Rolled back transactions of unreachable node");
        }
        rolled_back
    }

    /// Roll back transactions parked longer than the transaction timeout
    pub async fn expire_transactions(&self) -> usize {
        self.executor.expire(self.context.config().tx_timeout()).await
    }

    /// Stop starting queued asynchronous replications
    pub fn close_queue(&self) {
        self.replicator.close();
    }

    pub async fn shutdown(&self) {
        let grace = self.context.config().shutdown_grace();
        self.repairer.stop().await;
        self.replicator.shutdown(grace).await;
        self.dispatcher.shutdown(grace).await;

        let released = self.executor.locks().clear();
        let rolled_back = self.executor.rollback_all().await;
        info!(database = %self.name, released, rolled_back, "Database closed");
    }
}
