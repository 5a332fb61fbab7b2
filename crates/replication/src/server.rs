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

//! Replication endpoint of a node
//!
//! Routes inbound requests to the lanes of their database and inbound
//! responses to the coordinator waiting for them, and runs the periodic
//! housekeeping of every open database.

use crate::context::ReplicationContext;
use crate::database::DistributedDatabase;
use crate::error::ReplicationError;
use crate::id::RequestId;
use crate::message::{ExecutionMode, RemoteError, Request, Response, TaskResult};
use crate::storage::Storage;
use crate::task::Task;
use crate::transport::InboundHandler;
use async_trait::async_trait;
use dashmap::DashMap;
use meridian_topology::{DatabaseConfig, DatabaseStatus};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct ReplicationServer {
    context: ReplicationContext,
    databases: DashMap<String, Arc<DistributedDatabase>>,
    timers: Mutex<Option<(CancellationToken, Vec<JoinHandle<()>>)>>,
}

impl ReplicationServer {
    pub fn new(context: ReplicationContext) -> Arc<Self> {
        Arc::new(Self {
            context,
            databases: DashMap::new(),
            timers: Mutex::new(None),
        })
    }

    pub fn context(&self) -> &ReplicationContext {
        &self.context
    }

    pub fn node(&self) -> &str {
        self.context.node()
    }

    /// Open a database on this node and announce it online
    pub async fn open_database(
        &self,
        name: &str,
        storage: Arc<dyn Storage>,
        config: DatabaseConfig,
    ) -> Result<Arc<DistributedDatabase>, ReplicationError> {
        if let Some(existing) = self.databases.get(name) {
            return Ok(Arc::clone(existing.value()));
        }

        let topology = self.context.topology();
        topology.set_database_config(name, config).await;
        let database = DistributedDatabase::open(name, self.context.clone(), storage)?;
        topology
            .set_database_status(self.node(), name, DatabaseStatus::Online)
            .await
            .map_err(|err| ReplicationError::Configuration(err.to_string()))?;

        database.repairer().start();
        self.databases.insert(name.to_string(), Arc::clone(&database));
        Ok(database)
    }

    pub fn database(&self, name: &str) -> Option<Arc<DistributedDatabase>> {
        self.databases.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn databases(&self) -> Vec<Arc<DistributedDatabase>> {
        self.databases.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    /// React to a node leaving; returns the transactions rolled back
    pub async fn on_node_unreachable(&self, node: &str) -> usize {
        let mut rolled_back = 0;
        for database in self.databases() {
            rolled_back += database.on_node_unreachable(node).await;
        }
        info!(node = %self.node(), unreachable = node, rolled_back, "Handled unreachable node");
        rolled_back
    }

    /// React to a node that already left the topology
    pub async fn on_node_gone(&self, node: &str, index: u32) -> usize {
        let mut rolled_back = 0;
        for database in self.databases() {
            rolled_back += database.on_node_gone(node, index).await;
        }
        info!(node = %self.node(), gone = node, rolled_back, "Handled departed node");
        rolled_back
    }

    /// Announce every open database online again after this node recovered
    pub async fn on_recovered(&self) {
        let topology = self.context.topology();
        for database in self.databases() {
            if topology.database_status(self.node(), database.name()).await == DatabaseStatus::Online {
                continue;
            }
            info!(node = %self.node(), database = %database.name(), "Database back online");
            if let Err(err) = topology
                .set_database_status(self.node(), database.name(), DatabaseStatus::Online)
                .await
            {
                warn!(database = %database.name(), error = %err, "Could not mark database online");
            }
        }
    }

    /// Start heartbeats, request purging and transaction expiry
    pub fn start(self: &Arc<Self>) {
        let mut timers = self.timers.lock();
        if timers.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let config = self.context.config();

        let purge = spawn_periodic(
            Arc::downgrade(self),
            token.clone(),
            config.purge_interval(),
            |server| async move {
                server.context.purge_expired(server.context.config().request_ttl());
            },
        );
        let expiry = spawn_periodic(
            Arc::downgrade(self),
            token.clone(),
            config.purge_interval(),
            |server| async move {
                for database in server.databases() {
                    let expired = database.expire_transactions().await;
                    if expired > 0 {
                        warn!(database = %database.name(), expired, "Expired parked transactions");
                    }
                }
            },
        );
        let heartbeat = spawn_periodic(
            Arc::downgrade(self),
            token.clone(),
            config.heartbeat_interval(),
            |server| async move {
                server.context.heartbeat().await;
            },
        );
        *timers = Some((token, vec![purge, expiry, heartbeat]));
        debug!(node = %self.node(), "Replication timers started");
    }

    pub async fn stop(&self) {
        let timers = self.timers.lock().take();
        if let Some((token, handles)) = timers {
            token.cancel();
            for handle in handles {
                let _ = handle.await;
            }
        }
    }

    /// Stop timers, cancel what is still waiting and close every database
    ///
    /// Replications cut short undo their local change, including the
    /// asynchronous ones that were still queued.
    pub async fn shutdown(&self) {
        self.stop().await;
        let topology = self.context.topology();
        let databases = self.databases();
        for database in &databases {
            if let Err(err) = topology
                .set_database_status(self.node(), database.name(), DatabaseStatus::Offline)
                .await
            {
                debug!(database = %database.name(), error = %err, "Could not mark database offline");
            }
            database.close_queue();
        }
        let canceled = self.context.cancel_pending();
        for database in &databases {
            database.shutdown().await;
        }
        self.databases.clear();
        info!(node = %self.node(), canceled, "Replication server stopped");
    }

    async fn reply_error(&self, request_id: RequestId, sender: &str, mode: ExecutionMode, err: RemoteError) {
        if mode != ExecutionMode::Response {
            return;
        }
        let response = Response::new(request_id, self.node(), Err(err));
        if let Err(err) = self.context.transport().send_response(sender, response).await {
            debug!(request = %request_id, error = %err, "Could not send error response");
        }
    }
}

#[async_trait]
impl InboundHandler for ReplicationServer {
    async fn on_request(&self, request: Request) {
        let (request_id, sender, mode) = (request.id, request.sender.clone(), request.execution_mode);
        if request.task == Task::Heartbeat {
            let response = Response::new(request_id, self.node(), Ok(TaskResult::Ack));
            if let Err(err) = self.context.transport().send_response(&sender, response).await {
                debug!(request = %request_id, error = %err, "Could not answer heartbeat");
            }
            return;
        }
        let Some(database) = self.database(&request.database) else {
            warn!(node = %self.node(), database = %request.database, "Request for a database not open here");
            let err = RemoteError::Other(format!("database {} is not open on {}", request.database, self.node()));
            self.reply_error(request_id, &sender, mode, err).await;
            return;
        };

        if let Err(err) = database.dispatch(request).await {
            warn!(request = %request_id, error = %err, "Could not dispatch request");
            self.reply_error(request_id, &sender, mode, RemoteError::Other(err.to_string()))
                .await;
        }
    }

    async fn on_response(&self, response: Response) {
        self.context.on_response(response).await;
    }
}

fn spawn_periodic<F, Fut>(
    server: Weak<ReplicationServer>,
    token: CancellationToken,
    period: Duration,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn(Arc<ReplicationServer>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    let Some(server) = server.upgrade() else { break };
                    tick(server).await;
                }
            }
        }
    })
}
