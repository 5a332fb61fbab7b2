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

//! Outgoing request bookkeeping for one node
//!
//! [`ReplicationContext`] computes the quorum of a request, registers a
//! [`ResponseCoordinator`] for it, sends it to the target nodes and, once the
//! wait is over, ships the fix and undo messages the coordinator asked for.
//! Inbound responses are routed back to their coordinator by request id.

use crate::config::ReplicationConfig;
use crate::error::ReplicationError;
use crate::executor::TaskExecutor;
use crate::id::{NodeId, RequestId, RequestIdGenerator};
use crate::message::{ExecutionMode, Payload, Request, Response};
use crate::metrics::ReplicationMetrics;
use crate::response::{CoordinatorOptions, RepairAction, ResponseCoordinator};
use crate::task::{ResultStrategy, Task};
use crate::transport::{Transport, TransportError};
use dashmap::DashMap;
use futures::future::join_all;
use meridian_quorum::{QuorumInput, QuorumType};
use meridian_topology::{ALL_WILDCARD, DatabaseConfig, NodeHealth, SystemTopology};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Request waiting for responses
#[derive(Clone)]
pub struct PendingRequest {
    pub coordinator: Arc<ResponseCoordinator>,
    /// Executor applying fixes addressed to this node
    pub local: Option<Arc<TaskExecutor>>,
}

/// Request to replicate, as built by the callers of [`ReplicationContext`]
pub struct OutboundRequest {
    pub id: Option<RequestId>,
    pub database: String,
    pub clusters: BTreeSet<String>,
    pub targets: BTreeSet<NodeId>,
    pub task: Task,
    pub execution_mode: ExecutionMode,
    /// Result of the same task on this node, counted like a remote reply
    pub local_result: Option<Payload>,
    pub local: Option<Arc<TaskExecutor>>,
}

impl OutboundRequest {
    pub fn new(database: impl Into<String>, task: Task) -> Self {
        Self {
            id: None,
            database: database.into(),
            clusters: BTreeSet::new(),
            targets: BTreeSet::new(),
            task,
            execution_mode: ExecutionMode::Response,
            local_result: None,
            local: None,
        }
    }

    pub fn id(mut self, id: RequestId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn clusters(mut self, clusters: BTreeSet<String>) -> Self {
        self.clusters = clusters;
        self
    }

    pub fn targets(mut self, targets: BTreeSet<NodeId>) -> Self {
        self.targets = targets;
        self
    }

    pub fn execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    pub fn local_result(mut self, payload: Payload, executor: Arc<TaskExecutor>) -> Self {
        self.local_result = Some(payload);
        self.local = Some(executor);
        self
    }
}

/// Outcome of a replicated request
#[derive(Debug)]
pub struct Replicated {
    pub request_id: RequestId,
    /// Authoritative response; `None` for fire-and-forget requests
    pub response: Option<Response>,
    /// Every payload received before the wait ended
    pub responses: BTreeMap<NodeId, Payload>,
}

#[derive(Clone)]
pub struct ReplicationContext {
    node: NodeId,
    ids: Arc<RequestIdGenerator>,
    config: Arc<ReplicationConfig>,
    topology: Arc<SystemTopology>,
    transport: Arc<dyn Transport>,
    pending: Arc<DashMap<RequestId, PendingRequest>>,
    metrics: Arc<ReplicationMetrics>,
}

impl ReplicationContext {
    pub fn new(
        node: impl Into<NodeId>,
        node_index: u32,
        config: Arc<ReplicationConfig>,
        topology: Arc<SystemTopology>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            node: node.into(),
            ids: Arc::new(RequestIdGenerator::new(node_index)),
            config,
            topology,
            transport,
            pending: Arc::new(DashMap::new()),
            metrics: Arc::new(ReplicationMetrics::new()),
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn node_index(&self) -> u32 {
        self.ids.node()
    }

    pub fn next_request_id(&self) -> RequestId {
        self.ids.next_id()
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    pub fn topology(&self) -> &Arc<SystemTopology> {
        &self.topology
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn metrics(&self) -> &Arc<ReplicationMetrics> {
        &self.metrics
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub async fn database_config(&self, database: &str) -> Result<Arc<DatabaseConfig>, ReplicationError> {
        self.topology
            .database_config(database)
            .await
            .ok_or_else(|| ReplicationError::UnknownDatabase(database.to_string()))
    }

    /// Largest quorum over the involved clusters
    ///
    /// Fails before anything is sent when too few members are available.
    pub async fn quorum_for(
        &self,
        config: &DatabaseConfig,
        database: &str,
        clusters: &BTreeSet<String>,
        quorum_type: QuorumType,
    ) -> Result<usize, ReplicationError> {
        if quorum_type == QuorumType::None {
            return Ok(0);
        }

        let wildcard = BTreeSet::from([ALL_WILDCARD.to_string()]);
        let names = if clusters.is_empty() { &wildcard } else { clusters };

        let mut quorum = 0;
        for name in names {
            let servers = config.cluster_servers(name);
            let candidates: Vec<&String> = match quorum_type {
                QuorumType::Write => servers.iter().filter(|server| config.is_master(server)).collect(),
                _ => servers.iter().collect(),
            };
            let input = QuorumInput {
                total_servers: servers.len(),
                master_servers: config.master_count(&servers),
                available_members: self.topology.available_nodes(candidates, database).await.len(),
            };
            quorum = quorum.max(config.quorum_verifier(name).calculate(quorum_type, &input)?);
        }
        Ok(quorum)
    }

    /// Replicate a task and wait for its quorum
    pub async fn send_request(&self, outbound: OutboundRequest) -> Result<Replicated, ReplicationError> {
        let OutboundRequest {
            id,
            database,
            clusters,
            targets,
            task,
            execution_mode,
            local_result,
            local,
        } = outbound;

        let request_id = id.unwrap_or_else(|| self.ids.next_id());
        let quorum_type = task.quorum_type();
        let config = self.database_config(&database).await?;
        let quorum = self.quorum_for(&config, &database, &clusters, quorum_type).await?;

        let targets = self.reachable_targets(&database, targets).await;
        let mut expected = targets.clone();
        if local_result.is_some() {
            expected.insert(self.node.clone());
        }
        let members: BTreeSet<NodeId> = match quorum_type {
            QuorumType::Write => expected.iter().filter(|node| config.is_master(node)).cloned().collect(),
            _ => expected.clone(),
        };

        let request = Request {
            id: request_id,
            sender: self.node.clone(),
            database,
            clusters,
            task,
            execution_mode,
            quorum_type,
        };
        debug!(
            request = %request_id,
            task = request.task.name(),
            targets = ?targets,
            quorum,
            "Sending replicated request"
        );

        let options = CoordinatorOptions {
            wait_for_local: config.read_your_writes && local_result.is_some(),
            group_responses: true,
            // transactions hear every participant before committing
            wait_for_all: request.task.result_strategy() == ResultStrategy::Union
                || matches!(request.task, Task::Transaction { .. }),
            ..self.coordinator_options()
        };
        let coordinator = Arc::new(ResponseCoordinator::new(
            request.clone(),
            self.node.clone(),
            expected,
            members,
            quorum,
            options,
            Arc::clone(&self.topology),
            Arc::clone(&self.metrics),
        ));

        if execution_mode == ExecutionMode::Response {
            self.pending.insert(
                request_id,
                PendingRequest {
                    coordinator: Arc::clone(&coordinator),
                    local: local.clone(),
                },
            );
        }
        if let Some(payload) = local_result {
            coordinator.collect_response(Response::new(request_id, self.node.clone(), payload));
        }

        self.broadcast(&request, &targets, &coordinator).await;

        if execution_mode == ExecutionMode::NoResponse {
            return Ok(Replicated {
                request_id,
                response: None,
                responses: BTreeMap::new(),
            });
        }

        if let Err(err) = coordinator.wait_for_quorum(self.config.sync_timeout()).await {
            self.pending.remove(&request_id);
            return Err(err);
        }

        let outcome = coordinator.conclude();
        self.apply_actions(&request, local.as_ref(), outcome.actions).await;

        let responses = coordinator.payloads();
        if coordinator.all_received() {
            self.pending.remove(&request_id);
        }

        Ok(Replicated {
            request_id,
            response: outcome.response?,
            responses,
        })
    }

    /// Send a task to `nodes` and collect whatever they answer within the
    /// sync timeout, without quorum evaluation
    pub async fn deliver(
        &self,
        database: &str,
        clusters: &BTreeSet<String>,
        nodes: BTreeSet<NodeId>,
        task: Task,
    ) -> BTreeMap<NodeId, Payload> {
        let request_id = self.ids.next_id();
        let targets = self.reachable_targets(database, nodes).await;
        if targets.is_empty() {
            return BTreeMap::new();
        }

        let request = Request {
            id: request_id,
            sender: self.node.clone(),
            database: database.to_string(),
            clusters: clusters.clone(),
            task,
            execution_mode: ExecutionMode::Response,
            quorum_type: QuorumType::None,
        };
        let options = CoordinatorOptions {
            wait_for_local: false,
            group_responses: false,
            wait_for_all: true,
            ..self.coordinator_options()
        };
        let coordinator = Arc::new(ResponseCoordinator::new(
            request.clone(),
            self.node.clone(),
            targets.clone(),
            targets.clone(),
            0,
            options,
            Arc::clone(&self.topology),
            Arc::clone(&self.metrics),
        ));
        self.pending.insert(
            request_id,
            PendingRequest {
                coordinator: Arc::clone(&coordinator),
                local: None,
            },
        );

        self.broadcast(&request, &targets, &coordinator).await;
        if let Err(err) = coordinator.wait_for_quorum(self.config.sync_timeout()).await {
            debug!(request = %request_id, error = %err, "Delivery wait ended early");
        }
        self.pending.remove(&request_id);

        let payloads = coordinator.payloads();
        let missing = coordinator.missing_nodes();
        if !missing.is_empty() {
            warn!(request = %request_id, task = request.task.name(), missing = ?missing, "Nodes did not acknowledge delivery");
        }
        payloads
    }

    async fn reachable_targets(&self, database: &str, mut targets: BTreeSet<NodeId>) -> BTreeSet<NodeId> {
        targets.remove(&self.node);
        self.topology
            .available_nodes(targets.iter(), database)
            .await
            .into_iter()
            .collect()
    }

    async fn broadcast(&self, request: &Request, targets: &BTreeSet<NodeId>, coordinator: &ResponseCoordinator) {
        let sends = targets.iter().map(|node| {
            let request = request.clone();
            async move { (node, self.transport.send_request(node, request).await) }
        });

        for (node, result) in join_all(sends).await {
            match result {
                Ok(()) => self.metrics.message_sent(),
                Err(err) => {
                    warn!(request = %request.id, node = %node, error = %err, "Failed to send request");
                    coordinator.remove_unreachable(node);
                    // a node cut off itself says nothing about the target
                    if matches!(&err, TransportError::Unreachable(unreachable) if *unreachable == self.node) {
                        continue;
                    }
                    if let Err(err) = self.topology.record_node_failure(node).await {
                        debug!(node = %node, error = %err, "Could not record node failure");
                    }
                }
            }
        }
    }

    fn coordinator_options(&self) -> CoordinatorOptions {
        CoordinatorOptions {
            sync_timeout: self.config.sync_timeout(),
            check_interval: self.config.quorum_check_interval(),
            cluster_shape_grace: self.config.additional_cluster_shape_timeout(),
            ..CoordinatorOptions::default()
        }
    }

    /// Ship the fix and undo messages of `request`; actions for this node run on `local`
    pub async fn apply_actions(&self, request: &Request, local: Option<&Arc<TaskExecutor>>, actions: Vec<RepairAction>) {
        let database = request.database.as_str();
        let clusters = &request.clusters;
        let mut deliveries = Vec::new();
        for action in actions {
            if action.is_undo() {
                self.metrics.undo_sent();
            } else {
                self.metrics.fix_sent();
            }

            if action.node() == self.node {
                match local {
                    Some(executor) => {
                        if let Err(err) = executor.execute(request.id, action.task()).await {
                            error!(node = %self.node, task = action.task().name(), error = %err, "Failed to apply local fix");
                        }
                    }
                    None => warn!(node = %self.node, task = action.task().name(), "No local executor for fix"),
                }
                continue;
            }

            let undo = action.is_undo();
            let node = action.node().to_string();
            let task = action.task().clone();
            deliveries.push(async move {
                let name = task.name();
                let payloads = self.deliver(database, clusters, BTreeSet::from([node.clone()]), task).await;
                match payloads.get(&node) {
                    Some(Ok(_)) => debug!(node = %node, task = name, undo, "Repair message applied"),
                    Some(Err(err)) if undo => error!(node = %node, task = name, error = %err, "Undo failed on node"),
                    Some(Err(err)) => warn!(node = %node, task = name, error = %err, "Fix failed on node"),
                    None if undo => error!(node = %node, task = name, "Undo not acknowledged"),
                    None => warn!(node = %node, task = name, "Fix not acknowledged"),
                }
            });
        }
        join_all(deliveries).await;
    }

    /// Route a response to its coordinator
    pub async fn on_response(&self, response: Response) {
        self.metrics.message_received();
        let request_id = response.request_id;
        let Some(pending) = self.pending.get(&request_id).map(|entry| entry.value().clone()) else {
            debug!(request = %request_id, node = %response.executor, "Response for unknown request");
            self.metrics.response_unexpected();
            return;
        };

        let executor = response.executor.clone();
        pending.coordinator.collect_response(response);
        if executor != self.node {
            let latency_ms = pending.coordinator.created().elapsed().as_millis() as u64;
            if let Err(err) = self.topology.record_node_success(&executor, latency_ms).await {
                debug!(node = %executor, error = %err, "Could not record node success");
            }
        }
        if pending.coordinator.all_received() {
            self.pending.remove(&request_id);
        }

        let followups = pending.coordinator.take_followups();
        if !followups.is_empty() {
            let context = self.clone();
            tokio::spawn(async move {
                context
                    .apply_actions(pending.coordinator.request(), pending.local.as_ref(), followups)
                    .await;
            });
        }
    }

    /// Send a heartbeat to every other node that is not suspended
    ///
    /// Failed nodes are included, so a node that answers again recovers.
    /// Replies are recorded as they arrive; nodes that stay silent are left
    /// to the health monitor. Returns the number of nodes pinged.
    pub async fn heartbeat(&self) -> usize {
        let nodes: BTreeSet<NodeId> = self
            .topology
            .get_all_nodes()
            .await
            .into_iter()
            .filter(|status| status.node_id != self.node && status.health != NodeHealth::Suspended)
            .map(|status| status.node_id)
            .collect();
        if nodes.is_empty() {
            return 0;
        }

        let request = Request {
            id: self.ids.next_id(),
            sender: self.node.clone(),
            database: String::new(),
            clusters: BTreeSet::new(),
            task: Task::Heartbeat,
            execution_mode: ExecutionMode::Response,
            quorum_type: QuorumType::None,
        };
        let options = CoordinatorOptions {
            wait_for_local: false,
            group_responses: false,
            wait_for_all: true,
            ..self.coordinator_options()
        };
        let coordinator = Arc::new(ResponseCoordinator::new(
            request.clone(),
            self.node.clone(),
            nodes.clone(),
            nodes.clone(),
            0,
            options,
            Arc::clone(&self.topology),
            Arc::clone(&self.metrics),
        ));
        self.pending.insert(
            request.id,
            PendingRequest {
                coordinator: Arc::clone(&coordinator),
                local: None,
            },
        );

        trace!(request = %request.id, nodes = nodes.len(), "Sending heartbeat");
        self.broadcast(&request, &nodes, &coordinator).await;
        if coordinator.all_received() {
            self.pending.remove(&request.id);
        }
        nodes.len()
    }

    /// Stop waiting on a node that left
    pub fn remove_unreachable_node(&self, node: &str) {
        for entry in self.pending.iter() {
            entry.value().coordinator.remove_unreachable(node);
        }
    }

    /// Forget requests older than `ttl`, ending any wait still running on them
    pub fn purge_expired(&self, ttl: Duration) -> usize {
        let expired: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|entry| entry.value().coordinator.created().elapsed() >= ttl)
            .map(|entry| *entry.key())
            .collect();

        for request_id in &expired {
            if let Some((_, pending)) = self.pending.remove(request_id) {
                pending.coordinator.timeout();
            }
        }
        if !expired.is_empty() {
            info!(node = %self.node, purged = expired.len(), "Purged expired requests");
        }
        expired.len()
    }

    /// Cancel every pending request
    pub fn cancel_pending(&self) -> usize {
        let count = self.pending.len();
        for entry in self.pending.iter() {
            entry.value().coordinator.cancel();
        }
        self.pending.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::RecordId;
    use crate::memory::{LocalNetwork, LocalTransport, MemoryStorage};
    use crate::message::{RawRecord, TaskResult};
    use crate::transport::InboundHandler;
    use async_trait::async_trait;
    use meridian_topology::{DatabaseStatus, TopologyConfig};

    const DB: &str = "db";

    struct TestNode {
        context: ReplicationContext,
        executor: Arc<TaskExecutor>,
        transport: Arc<LocalTransport>,
    }

    #[async_trait]
    impl InboundHandler for TestNode {
        async fn on_request(&self, request: Request) {
            let payload = self.executor.execute(request.id, &request.task).await;
            let response = Response::new(request.id, self.context.node(), payload);
            let _ = self.transport.send_response(&request.sender, response).await;
        }

        async fn on_response(&self, response: Response) {
            self.context.on_response(response).await;
        }
    }

    async fn cluster(names: &[&str]) -> (Arc<LocalNetwork>, Vec<Arc<TestNode>>) {
        let topology = Arc::new(SystemTopology::new("test", TopologyConfig::default()).await.unwrap());
        topology
            .set_database_config(DB, DatabaseConfig::with_servers(names.iter().copied()))
            .await;
        let network = LocalNetwork::new(64);
        let config = Arc::new(ReplicationConfig {
            sync_timeout_ms: 300,
            quorum_check_interval_ms: 50,
            ..ReplicationConfig::default()
        });

        let mut nodes = Vec::new();
        for (index, name) in names.iter().enumerate() {
            topology
                .register_node(name.to_string(), index as u32 + 1, format!("{name}:2424"))
                .await;
            topology.set_database_status(name, DB, DatabaseStatus::Online).await.unwrap();

            let transport = network.join(name);
            let node = Arc::new(TestNode {
                context: ReplicationContext::new(
                    *name,
                    index as u32 + 1,
                    Arc::clone(&config),
                    Arc::clone(&topology),
                    transport.clone(),
                ),
                executor: Arc::new(TaskExecutor::new(*name, DB, Arc::new(MemoryStorage::with_clusters(&["person"])))),
                transport,
            });
            network.attach(name, node.clone());
            nodes.push(node);
        }
        (network, nodes)
    }

    fn targets(names: &[&str]) -> BTreeSet<NodeId> {
        names.iter().map(|name| name.to_string()).collect()
    }

    fn create(rid: RecordId) -> Task {
        Task::CreateRecord {
            rid,
            record: RawRecord::new("alice", 1, b'd'),
        }
    }

    #[tokio::test]
    async fn test_replicated_create_reaches_quorum() {
        let (_network, nodes) = cluster(&["a", "b", "c"]).await;
        let a = &nodes[0];
        let performed = a
            .executor
            .perform(&crate::task::RecordOperation::Create {
                cluster: "person".into(),
                content: "alice".into(),
                record_type: b'd',
            })
            .await
            .unwrap();

        let replicated = a
            .context
            .send_request(
                OutboundRequest::new(DB, performed.task)
                    .targets(targets(&["a", "b", "c"]))
                    .local_result(Ok(performed.result.clone()), Arc::clone(&a.executor)),
            )
            .await
            .unwrap();

        let response = replicated.response.unwrap();
        assert_eq!(response.payload, Ok(performed.result));
        assert!(replicated.responses.len() >= 2);
    }

    #[tokio::test]
    async fn test_minority_with_different_state_is_fixed() {
        let (_network, nodes) = cluster(&["a", "b", "c"]).await;
        let rid = RecordId::new(0, 0);
        // c already used position 0 for something else
        nodes[2]
            .executor
            .storage()
            .create(0, "other".into(), b'd')
            .await
            .unwrap();
        nodes[0].executor.apply(&create(rid)).await.unwrap();

        let replicated = nodes[0]
            .context
            .send_request(
                OutboundRequest::new(DB, create(rid))
                    .targets(targets(&["b", "c"]))
                    .local_result(
                        Ok(TaskResult::Placeholder { rid, version: 1 }),
                        Arc::clone(&nodes[0].executor),
                    ),
            )
            .await
            .unwrap();
        assert!(replicated.response.is_some());

        // the fix arrives asynchronously when c answers after the quorum
        for _ in 0..50 {
            if nodes[2].executor.storage().read(rid).await.unwrap() == Some(RawRecord::new("alice", 1, b'd')) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("node c was not fixed");
    }

    #[tokio::test]
    async fn test_insufficient_members_fail_before_sending() {
        let (network, nodes) = cluster(&["a", "b", "c"]).await;
        let topology = nodes[0].context.topology();
        topology.set_database_status("b", DB, DatabaseStatus::Offline).await.unwrap();
        topology.set_database_status("c", DB, DatabaseStatus::Offline).await.unwrap();
        network.set_down("b", true);

        let err = nodes[0]
            .context
            .send_request(OutboundRequest::new(DB, create(RecordId::new(0, 0))).targets(targets(&["b", "c"])))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Quorum(_)));
        assert_eq!(nodes[0].context.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_response_is_counted() {
        let (_network, nodes) = cluster(&["a", "b"]).await;
        nodes[0]
            .context
            .on_response(Response::new(RequestId::new(9, 9), "b", Ok(TaskResult::Ack)))
            .await;

        assert_eq!(nodes[0].context.metrics().get_stats().responses_unexpected, 1);
    }

    #[tokio::test]
    async fn test_deliver_collects_acks() {
        let (_network, nodes) = cluster(&["a", "b", "c"]).await;
        let rid = RecordId::new(0, 2);

        let payloads = nodes[0]
            .context
            .deliver(
                DB,
                &BTreeSet::new(),
                targets(&["a", "b", "c"]),
                Task::FixUpdateRecord {
                    rid,
                    record: RawRecord::new("x", 4, b'd'),
                },
            )
            .await;

        assert_eq!(payloads.keys().cloned().collect::<Vec<_>>(), vec!["b", "c"]);
        assert!(payloads.values().all(|payload| *payload == Ok(TaskResult::Ack)));
        assert_eq!(nodes[0].context.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_purge_expired_requests() {
        let (network, nodes) = cluster(&["a", "b"]).await;
        network.set_mute("b", true);

        let context = nodes[0].context.clone();
        let started = std::time::Instant::now();
        let waiter = tokio::spawn(async move {
            context
                .send_request(OutboundRequest::new(DB, Task::ReadRecord { rid: RecordId::new(0, 0) }).targets(targets(&["b"])))
                .await
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(nodes[0].context.purge_expired(Duration::ZERO), 1);

        // reads are idempotent, a silent cluster yields no response rather than an error
        let replicated = waiter.await.unwrap().unwrap();
        assert!(replicated.response.is_none());
        assert!(started.elapsed() < Duration::from_millis(250));
    }
}
