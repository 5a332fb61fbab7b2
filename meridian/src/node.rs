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

//! Replication node - wires topology, health monitoring and replication
//!
//! A [`ReplicationNode`] registers itself in the topology, runs the
//! [`HealthMonitor`] and the replication timers, and turns topology events
//! about failed nodes into rollbacks of the transactions they started. When
//! the node itself recovers, its databases are announced online again.

use crate::config::NodeConfig;
use anyhow::{Context, Result};
use meridian_replication::{
    DistributedDatabase, InboundHandler, ReplicationContext, ReplicationServer, ReplicationStats, Storage, Transport,
};
use meridian_topology::{DatabaseConfig, DatabaseStatus, HealthMonitor, SystemTopology, TopologyEvent};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct ReplicationNode {
    config: NodeConfig,
    topology: Arc<SystemTopology>,
    server: Arc<ReplicationServer>,
    health_monitor: Mutex<HealthMonitor>,
    listener: Mutex<Option<JoinHandle<()>>>,
    /// Index of every node seen, kept after the node leaves the topology
    indexes: Mutex<HashMap<String, u32>>,
}

impl ReplicationNode {
    /// Start a node with a topology of its own built from `config.topology`
    pub async fn bootstrap(cluster_id: &str, config: NodeConfig, transport: Arc<dyn Transport>) -> Result<Arc<Self>> {
        let topology = SystemTopology::new(cluster_id, config.topology.clone())
            .await
            .context("Failed to create topology")?;
        Self::start(config, Arc::new(topology), transport).await
    }

    /// Register the node and start its background services
    ///
    /// The caller routes inbound messages to [`ReplicationNode::handler`].
    pub async fn start(
        config: NodeConfig,
        topology: Arc<SystemTopology>,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        info!(node = %config.name, index = config.index, "Starting replication node");

        topology
            .register_node(config.name.clone(), config.index, config.endpoint.clone())
            .await;
        let context = ReplicationContext::new(
            config.name.clone(),
            config.index,
            Arc::new(config.replication.clone()),
            Arc::clone(&topology),
            transport,
        );
        let server = ReplicationServer::new(context);
        server.start();

        let mut health_monitor = HealthMonitor::new(Arc::clone(&topology));
        health_monitor.start();
        let indexes = topology
            .get_all_nodes()
            .await
            .into_iter()
            .map(|node| (node.node_id, node.node_index))
            .collect();

        let node = Arc::new(Self {
            config,
            topology,
            server,
            health_monitor: Mutex::new(health_monitor),
            listener: Mutex::new(None),
            indexes: Mutex::new(indexes),
        });
        let listener = Self::spawn_listener(Arc::downgrade(&node), node.topology.subscribe());
        *node.listener.lock() = Some(listener);

        info!(node = %node.name(), "Replication node started");
        Ok(node)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn topology(&self) -> &Arc<SystemTopology> {
        &self.topology
    }

    pub fn server(&self) -> &Arc<ReplicationServer> {
        &self.server
    }

    /// Inbound side to attach to the transport
    pub fn handler(&self) -> Arc<dyn InboundHandler> {
        self.server.clone()
    }

    pub async fn open_database(
        &self,
        name: &str,
        storage: Arc<dyn Storage>,
        config: DatabaseConfig,
    ) -> Result<Arc<DistributedDatabase>> {
        self.server
            .open_database(name, storage, config)
            .await
            .with_context(|| format!("Failed to open database {name} on {}", self.name()))
    }

    pub fn database(&self, name: &str) -> Option<Arc<DistributedDatabase>> {
        self.server.database(name)
    }

    pub fn stats(&self) -> ReplicationStats {
        self.server.context().metrics().get_stats()
    }

    pub fn is_running(&self) -> bool {
        self.health_monitor.lock().is_running()
    }

    /// Stop background services, close every database and leave the topology
    pub async fn shutdown(&self) {
        info!(node = %self.name(), "Shutting down replication node");
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
        self.health_monitor.lock().stop();
        self.server.shutdown().await;
        info!(node = %self.name(), "Replication node shutdown complete");
    }

    async fn handle_event(&self, event: TopologyEvent) {
        let failed = match &event {
            TopologyEvent::NodeJoined { node_id } => {
                if let Some(index) = self.topology.node_index(node_id).await {
                    self.indexes.lock().insert(node_id.clone(), index);
                }
                None
            }
            TopologyEvent::HealthChanged { node_id, health } if health.is_failed() => Some(node_id),
            TopologyEvent::HealthChanged { node_id, .. } if node_id.as_str() == self.name() => {
                self.server.on_recovered().await;
                None
            }
            TopologyEvent::NodeLeft { node_id } => {
                let index = self.indexes.lock().get(node_id).copied();
                match index {
                    Some(index) if node_id.as_str() != self.name() => {
                        warn!(node = %self.name(), left = %node_id, "Node left the cluster");
                        self.server.on_node_gone(node_id, index).await;
                    }
                    Some(_) => {}
                    None => debug!(node = %self.name(), left = %node_id, "Unknown node left the cluster"),
                }
                None
            }
            TopologyEvent::DatabaseStatusChanged {
                node_id,
                database,
                status: DatabaseStatus::Offline,
            } => {
                if let Some(db) = self.server.database(database)
                    && node_id.as_str() != self.name()
                {
                    db.on_node_unreachable(node_id).await;
                }
                None
            }
            _ => None,
        };

        if let Some(node_id) = failed
            && node_id.as_str() != self.name()
        {
            warn!(node = %self.name(), failed = %node_id, "Node reported failed");
            self.server.on_node_unreachable(node_id).await;
        }
    }

    fn spawn_listener(
        node: Weak<ReplicationNode>,
        mut events: tokio::sync::broadcast::Receiver<TopologyEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Topology listener lagged behind");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(node) = node.upgrade() else { break };
                node.handle_event(event).await;
            }
            debug!("Topology listener stopped");
        })
    }
}

impl Drop for ReplicationNode {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().take() {
            listener.abort();
        }
    }
}
