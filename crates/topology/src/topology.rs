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

//! SystemTopology implementation - centralized node state management

use crate::config::DatabaseConfig;
use crate::types::*;
use anyhow::{Result, anyhow};
use chrono::Utc;
use hashbrown::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info};

/// Live view of the cluster as seen from one node
///
/// Tracks every known node with its health, metrics and per-database replica
/// status, the distributed configuration of every database, and the instant
/// the cluster shape last changed. Changes are published on a broadcast
/// channel so other components can react to nodes leaving.
#[derive(Debug, Clone)]
pub struct SystemTopology {
    /// Cluster identifier
    cluster_id: String,

    /// Configuration
    config: TopologyConfig,

    /// node_id -> NodeStatus
    nodes: Arc<RwLock<HashMap<String, Arc<RwLock<NodeStatus>>>>>,

    /// database name -> distributed configuration
    databases: Arc<RwLock<HashMap<String, Arc<DatabaseConfig>>>>,

    /// Last time membership, health or replica status changed
    last_change: Arc<RwLock<Instant>>,

    /// Cluster-wide statistics (cached, refreshed on every change)
    stats: Arc<RwLock<ClusterStats>>,

    events: broadcast::Sender<TopologyEvent>,
}

impl SystemTopology {
    /// Create new topology instance
    ///
    /// # Arguments
    ///
    /// * `cluster_id` - Unique cluster identifier
    /// * `config` - Topology configuration
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use meridian_topology::{SystemTopology, TopologyConfig};
    ///
    /// #[tokio::main]
    /// async fn main() -> anyhow::Result<()> {
    ///     let config = TopologyConfig::default();
    ///     let topology = SystemTopology::new("my-cluster", config).await?;
    ///     Ok(())
    /// }
    /// ```
    pub async fn new(cluster_id: &str, config: TopologyConfig) -> Result<Self> {
        info!(cluster_id = %cluster_id, "Initializing SystemTopology");

        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        Ok(Self {
            cluster_id: cluster_id.to_string(),
            config,
            nodes: Arc::new(RwLock::new(HashMap::new())),
            databases: Arc::new(RwLock::new(HashMap::new())),
            last_change: Arc::new(RwLock::new(Instant::now())),
            stats: Arc::new(RwLock::new(ClusterStats::default())),
            events,
        })
    }

    /// Register a new node in the topology
    ///
    /// # Arguments
    ///
    /// * `node_id` - Unique node name
    /// * `node_index` - Numeric identifier embedded in the node's request ids
    /// * `endpoint` - Network endpoint for the node
    ///
    /// # Returns
    ///
    /// Returns true if this is a new node, false if it was already known.
    /// A known node that failed and registers again is back to `Unknown`.
    pub async fn register_node(&self, node_id: String, node_index: u32, endpoint: String) -> bool {
        let mut nodes = self.nodes.write().await;
        if let Some(existing) = nodes.get(&node_id).cloned() {
            drop(nodes);
            let mut node = existing.write().await;
            let rejoined = node.health.is_failed() && node.health != NodeHealth::Suspended;
            if rejoined {
                info!(node_id = %node_id, old = ?node.health, "Failed node registered again");
                node.set_health(NodeHealth::Unknown);
            } else {
                debug!(node_id = %node_id, "Node already registered");
            }
            drop(node);

            if rejoined {
                self.publish(TopologyEvent::HealthChanged {
                    node_id,
                    health: NodeHealth::Unknown,
                })
                .await;
                self.update_cluster_stats().await;
            }
            return false;
        }

        info!(node_id = %node_id, node_index, endpoint = %endpoint, "Registering new node");
        let status = NodeStatus::new(endpoint, node_id.clone(), node_index);
        nodes.insert(node_id.clone(), Arc::new(RwLock::new(status)));
        drop(nodes);

        self.publish(TopologyEvent::NodeJoined { node_id }).await;
        self.update_cluster_stats().await;
        true
    }

    /// Remove a node from topology (e.g., decommissioned)
    pub async fn remove_node(&self, node_id: &str) -> Option<NodeStatus> {
        info!(node_id = %node_id, "Removing node from topology");

        let removed = {
            let mut nodes = self.nodes.write().await;
            nodes.remove(node_id)
        }?;

        let snapshot = removed.read().await.clone();
        drop(removed);

        self.publish(TopologyEvent::NodeLeft {
            node_id: node_id.to_string(),
        })
        .await;
        self.update_cluster_stats().await;
        Some(snapshot)
    }

    /// Update health status for a node
    pub async fn update_node_health(&self, node_id: &str, health: NodeHealth) -> Result<()> {
        let node_lock = self.require_node_lock(node_id).await?;
        let mut node = node_lock.write().await;
        let old_health = node.health;
        node.set_health(health);
        let changed = old_health != node.health;
        drop(node);

        if changed {
            info!(
                node_id = %node_id,
                old = ?old_health,
                new = ?health,
                "Node health changed explicitly"
            );
            self.publish(TopologyEvent::HealthChanged {
                node_id: node_id.to_string(),
                health,
            })
            .await;
            self.update_cluster_stats().await;
        }

        Ok(())
    }

    /// Record a successful exchange with a node
    ///
    /// A failed node that answers again goes back to healthy or degraded.
    pub async fn record_node_success(&self, node_id: &str, latency_ms: u64) -> Result<()> {
        let node_lock = self.require_node_lock(node_id).await?;
        let mut node = node_lock.write().await;
        node.metrics.record_success(latency_ms);
        if node.health == NodeHealth::Suspended {
            return Ok(());
        }

        let desired = Self::evaluate_operational_health(&node.metrics, &self.config);
        let mutated = Self::apply_health_transition(node_id, &mut node, desired);
        drop(node);

        if mutated {
            self.publish(TopologyEvent::HealthChanged {
                node_id: node_id.to_string(),
                health: desired,
            })
            .await;
            self.update_cluster_stats().await;
        }

        Ok(())
    }

    /// Record a failed exchange with a node
    pub async fn record_node_failure(&self, node_id: &str) -> Result<()> {
        let node_lock = self.require_node_lock(node_id).await?;
        let mut node = node_lock.write().await;
        node.metrics.record_failure();
        if node.health == NodeHealth::Suspended {
            return Ok(());
        }

        let failure_count = node.metrics.request_count.saturating_sub(node.metrics.success_count) as u32;
        let should_offline = node.metrics.error_rate > 0.5 && failure_count >= self.config.failure_threshold;

        let desired = if should_offline {
            match node.health {
                // keep the original offline timestamp
                offline @ NodeHealth::Offline { .. } => offline,
                _ => NodeHealth::Offline {
                    since: Utc::now(),
                    failure_count,
                },
            }
        } else {
            Self::evaluate_operational_health(&node.metrics, &self.config)
        };

        let mutated = Self::apply_health_transition(node_id, &mut node, desired);
        drop(node);

        if mutated {
            self.publish(TopologyEvent::HealthChanged {
                node_id: node_id.to_string(),
                health: desired,
            })
            .await;
            self.update_cluster_stats().await;
        }

        Ok(())
    }

    /// Set the replica status of a database on a node
    pub async fn set_database_status(&self, node_id: &str, database: &str, status: DatabaseStatus) -> Result<()> {
        let node_lock = self.require_node_lock(node_id).await?;
        let mut node = node_lock.write().await;
        let previous = node.databases.insert(database.to_string(), status);
        drop(node);

        if previous != Some(status) {
            info!(
                node_id = %node_id,
                database = %database,
                old = ?previous,
                new = ?status,
                "Database status changed"
            );
            self.publish(TopologyEvent::DatabaseStatusChanged {
                node_id: node_id.to_string(),
                database: database.to_string(),
                status,
            })
            .await;
        }

        Ok(())
    }

    /// Replica status of a database on a node; unknown nodes are offline
    pub async fn database_status(&self, node_id: &str, database: &str) -> DatabaseStatus {
        match self.node_lock(node_id).await {
            Some(handle) => handle.read().await.database_status(database),
            None => DatabaseStatus::Offline,
        }
    }

    /// Returns true if the node is expected to answer requests for a database
    pub async fn is_node_available(&self, node_id: &str, database: &str) -> bool {
        let Some(handle) = self.node_lock(node_id).await else {
            return false;
        };
        let node = handle.read().await;
        !node.health.is_failed() && node.database_status(database).is_active()
    }

    /// Filter a set of nodes down to the ones available for a database
    pub async fn available_nodes<'a, I>(&self, nodes: I, database: &str) -> Vec<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut available = Vec::new();
        for node in nodes {
            if self.is_node_available(node, database).await {
                available.push(node.clone());
            }
        }
        available
    }

    /// Numeric identifier of a node
    pub async fn node_index(&self, node_id: &str) -> Option<u32> {
        let handle = self.node_lock(node_id).await?;
        let index = handle.read().await.node_index;
        Some(index)
    }

    /// Node name registered for a numeric identifier
    pub async fn node_name(&self, node_index: u32) -> Option<String> {
        self.collect_nodes_matching(|status| status.node_index == node_index)
            .await
            .into_iter()
            .next()
            .map(|status| status.node_id)
    }

    /// Install or replace the distributed configuration of a database
    pub async fn set_database_config(&self, database: &str, config: DatabaseConfig) {
        info!(database = %database, "Installing distributed database configuration");
        self.databases
            .write()
            .await
            .insert(database.to_string(), Arc::new(config));
        self.touch().await;
    }

    /// Distributed configuration of a database
    pub async fn database_config(&self, database: &str) -> Option<Arc<DatabaseConfig>> {
        self.databases.read().await.get(database).cloned()
    }

    /// Instant the cluster shape last changed
    pub async fn last_change(&self) -> Instant {
        *self.last_change.read().await
    }

    /// Subscribe to membership and status changes
    pub fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.events.subscribe()
    }

    /// Get status of a specific node
    pub async fn get_node_status(&self, node_id: &str) -> Option<NodeStatus> {
        let handle = self.node_lock(node_id).await?;
        Some(handle.read().await.clone())
    }

    /// Get all nodes regardless of state
    pub async fn get_all_nodes(&self) -> Vec<NodeStatus> {
        self.collect_nodes_matching(|_| true).await
    }

    /// Get current cluster statistics
    pub async fn get_cluster_stats(&self) -> ClusterStats {
        self.stats.read().await.clone()
    }

    /// Recalculate cluster-wide statistics from all nodes
    pub async fn update_cluster_stats(&self) {
        let handles = {
            let nodes = self.nodes.read().await;
            nodes.values().cloned().collect::<Vec<_>>()
        };

        let mut stats = ClusterStats::default();
        let mut latency_acc: u64 = 0;
        let mut latency_count: u64 = 0;
        let mut aggregated_error_rate = 0.0;

        for handle in handles {
            let node = handle.read().await;
            stats.total_nodes += 1;

            match node.health {
                NodeHealth::Healthy => stats.healthy_nodes += 1,
                NodeHealth::Degraded => stats.degraded_nodes += 1,
                NodeHealth::Unreachable => stats.unreachable_nodes += 1,
                NodeHealth::Offline { .. } => stats.offline_nodes += 1,
                NodeHealth::Suspended => stats.suspended_nodes += 1,
                NodeHealth::Unknown => stats.unknown_nodes += 1,
            }

            if let Some(latency) = node.metrics.latency_ms {
                latency_acc += latency;
                latency_count += 1;
            }

            aggregated_error_rate += node.metrics.error_rate;
        }

        stats.avg_latency_ms = (latency_count > 0).then(|| latency_acc / latency_count);
        stats.avg_error_rate = if stats.total_nodes > 0 {
            aggregated_error_rate / stats.total_nodes as f64
        } else {
            0.0
        };

        *self.stats.write().await = stats.clone();

        debug!(
            total = stats.total_nodes,
            healthy = stats.healthy_nodes,
            degraded = stats.degraded_nodes,
            offline = stats.offline_nodes,
            "Cluster statistics updated"
        );
    }

    /// Get cluster configuration
    pub fn config(&self) -> &TopologyConfig {
        &self.config
    }

    /// Get cluster ID
    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    async fn publish(&self, event: TopologyEvent) {
        self.touch().await;
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    async fn touch(&self) {
        *self.last_change.write().await = Instant::now();
    }

    async fn node_lock(&self, node_id: &str) -> Option<Arc<RwLock<NodeStatus>>> {
        self.nodes.read().await.get(node_id).cloned()
    }

    async fn require_node_lock(&self, node_id: &str) -> Result<Arc<RwLock<NodeStatus>>> {
        self.node_lock(node_id)
            .await
            .ok_or_else(|| anyhow!("Node {} not found in topology", node_id))
    }

    async fn collect_nodes_matching<F>(&self, predicate: F) -> Vec<NodeStatus>
    where
        F: Fn(&NodeStatus) -> bool,
    {
        let handles = {
            let nodes = self.nodes.read().await;
            nodes.values().cloned().collect::<Vec<_>>()
        };

        let mut gathered = Vec::with_capacity(handles.len());
        for handle in handles {
            let node = handle.read().await;
            if predicate(&node) {
                gathered.push(node.clone());
            }
        }
        gathered
    }

    fn evaluate_operational_health(metrics: &NodeMetrics, config: &TopologyConfig) -> NodeHealth {
        if metrics.request_count == 0 {
            return NodeHealth::Unknown;
        }

        let latency_flag = metrics
            .latency_ms
            .map(|latency| latency > config.degraded_latency_threshold_ms)
            .unwrap_or(false);

        if latency_flag || metrics.error_rate > config.degraded_error_rate_threshold {
            NodeHealth::Degraded
        } else {
            NodeHealth::Healthy
        }
    }

    fn apply_health_transition(node_id: &str, node: &mut NodeStatus, desired: NodeHealth) -> bool {
        if node.health == desired {
            return false;
        }

        info!(
            node_id = %node_id,
            old = ?node.health,
            new = ?desired,
            "Node health transition triggered by metrics"
        );
        node.set_health(desired);
        true
    }
}
