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

//! Health monitoring service for cluster nodes
//!
//! Periodically walks the topology, marks silent nodes unreachable and takes
//! the database replicas of failed nodes offline so pending quorums stop
//! waiting for them.

use crate::topology::SystemTopology;
use crate::types::{DatabaseStatus, NodeHealth, NodeStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Health monitoring service that performs periodic health checks
pub struct HealthMonitor {
    /// Reference to the topology being monitored
    topology: Arc<SystemTopology>,

    /// Health check interval
    check_interval: Duration,

    /// Handle to the background task
    task_handle: Option<JoinHandle<()>>,
}

impl HealthMonitor {
    /// Create a new health monitor
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use std::sync::Arc;
    /// use meridian_topology::{SystemTopology, TopologyConfig, HealthMonitor};
    ///
    /// #[tokio::main]
    /// async fn main() -> anyhow::Result<()> {
    ///     let config = TopologyConfig::default();
    ///     let topology = Arc::new(SystemTopology::new("cluster-1", config).await?);
    ///     let mut monitor = HealthMonitor::new(topology);
    ///     monitor.start();
    ///     Ok(())
    /// }
    /// ```
    pub fn new(topology: Arc<SystemTopology>) -> Self {
        let check_interval = Duration::from_secs(topology.config().health_check_interval_secs.max(1));

        Self {
            topology,
            check_interval,
            task_handle: None,
        }
    }

    /// Start the health monitoring service
    pub fn start(&mut self) {
        if self.task_handle.is_some() {
            return;
        }
        info!(interval_secs = self.check_interval.as_secs(), "Starting health monitor service");

        let topology = Arc::clone(&self.topology);
        let check_interval = self.check_interval;

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(check_interval).await;

                match Self::perform_health_check(&topology).await {
                    Ok(checked) => {
                        debug!(nodes_checked = checked, "Health check cycle completed");
                    }
                    Err(e) => {
                        error!(error = %e, "Health check cycle failed");
                    }
                }
            }
        });

        self.task_handle = Some(handle);
    }

    /// Perform a single health check cycle on all nodes
    ///
    /// Returns the number of nodes checked.
    pub async fn perform_health_check(topology: &Arc<SystemTopology>) -> anyhow::Result<usize> {
        let nodes = topology.get_all_nodes().await;
        let total_nodes = nodes.len();

        if total_nodes == 0 {
            debug!("No nodes to health check");
            return Ok(0);
        }

        debug!(total_nodes = total_nodes, "Starting health check cycle");

        // silent for two intervals means unreachable
        let timeout_threshold = topology.config().health_check_interval_secs * 2;

        for node in &nodes {
            let mut health = node.health;

            if let Some(last_success) = node.metrics.last_success {
                let elapsed_secs = (chrono::Utc::now() - last_success).num_seconds().max(0) as u64;

                if elapsed_secs > timeout_threshold && health.is_operational() {
                    debug!(
                        node_id = %node.node_id,
                        elapsed_secs = elapsed_secs,
                        "No recent activity, marking as unreachable"
                    );

                    match topology.update_node_health(&node.node_id, NodeHealth::Unreachable).await {
                        Ok(()) => health = NodeHealth::Unreachable,
                        Err(e) => error!(node_id = %node.node_id, error = %e, "Failed to update node health"),
                    }
                }
            }

            if health.is_failed() {
                Self::take_databases_offline(topology, node).await;
            }
        }

        topology.update_cluster_stats().await;

        Ok(total_nodes)
    }

    async fn take_databases_offline(topology: &SystemTopology, node: &NodeStatus) {
        for (database, status) in &node.databases {
            if *status == DatabaseStatus::Offline {
                continue;
            }
            warn!(node_id = %node.node_id, database = %database, "Failed node, taking database replica offline");
            if let Err(e) = topology
                .set_database_status(&node.node_id, database, DatabaseStatus::Offline)
                .await
            {
                error!(node_id = %node.node_id, error = %e, "Failed to update database status");
            }
        }
    }

    /// Returns true while the background task is running
    pub fn is_running(&self) -> bool {
        self.task_handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Stop the health monitoring service
    pub fn stop(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            info!("Stopping health monitor service");
            handle.abort();
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TopologyConfig;

    async fn topology() -> Arc<SystemTopology> {
        Arc::new(
            SystemTopology::new("test-cluster", TopologyConfig::default())
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_health_monitor_start_stop() {
        let mut monitor = HealthMonitor::new(topology().await);
        assert!(!monitor.is_running());

        monitor.start();
        assert!(monitor.is_running());

        monitor.stop();
        assert!(monitor.task_handle.is_none());
    }

    #[tokio::test]
    async fn test_health_check_cycle() {
        let topology = topology().await;
        topology
            .register_node("node1".to_string(), 1, "localhost:2424".to_string())
            .await;
        topology
            .register_node("node2".to_string(), 2, "localhost:2425".to_string())
            .await;

        let checked = HealthMonitor::perform_health_check(&topology).await.unwrap();
        assert_eq!(checked, 2);
    }

    #[tokio::test]
    async fn test_failed_node_databases_go_offline() {
        let topology = topology().await;
        topology
            .register_node("node1".to_string(), 1, "localhost:2424".to_string())
            .await;
        topology
            .set_database_status("node1", "orders", DatabaseStatus::Online)
            .await
            .unwrap();
        topology
            .update_node_health("node1", NodeHealth::Unreachable)
            .await
            .unwrap();

        HealthMonitor::perform_health_check(&topology).await.unwrap();

        assert_eq!(
            topology.database_status("node1", "orders").await,
            DatabaseStatus::Offline
        );
    }
}
