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

//! Core data types for topology management

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;

/// Node health state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeHealth {
    /// Node is fully operational and responding normally
    Healthy,

    /// Node is operational but experiencing degraded performance
    /// (high latency, elevated error rate)
    Degraded,

    /// Node is not reachable via network but may recover
    Unreachable,

    /// Node is offline (crash, network partition, etc.)
    /// Includes timestamp of when it went offline and failure count
    Offline { since: DateTime<Utc>, failure_count: u32 },

    /// Node has been manually suspended by administrator
    Suspended,

    /// Node state is unknown (initial state before first exchange)
    #[default]
    Unknown,
}

impl NodeHealth {
    /// Returns true if the node is considered operational for serving requests
    #[inline]
    pub fn is_operational(&self) -> bool {
        matches!(self, NodeHealth::Healthy | NodeHealth::Degraded)
    }

    /// Returns true if the node is in a failed state
    #[inline]
    pub fn is_failed(&self) -> bool {
        matches!(self, NodeHealth::Unreachable | NodeHealth::Offline { .. } | NodeHealth::Suspended)
    }
}

/// Replica status of one database on one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseStatus {
    /// Database is serving requests
    Online,

    /// Database is catching up from another node
    Synchronizing,

    /// Database is taking a backup; requests queue up but are answered
    Backup,

    /// Database is installed but not serving
    #[default]
    NotAvailable,

    /// Node left the cluster
    Offline,
}

impl DatabaseStatus {
    /// Returns true if the replica will eventually answer a request
    #[inline]
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            DatabaseStatus::Online | DatabaseStatus::Synchronizing | DatabaseStatus::Backup
        )
    }

    /// Returns true if the replica is catching up or paused
    #[inline]
    pub fn is_resynchronizing(&self) -> bool {
        matches!(self, DatabaseStatus::Synchronizing | DatabaseStatus::Backup)
    }
}

/// Performance metrics for a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeMetrics {
    /// Most recent response latency in milliseconds
    pub latency_ms: Option<u64>,

    /// Error rate (0.0-1.0)
    pub error_rate: f64,

    /// Timestamp of last successful operation
    pub last_success: Option<DateTime<Utc>>,

    /// Timestamp of last failed operation
    pub last_failure: Option<DateTime<Utc>>,

    /// Total number of requests sent to this node
    pub request_count: u64,

    /// Total number of successful requests
    pub success_count: u64,
}

impl NodeMetrics {
    /// Create a new NodeMetrics instance with default values
    pub fn new() -> Self {
        Self {
            latency_ms: None,
            error_rate: 0.0,
            last_success: None,
            last_failure: None,
            request_count: 0,
            success_count: 0,
        }
    }

    /// Record a successful operation
    pub fn record_success(&mut self, latency_ms: u64) {
        self.request_count += 1;
        self.success_count += 1;
        self.latency_ms = Some(latency_ms);
        self.last_success = Some(Utc::now());
        self.update_error_rate();
    }

    /// Record a failed operation
    pub fn record_failure(&mut self) {
        self.request_count += 1;
        self.last_failure = Some(Utc::now());
        self.update_error_rate();
    }

    fn update_error_rate(&mut self) {
        if self.request_count > 0 {
            let failures = self.request_count - self.success_count;
            self.error_rate = failures as f64 / self.request_count as f64;
        }
    }
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Complete status information for a node
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    /// Node network endpoint (e.g., "node1.example.com:2424")
    pub endpoint: String,

    /// Unique node name
    pub node_id: String,

    /// Numeric node identifier, embedded in request ids
    pub node_index: u32,

    /// Current health state
    pub health: NodeHealth,

    /// Performance metrics
    pub metrics: NodeMetrics,

    /// Replica status per database name
    pub databases: HashMap<String, DatabaseStatus>,

    /// Last health change timestamp
    #[serde(with = "instant_serialization")]
    pub last_check: Instant,

    /// When this node was first discovered
    #[serde(with = "instant_serialization")]
    pub first_seen: Instant,
}

impl NodeStatus {
    /// Create a new NodeStatus
    pub fn new(endpoint: String, node_id: String, node_index: u32) -> Self {
        let now = Instant::now();
        Self {
            endpoint,
            node_id,
            node_index,
            health: NodeHealth::Unknown,
            metrics: NodeMetrics::new(),
            databases: HashMap::new(),
            last_check: now,
            first_seen: now,
        }
    }

    /// Update health status
    pub fn set_health(&mut self, health: NodeHealth) {
        self.health = health;
        self.last_check = Instant::now();
    }

    /// Status of a database on this node
    pub fn database_status(&self, database: &str) -> DatabaseStatus {
        self.databases.get(database).copied().unwrap_or_default()
    }
}

/// Membership change published by the topology
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyEvent {
    /// A node joined the cluster
    NodeJoined { node_id: String },

    /// A node was removed from the cluster
    NodeLeft { node_id: String },

    /// A node's health changed
    HealthChanged { node_id: String, health: NodeHealth },

    /// A database replica changed status on a node
    DatabaseStatusChanged {
        node_id: String,
        database: String,
        status: DatabaseStatus,
    },
}

/// Configuration for the topology system
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// Cluster identifier
    pub cluster_id: String,

    /// Health check interval in seconds
    pub health_check_interval_secs: u64,

    /// Number of consecutive failures before marking node as offline
    pub failure_threshold: u32,

    /// Latency threshold for marking node as degraded (ms)
    pub degraded_latency_threshold_ms: u64,

    /// Error rate threshold for marking node as degraded (0.0-1.0)
    pub degraded_error_rate_threshold: f64,

    /// Capacity of the topology event channel
    pub event_capacity: usize,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            cluster_id: String::from("default-cluster"),
            health_check_interval_secs: 5,
            failure_threshold: 3,
            degraded_latency_threshold_ms: 1000,
            degraded_error_rate_threshold: 0.1,
            event_capacity: 256,
        }
    }
}

/// Cluster-wide statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClusterStats {
    /// Total number of nodes in the topology
    pub total_nodes: usize,

    /// Number of healthy nodes
    pub healthy_nodes: usize,

    /// Number of degraded nodes
    pub degraded_nodes: usize,

    /// Number of unreachable nodes
    pub unreachable_nodes: usize,

    /// Number of offline nodes
    pub offline_nodes: usize,

    /// Number of suspended nodes
    pub suspended_nodes: usize,

    /// Number of nodes with unknown status
    pub unknown_nodes: usize,

    /// Average latency across all nodes with samples (ms)
    pub avg_latency_ms: Option<u64>,

    /// Average error rate across all nodes
    pub avg_error_rate: f64,
}

impl ClusterStats {
    /// Nodes that are not known to be failed
    pub fn reachable_nodes(&self) -> usize {
        self.healthy_nodes + self.degraded_nodes + self.unknown_nodes
    }
}

/// Helper module for Instant serialization
mod instant_serialization {
    use serde::Serializer;
    use std::time::Instant;

    pub fn serialize<S>(instant: &Instant, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        // Serialize as elapsed time since creation
        let elapsed = instant.elapsed().as_secs();
        serializer.serialize_u64(elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_health_is_operational() {
        assert!(NodeHealth::Healthy.is_operational());
        assert!(NodeHealth::Degraded.is_operational());
        assert!(!NodeHealth::Unreachable.is_operational());
        assert!(
            !NodeHealth::Offline {
                since: Utc::now(),
                failure_count: 1
            }
            .is_operational()
        );
        assert!(!NodeHealth::Unknown.is_failed());
    }

    #[test]
    fn test_database_status_activity() {
        assert!(DatabaseStatus::Online.is_active());
        assert!(DatabaseStatus::Synchronizing.is_active());
        assert!(DatabaseStatus::Backup.is_resynchronizing());
        assert!(!DatabaseStatus::NotAvailable.is_active());
        assert!(!DatabaseStatus::Offline.is_active());
    }

    #[test]
    fn test_node_metrics_error_rate() {
        let mut metrics = NodeMetrics::new();

        metrics.record_success(100);
        assert_eq!(metrics.error_rate, 0.0);

        metrics.record_failure();
        assert!(metrics.error_rate > 0.0);
        assert_eq!(metrics.request_count, 2);
        assert_eq!(metrics.success_count, 1);
    }

    #[test]
    fn test_unknown_database_defaults_to_not_available() {
        let status = NodeStatus::new("localhost:2424".to_string(), "node1".to_string(), 1);
        assert_eq!(status.database_status("orders"), DatabaseStatus::NotAvailable);
    }
}
