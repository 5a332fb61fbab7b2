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

//! # Meridian Topology Management
//!
//! Cluster membership and per-database replica state for meridian nodes.
//! Tracks node health, exchange metrics, which databases every node is
//! serving and the distributed configuration deciding who owns each record
//! cluster.
//!
//! ## Example
//!
//! ```rust,no_run
//! use meridian_topology::{DatabaseStatus, SystemTopology, TopologyConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let topology = SystemTopology::new("cluster-1", TopologyConfig::default()).await?;
//!     topology.register_node("node1".to_string(), 1, "10.0.0.1:2424".to_string()).await;
//!     topology.set_database_status("node1", "orders", DatabaseStatus::Online).await?;
//!
//!     assert!(topology.is_node_available("node1", "orders").await);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod health_monitor;
pub mod topology;
pub mod types;

pub use config::{ALL_WILDCARD, ClusterConfig, DatabaseConfig, ReplicationMode, ServerRole};
pub use health_monitor::HealthMonitor;
pub use topology::SystemTopology;
pub use types::*;
