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

//! Distributed database configuration
//!
//! Describes which servers own each record cluster, the role of every server
//! and the quorum settings used for replicated reads and writes. The document
//! format follows the JSON layout operators already write:
//!
//! ```json
//! {
//!   "readQuorum": 1,
//!   "writeQuorum": "majority",
//!   "readYourWrites": true,
//!   "executionMode": "synchronous",
//!   "servers": { "*": "master", "node3": "replica" },
//!   "clusters": {
//!     "*": { "servers": ["node1", "node2", "node3"] },
//!     "audit": { "servers": ["node2", "node1"], "writeQuorum": "all" }
//!   }
//! }
//! ```

use anyhow::{Context, Result};
use meridian_quorum::{QuorumSetting, QuorumVerifier};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Key matching every cluster or every server without an explicit entry
pub const ALL_WILDCARD: &str = "*";

/// Role of a server for a database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ServerRole {
    /// Accepts writes and counts toward the write quorum
    #[default]
    Master,

    /// Read-only copy, never counted in the write quorum
    Replica,
}

/// How writes are propagated when the caller does not ask for a mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationMode {
    /// Wait for the quorum before returning
    #[default]
    Synchronous,

    /// Return after the local write, replicate in the background
    Asynchronous,
}

/// Per-cluster ownership and quorum overrides
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterConfig {
    /// Servers owning the cluster; the first one is the owner
    pub servers: Vec<String>,

    /// Read quorum override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_quorum: Option<QuorumSetting>,

    /// Write quorum override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub write_quorum: Option<QuorumSetting>,
}

/// Replication configuration of one database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseConfig {
    /// Default read quorum
    pub read_quorum: QuorumSetting,

    /// Default write quorum, computed over master servers
    pub write_quorum: QuorumSetting,

    /// Wait for the local node's own answer before declaring a quorum
    pub read_your_writes: bool,

    /// Default replication mode
    pub execution_mode: ReplicationMode,

    /// Server roles; `*` applies to servers without an explicit entry
    pub servers: BTreeMap<String, ServerRole>,

    /// Cluster ownership; `*` applies to clusters without an explicit entry
    pub clusters: BTreeMap<String, ClusterConfig>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            read_quorum: QuorumSetting::Fixed(1),
            write_quorum: QuorumSetting::Majority,
            read_your_writes: true,
            execution_mode: ReplicationMode::Synchronous,
            servers: BTreeMap::new(),
            clusters: BTreeMap::new(),
        }
    }
}

impl DatabaseConfig {
    /// Build a configuration where every cluster is owned by `servers`
    pub fn with_servers<I, S>(servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut config = Self::default();
        config.clusters.insert(
            ALL_WILDCARD.to_string(),
            ClusterConfig {
                servers: servers.into_iter().map(Into::into).collect(),
                ..ClusterConfig::default()
            },
        );
        config
    }

    /// Parse the JSON configuration document
    pub fn from_json(document: &str) -> Result<Self> {
        serde_json::from_str(document).context("Failed to parse distributed database configuration")
    }

    /// Serialize the configuration back to JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize distributed database configuration")
    }

    fn cluster(&self, cluster_name: &str) -> Option<&ClusterConfig> {
        self.clusters
            .get(cluster_name)
            .or_else(|| self.clusters.get(ALL_WILDCARD))
    }

    /// Servers owning a cluster, owner first
    pub fn cluster_servers(&self, cluster_name: &str) -> Vec<String> {
        self.cluster(cluster_name)
            .map(|cluster| cluster.servers.clone())
            .unwrap_or_default()
    }

    /// Server owning a cluster, i.e. the first configured server
    pub fn cluster_owner(&self, cluster_name: &str) -> Option<&str> {
        self.cluster(cluster_name)
            .and_then(|cluster| cluster.servers.first())
            .map(String::as_str)
    }

    /// Union of the servers owning any of the given clusters
    pub fn servers_for_clusters<'a, I>(&self, clusters: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        clusters
            .into_iter()
            .flat_map(|name| self.cluster_servers(name))
            .collect()
    }

    /// Every server mentioned by the configuration
    pub fn all_servers(&self) -> BTreeSet<String> {
        self.clusters
            .values()
            .flat_map(|cluster| cluster.servers.iter().cloned())
            .collect()
    }

    /// Role of a server, falling back to the `*` entry and then to master
    pub fn server_role(&self, server: &str) -> ServerRole {
        self.servers
            .get(server)
            .or_else(|| self.servers.get(ALL_WILDCARD))
            .copied()
            .unwrap_or_default()
    }

    /// Returns true if the server accepts writes
    pub fn is_master(&self, server: &str) -> bool {
        self.server_role(server) == ServerRole::Master
    }

    /// Number of masters among the given servers
    pub fn master_count<'a, I>(&self, servers: I) -> usize
    where
        I: IntoIterator<Item = &'a String>,
    {
        servers.into_iter().filter(|server| self.is_master(server)).count()
    }

    /// Quorum verifier for one cluster, honouring per-cluster overrides
    pub fn quorum_verifier(&self, cluster_name: &str) -> QuorumVerifier {
        let cluster = self.cluster(cluster_name);
        let read = cluster.and_then(|c| c.read_quorum).unwrap_or(self.read_quorum);
        let write = cluster.and_then(|c| c.write_quorum).unwrap_or(self.write_quorum);
        QuorumVerifier::new(read, write)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCUMENT: &str = r#"{
        "readQuorum": 1,
        "writeQuorum": "majority",
        "readYourWrites": false,
        "executionMode": "asynchronous",
        "servers": { "*": "master", "node3": "replica" },
        "clusters": {
            "*": { "servers": ["node1", "node2", "node3"] },
            "audit": { "servers": ["node2", "node1"], "writeQuorum": "all" }
        }
    }"#;

    #[test]
    fn test_parse_document() {
        let config = DatabaseConfig::from_json(DOCUMENT).unwrap();

        assert!(!config.read_your_writes);
        assert_eq!(config.execution_mode, ReplicationMode::Asynchronous);
        assert_eq!(config.cluster_owner("person"), Some("node1"));
        assert_eq!(config.cluster_owner("audit"), Some("node2"));
        assert_eq!(config.server_role("node3"), ServerRole::Replica);
        assert_eq!(config.server_role("node1"), ServerRole::Master);
    }

    #[test]
    fn test_servers_for_clusters() {
        let config = DatabaseConfig::from_json(DOCUMENT).unwrap();
        let clusters = vec!["audit".to_string(), "person".to_string()];

        let servers = config.servers_for_clusters(&clusters);
        assert_eq!(servers.len(), 3);
        assert_eq!(config.master_count(&servers), 2);
    }

    #[test]
    fn test_cluster_quorum_override() {
        let config = DatabaseConfig::from_json(DOCUMENT).unwrap();

        assert_eq!(config.quorum_verifier("person").write_quorum(3), 2);
        assert_eq!(config.quorum_verifier("audit").write_quorum(3), 3);
    }

    #[test]
    fn test_defaults() {
        let config = DatabaseConfig::with_servers(["a", "b"]);

        assert_eq!(config.read_quorum, QuorumSetting::Fixed(1));
        assert_eq!(config.write_quorum, QuorumSetting::Majority);
        assert!(config.read_your_writes);
        assert_eq!(config.cluster_servers("anything"), vec!["a", "b"]);

        let reparsed = DatabaseConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(reparsed, config);
    }
}
