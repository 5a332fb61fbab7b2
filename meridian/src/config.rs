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

use anyhow::{Context, Result, ensure};
use meridian_replication::ReplicationConfig;
use meridian_topology::TopologyConfig;
use serde::{Deserialize, Serialize};

/// Configuration of one replication node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Unique node name
    pub name: String,

    /// Numeric identity embedded in request ids; unique and non-zero
    pub index: u32,

    /// Address other nodes reach this one at
    pub endpoint: String,

    pub topology: TopologyConfig,

    pub replication: ReplicationConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: String::from("node1"),
            index: 1,
            endpoint: String::from("127.0.0.1:2424"),
            topology: TopologyConfig::default(),
            replication: ReplicationConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn new(name: impl Into<String>, index: u32) -> Self {
        let name = name.into();
        Self {
            endpoint: format!("local://{name}"),
            name,
            index,
            ..Self::default()
        }
    }

    pub fn from_json(document: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(document).context("Invalid node configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.name.is_empty(), "node name must not be empty");
        ensure!(self.index > 0, "node index must be positive");
        ensure!(self.replication.worker_lanes > 0, "at least one worker lane is required");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_json_with_defaults() {
        let config = NodeConfig::from_json(
            r#"{
                "name": "node2",
                "index": 2,
                "replication": { "sync_timeout_ms": 2000, "repairer": { "batch_size": 10 } }
            }"#,
        )
        .expect("valid configuration");

        assert_eq!(config.name, "node2");
        assert_eq!(config.replication.sync_timeout_ms, 2000);
        assert_eq!(config.replication.repairer.batch_size, 10);
        assert_eq!(config.replication.worker_lanes, ReplicationConfig::default().worker_lanes);
        assert_eq!(config.topology.failure_threshold, 3);
    }

    #[test]
    fn test_rejects_zero_index() {
        assert!(NodeConfig::from_json(r#"{ "name": "node1", "index": 0 }"#).is_err());
        assert!(NodeConfig::from_json("not json").is_err());
    }
}
