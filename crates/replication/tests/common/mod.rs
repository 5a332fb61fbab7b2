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

//! In-process cluster used by the integration tests

#![allow(dead_code)]

use meridian_replication::memory::{LocalNetwork, LocalTransport, MemoryStorage};
use meridian_replication::{
    DistributedDatabase, RawRecord, RecordId, RepairerConfig, ReplicationConfig, ReplicationContext, ReplicationServer,
};
use meridian_topology::{DatabaseConfig, SystemTopology, TopologyConfig};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub const DB: &str = "inventory";

/// Cluster ids of [`MemoryStorage::with_clusters`] for the clusters below
pub const PERSON: i32 = 0;
pub const AUDIT: i32 = 1;

pub struct TestNode {
    pub name: String,
    pub server: Arc<ReplicationServer>,
    pub storage: Arc<MemoryStorage>,
    pub database: Arc<DistributedDatabase>,
    pub transport: Arc<LocalTransport>,
}

impl TestNode {
    pub async fn read(&self, rid: RecordId) -> Option<RawRecord> {
        use meridian_replication::Storage;
        self.storage.read(rid).await.expect("read from memory storage")
    }
}

pub struct TestCluster {
    pub network: Arc<LocalNetwork>,
    pub topology: Arc<SystemTopology>,
    pub nodes: Vec<TestNode>,
}

impl TestCluster {
    pub async fn start(names: &[&str]) -> Self {
        Self::start_with(names, DatabaseConfig::with_servers(names.iter().copied())).await
    }

    pub async fn start_with(names: &[&str], database_config: DatabaseConfig) -> Self {
        let topology = Arc::new(
            SystemTopology::new("test-cluster", TopologyConfig::default())
                .await
                .expect("Failed to create topology"),
        );
        let network = LocalNetwork::new(256);
        let config = Arc::new(fast_config());

        let mut nodes = Vec::with_capacity(names.len());
        for (index, name) in names.iter().enumerate() {
            let node_index = index as u32 + 1;
            topology
                .register_node(name.to_string(), node_index, format!("local://{name}"))
                .await;

            let transport = network.join(name);
            let context = ReplicationContext::new(
                *name,
                node_index,
                Arc::clone(&config),
                Arc::clone(&topology),
                transport.clone(),
            );
            let server = ReplicationServer::new(context);
            network.attach(name, server.clone());

            let storage = Arc::new(MemoryStorage::with_clusters(&["person", "audit"]));
            let database = server
                .open_database(DB, storage.clone(), database_config.clone())
                .await
                .expect("Failed to open database");

            nodes.push(TestNode {
                name: name.to_string(),
                server,
                storage,
                database,
                transport,
            });
        }

        Self {
            network,
            topology,
            nodes,
        }
    }

    pub fn node(&self, name: &str) -> &TestNode {
        self.nodes
            .iter()
            .find(|node| node.name == name)
            .expect("unknown test node")
    }

    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.server.shutdown().await;
        }
    }
}

/// Short timeouts; the repairer runs only when a test asks for a cycle
pub fn fast_config() -> ReplicationConfig {
    ReplicationConfig {
        worker_lanes: 4,
        sync_timeout_ms: 500,
        quorum_check_interval_ms: 20,
        additional_cluster_shape_timeout_ms: 0,
        lock_retries: 3,
        lock_retry_delay_ms: 10,
        tx_timeout_ms: 60_000,
        shutdown_grace_ms: 500,
        repairer: RepairerConfig {
            enabled: false,
            lock_retries: 2,
            lock_retry_delay_ms: 5,
            ..RepairerConfig::default()
        },
        ..ReplicationConfig::default()
    }
}

/// Poll `check` until it holds or a second has passed
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
