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

//! Replication tuning knobs

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration of the replication core of one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Number of sequential execution lanes per database
    pub worker_lanes: usize,

    /// Capacity of every lane queue
    pub lane_queue_capacity: usize,

    /// Capacity of the asynchronous replication queue
    pub async_queue_capacity: usize,

    /// How long a synchronous request waits for its quorum (ms)
    pub sync_timeout_ms: u64,

    /// Longest single wait before reachability is re-evaluated (ms)
    pub quorum_check_interval_ms: u64,

    /// Grace added to the sync timeout when judging recent topology changes (ms)
    pub additional_cluster_shape_timeout_ms: u64,

    /// Attempts to acquire a record lock or to resend a locked transaction
    pub lock_retries: u32,

    /// Delay between attempts (ms)
    pub lock_retry_delay_ms: u64,

    /// Age after which a replica transaction context is rolled back (ms)
    pub tx_timeout_ms: u64,

    /// Interval of the expiry timers (ms)
    pub purge_interval_ms: u64,

    /// Age after which a pending request stops accepting late responses (ms)
    pub request_ttl_ms: u64,

    /// How long shutdown waits for running lanes (ms)
    pub shutdown_grace_ms: u64,

    /// Interval between heartbeats to the other nodes (ms)
    pub heartbeat_interval_ms: u64,

    pub repairer: RepairerConfig,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            worker_lanes: 8,
            lane_queue_capacity: 1024,
            async_queue_capacity: 512,
            sync_timeout_ms: 15_000,
            quorum_check_interval_ms: 10_000,
            additional_cluster_shape_timeout_ms: 10_000,
            lock_retries: 10,
            lock_retry_delay_ms: 100,
            tx_timeout_ms: 30_000,
            purge_interval_ms: 5_000,
            request_ttl_ms: 60_000,
            shutdown_grace_ms: 5_000,
            heartbeat_interval_ms: 2_000,
            repairer: RepairerConfig::default(),
        }
    }
}

impl ReplicationConfig {
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn quorum_check_interval(&self) -> Duration {
        Duration::from_millis(self.quorum_check_interval_ms.max(1))
    }

    pub fn additional_cluster_shape_timeout(&self) -> Duration {
        Duration::from_millis(self.additional_cluster_shape_timeout_ms)
    }

    pub fn lock_retry_delay(&self) -> Duration {
        Duration::from_millis(self.lock_retry_delay_ms)
    }

    pub fn tx_timeout(&self) -> Duration {
        Duration::from_millis(self.tx_timeout_ms)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_millis(self.purge_interval_ms.max(1))
    }

    pub fn request_ttl(&self) -> Duration {
        Duration::from_millis(self.request_ttl_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }
}

/// Configuration of the background repairer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairerConfig {
    pub enabled: bool,

    /// Interval between repair cycles (ms)
    pub check_interval_ms: u64,

    /// Most records repaired per cycle
    pub batch_size: usize,

    /// Lock attempts per record; repair waits less than client requests
    pub lock_retries: u32,

    pub lock_retry_delay_ms: u64,

    /// Conflict resolvers, tried in order
    pub resolvers: Vec<String>,
}

impl Default for RepairerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_ms: 1_000,
            batch_size: 50,
            lock_retries: 3,
            lock_retry_delay_ms: 50,
            resolvers: vec!["quorum".to_string(), "majority".to_string(), "version".to_string()],
        }
    }
}

impl RepairerConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms.max(1))
    }

    pub fn lock_retry_delay(&self) -> Duration {
        Duration::from_millis(self.lock_retry_delay_ms)
    }
}
