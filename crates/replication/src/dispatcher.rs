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

//! Routes inbound requests to lanes
//!
//! Partitioned requests share the dispatch gate and go to the lane of their
//! cluster. Multi-partition and cluster-wide requests take the gate
//! exclusively, wait for the lanes involved to drain and then run alone.
//! Must not be called from inside a lane.

use crate::error::ReplicationError;
use crate::message::Request;
use crate::task::PartitionKey;
use crate::worker_pool::{LaneStats, PartitionedWorkerPool};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

pub struct RequestDispatcher {
    pool: PartitionedWorkerPool,
    gate: RwLock<()>,
}

impl RequestDispatcher {
    pub fn new(pool: PartitionedWorkerPool) -> Self {
        Self {
            pool,
            gate: RwLock::new(()),
        }
    }

    pub async fn dispatch(&self, request: Request) -> Result<(), ReplicationError> {
        match request.task.partition_key() {
            PartitionKey::Single(key) if key >= 0 => {
                let _shared = self.gate.read().await;
                let lane = self.pool.lane_for(key);
                self.pool.enqueue(lane, request).await
            }
            PartitionKey::Many(keys) => {
                let lanes: BTreeSet<usize> = keys.iter().map(|key| self.pool.lane_for(*key)).collect();
                let first = lanes.iter().next().copied().unwrap_or(0);

                let _exclusive = self.gate.write().await;
                debug!(request = %request.id, lanes = ?lanes, "Multi-partition request, waiting for lanes");
                self.pool.barrier(lanes).await?;
                self.pool.execute_on(first, request).await
            }
            _ => {
                let _exclusive = self.gate.write().await;
                debug!(request = %request.id, task = request.task.name(), "Cluster-wide request, waiting for every lane");
                self.pool.barrier(0..self.pool.lane_count()).await?;
                self.pool.execute_on(0, request).await
            }
        }
    }

    pub fn lane_stats(&self) -> Vec<LaneStats> {
        self.pool.stats()
    }

    pub async fn shutdown(&self, grace: Duration) {
        self.pool.shutdown(grace).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{RecordId, RequestId};
    use crate::message::ExecutionMode;
    use crate::task::Task;
    use crate::worker_pool::LaneHandler;
    use async_trait::async_trait;
    use meridian_quorum::QuorumType;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request(sequence: u64, task: Task) -> Request {
        Request {
            id: RequestId::new(1, sequence),
            sender: "node1".to_string(),
            database: "db".to_string(),
            clusters: BTreeSet::new(),
            task,
            execution_mode: ExecutionMode::NoResponse,
            quorum_type: QuorumType::None,
        }
    }

    fn read(sequence: u64, cluster: i32) -> Request {
        request(
            sequence,
            Task::ReadRecord {
                rid: RecordId::new(cluster, 0),
            },
        )
    }

    /// Tracks how many requests run at once and what the barrier saw
    #[derive(Default)]
    struct Tracker {
        in_flight: AtomicUsize,
        observed_by_barrier: Mutex<Vec<usize>>,
        order: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl LaneHandler for Tracker {
        async fn handle(&self, _lane: usize, request: Request) -> Result<(), ReplicationError> {
            let running = self.in_flight.fetch_add(1, Ordering::SeqCst);
            if matches!(request.task, Task::CreateCluster { .. }) {
                self.observed_by_barrier.lock().push(running);
            } else {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            self.order.lock().push(request.id.sequence);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_barrier_runs_alone() {
        let tracker = Arc::new(Tracker::default());
        let dispatcher = RequestDispatcher::new(PartitionedWorkerPool::new("db", 4, 16, tracker.clone()));

        for sequence in 0..8u64 {
            dispatcher.dispatch(read(sequence, sequence as i32)).await.unwrap();
        }
        dispatcher
            .dispatch(request(100, Task::CreateCluster { name: "audit".into() }))
            .await
            .unwrap();

        // every partitioned request finished before the cluster-wide one ran
        assert_eq!(tracker.observed_by_barrier.lock().as_slice(), &[0]);
        assert_eq!(tracker.order.lock().len(), 9);
        assert_eq!(tracker.order.lock().last(), Some(&100));
    }

    #[tokio::test]
    async fn test_same_partition_keeps_order() {
        let tracker = Arc::new(Tracker::default());
        let dispatcher = RequestDispatcher::new(PartitionedWorkerPool::new("db", 3, 16, tracker.clone()));

        for sequence in 1..=5u64 {
            dispatcher.dispatch(read(sequence, 4)).await.unwrap();
        }
        dispatcher
            .dispatch(request(
                6,
                Task::RepairRecords {
                    rids: vec![RecordId::new(4, 0), RecordId::new(5, 0)],
                },
            ))
            .await
            .unwrap();

        assert_eq!(tracker.order.lock().as_slice(), &[1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn test_dispatch_after_shutdown() {
        let tracker = Arc::new(Tracker::default());
        let dispatcher = RequestDispatcher::new(PartitionedWorkerPool::new("db", 2, 4, tracker));

        dispatcher.shutdown(Duration::from_millis(100)).await;
        assert!(matches!(
            dispatcher.dispatch(read(1, 0)).await,
            Err(ReplicationError::ShuttingDown)
        ));
    }
}
