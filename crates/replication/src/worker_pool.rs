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

//! Partitioned worker pool
//!
//! A fixed set of lanes, each a tokio task draining a bounded queue in FIFO
//! order. Requests of one partition run one after the other while distinct
//! partitions progress in parallel. A full lane blocks the producer.

use crate::error::ReplicationError;
use crate::message::Request;
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Executes the requests of a lane
#[async_trait]
pub trait LaneHandler: Send + Sync + 'static {
    async fn handle(&self, lane: usize, request: Request) -> Result<(), ReplicationError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LaneState {
    Running = 0,
    Draining = 1,
    Stopped = 2,
}

impl LaneState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LaneState::Running,
            1 => LaneState::Draining,
            _ => LaneState::Stopped,
        }
    }
}

enum LaneJob {
    Execute {
        request: Request,
        done: Option<oneshot::Sender<Result<(), ReplicationError>>>,
    },
    Barrier {
        reached: oneshot::Sender<()>,
    },
}

struct Lane {
    sender: mpsc::Sender<LaneJob>,
    state: Arc<AtomicU8>,
    pending: Arc<AtomicUsize>,
    processed: Arc<AtomicU64>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Snapshot of one lane
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaneStats {
    pub lane: usize,
    pub state: LaneState,
    pub pending: usize,
    pub processed: u64,
}

pub struct PartitionedWorkerPool {
    name: String,
    lanes: Vec<Lane>,
    cancel: CancellationToken,
}

impl PartitionedWorkerPool {
    /// Spawn `lanes` lanes with queues of `capacity` each
    pub fn new(name: &str, lanes: usize, capacity: usize, handler: Arc<dyn LaneHandler>) -> Self {
        let cancel = CancellationToken::new();
        let lanes = (0..lanes.max(1))
            .map(|index| Self::spawn_lane(name, index, capacity.max(1), Arc::clone(&handler), cancel.child_token()))
            .collect();

        info!(pool = %name, "Worker pool started");
        Self {
            name: name.to_string(),
            lanes,
            cancel,
        }
    }

    fn spawn_lane(
        name: &str,
        index: usize,
        capacity: usize,
        handler: Arc<dyn LaneHandler>,
        cancel: CancellationToken,
    ) -> Lane {
        let (sender, mut receiver) = mpsc::channel::<LaneJob>(capacity);
        let state = Arc::new(AtomicU8::new(LaneState::Running as u8));
        let pending = Arc::new(AtomicUsize::new(0));
        let processed = Arc::new(AtomicU64::new(0));

        let lane_state = Arc::clone(&state);
        let lane_pending = Arc::clone(&pending);
        let lane_processed = Arc::clone(&processed);
        let pool = name.to_string();

        let handle = tokio::spawn(async move {
            loop {
                let job = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    job = receiver.recv() => match job {
                        Some(job) => job,
                        None => break,
                    },
                };

                match job {
                    LaneJob::Execute { request, done } => {
                        let request_id = request.id;
                        let result = handler.handle(index, request).await;
                        if let Err(e) = &result {
                            error!(pool = %pool, lane = index, request = %request_id, error = %e, "Lane failed to execute request");
                        }
                        lane_pending.fetch_sub(1, Ordering::SeqCst);
                        lane_processed.fetch_add(1, Ordering::Relaxed);
                        if let Some(done) = done {
                            let _ = done.send(result);
                        }
                    }
                    LaneJob::Barrier { reached } => {
                        lane_pending.fetch_sub(1, Ordering::SeqCst);
                        lane_processed.fetch_add(1, Ordering::Relaxed);
                        let _ = reached.send(());
                    }
                }
            }

            receiver.close();
            let mut abandoned = 0usize;
            while let Ok(job) = receiver.try_recv() {
                abandoned += 1;
                lane_pending.fetch_sub(1, Ordering::SeqCst);
                if let LaneJob::Execute { done: Some(done), .. } = job {
                    let _ = done.send(Err(ReplicationError::ShuttingDown));
                }
            }
            if abandoned > 0 {
                warn!(pool = %pool, lane = index, abandoned, "Lane stopped with queued requests");
            }

            lane_state.store(LaneState::Stopped as u8, Ordering::SeqCst);
            debug!(pool = %pool, lane = index, "Lane stopped");
        });

        Lane {
            sender,
            state,
            pending,
            processed,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    /// Lane serving a non-negative partition key
    pub fn lane_for(&self, key: i32) -> usize {
        (key.unsigned_abs() as usize) % self.lanes.len()
    }

    fn lane(&self, index: usize) -> Result<&Lane, ReplicationError> {
        self.lanes
            .get(index)
            .ok_or_else(|| ReplicationError::Configuration(format!("lane {index} out of range")))
    }

    async fn push(&self, index: usize, job: LaneJob) -> Result<(), ReplicationError> {
        let lane = self.lane(index)?;
        if LaneState::from_u8(lane.state.load(Ordering::SeqCst)) != LaneState::Running {
            return Err(ReplicationError::ShuttingDown);
        }

        lane.pending.fetch_add(1, Ordering::SeqCst);
        if lane.sender.send(job).await.is_err() {
            lane.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(ReplicationError::ShuttingDown);
        }
        Ok(())
    }

    /// Queue a request on a lane, waiting while the lane is full
    pub async fn enqueue(&self, index: usize, request: Request) -> Result<(), ReplicationError> {
        self.push(index, LaneJob::Execute { request, done: None }).await
    }

    /// Queue a request on a lane and wait until it ran
    pub async fn execute_on(&self, index: usize, request: Request) -> Result<(), ReplicationError> {
        let (done, finished) = oneshot::channel();
        self.push(
            index,
            LaneJob::Execute {
                request,
                done: Some(done),
            },
        )
        .await?;
        finished.await.map_err(|_| ReplicationError::ShuttingDown)?
    }

    /// Wait until every busy lane among `lanes` drained what it had queued
    pub async fn barrier(&self, lanes: impl IntoIterator<Item = usize>) -> Result<(), ReplicationError> {
        let mut waiters = Vec::new();
        for index in lanes {
            if self.lane(index)?.pending.load(Ordering::SeqCst) == 0 {
                continue;
            }
            let (reached, waiter) = oneshot::channel();
            self.push(index, LaneJob::Barrier { reached }).await?;
            waiters.push(waiter);
        }

        for reached in join_all(waiters).await {
            reached.map_err(|_| ReplicationError::ShuttingDown)?;
        }
        Ok(())
    }

    pub fn stats(&self) -> Vec<LaneStats> {
        self.lanes
            .iter()
            .enumerate()
            .map(|(lane, state)| LaneStats {
                lane,
                state: LaneState::from_u8(state.state.load(Ordering::SeqCst)),
                pending: state.pending.load(Ordering::SeqCst),
                processed: state.processed.load(Ordering::Relaxed),
            })
            .collect()
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Stop every lane, abandoning queued requests
    ///
    /// A request already executing finishes unless `grace` runs out first.
    pub async fn shutdown(&self, grace: Duration) {
        if self.cancel.is_cancelled() {
            return;
        }
        info!(pool = %self.name, "Shutting down worker pool");

        for lane in &self.lanes {
            let _ = lane.state.compare_exchange(
                LaneState::Running as u8,
                LaneState::Draining as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }
        self.cancel.cancel();

        let handles: Vec<_> = self.lanes.iter().filter_map(|lane| lane.handle.lock().take()).collect();
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(grace, join_all(handles)).await.is_err() {
            warn!(pool = %self.name, "Lanes did not stop within the grace period, aborting");
            for abort in aborts {
                abort.abort();
            }
        }

        for lane in &self.lanes {
            lane.state.store(LaneState::Stopped as u8, Ordering::SeqCst);
        }
    }
}

impl Drop for PartitionedWorkerPool {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{RecordId, RequestId};
    use crate::message::ExecutionMode;
    use crate::task::Task;
    use meridian_quorum::QuorumType;
    use std::collections::BTreeSet;

    fn request(sequence: u64) -> Request {
        Request {
            id: RequestId::new(1, sequence),
            sender: "node1".to_string(),
            database: "db".to_string(),
            clusters: BTreeSet::new(),
            task: Task::ReadRecord {
                rid: RecordId::new(0, sequence as i64),
            },
            execution_mode: ExecutionMode::NoResponse,
            quorum_type: QuorumType::None,
        }
    }

    struct Recorder {
        seen: Mutex<Vec<(usize, u64)>>,
        delay: Duration,
    }

    #[async_trait]
    impl LaneHandler for Recorder {
        async fn handle(&self, lane: usize, request: Request) -> Result<(), ReplicationError> {
            tokio::time::sleep(self.delay).await;
            self.seen.lock().push((lane, request.id.sequence));
            if request.id.sequence == 13 {
                return Err(ReplicationError::Canceled);
            }
            Ok(())
        }
    }

    fn recorder(delay: Duration) -> Arc<Recorder> {
        Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            delay,
        })
    }

    #[tokio::test]
    async fn test_fifo_per_lane() {
        let handler = recorder(Duration::from_millis(1));
        let pool = PartitionedWorkerPool::new("test", 2, 16, handler.clone());

        for sequence in 1..=6 {
            pool.enqueue(0, request(sequence)).await.unwrap();
        }
        pool.barrier([0]).await.unwrap();

        let seen: Vec<u64> = handler.seen.lock().iter().map(|(_, seq)| *seq).collect();
        assert_eq!(seen, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(pool.stats()[0].processed, 7);
    }

    #[tokio::test]
    async fn test_lane_survives_handler_error() {
        let handler = recorder(Duration::ZERO);
        let pool = PartitionedWorkerPool::new("test", 1, 4, handler.clone());

        assert!(pool.execute_on(0, request(13)).await.is_err());
        pool.execute_on(0, request(14)).await.unwrap();
        assert_eq!(handler.seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_barrier_skips_idle_lanes() {
        let handler = recorder(Duration::from_millis(30));
        let pool = PartitionedWorkerPool::new("test", 4, 4, handler.clone());

        pool.enqueue(2, request(1)).await.unwrap();
        pool.barrier(0..4).await.unwrap();

        assert_eq!(handler.seen.lock().as_slice(), &[(2, 1)]);
        assert!(pool.stats().iter().all(|lane| lane.pending == 0));
    }

    #[tokio::test]
    async fn test_shutdown_stops_lanes() {
        let handler = recorder(Duration::from_millis(50));
        let pool = PartitionedWorkerPool::new("test", 2, 16, handler.clone());

        for sequence in 1..=5 {
            pool.enqueue(1, request(sequence)).await.unwrap();
        }
        pool.shutdown(Duration::from_secs(1)).await;

        assert!(pool.stats().iter().all(|lane| lane.state == LaneState::Stopped));
        assert!(handler.seen.lock().len() < 5);
        assert!(matches!(
            pool.enqueue(0, request(9)).await,
            Err(ReplicationError::ShuttingDown)
        ));
    }
}
