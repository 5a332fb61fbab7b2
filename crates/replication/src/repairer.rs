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

//! Background repair of divergent records
//!
//! Records suspected to differ between nodes are queued here. Every cycle
//! takes a batch, locks it, reads every involved node's copy and runs the
//! conflict resolver chain per record. Nodes holding a losing copy receive
//! the winner; records without a winner stay queued.

use crate::config::RepairerConfig;
use crate::conflict::{Candidate, ConflictContext, ConflictResolverChain};
use crate::context::{OutboundRequest, ReplicationContext};
use crate::error::ReplicationError;
use crate::executor::TaskExecutor;
use crate::id::{NodeId, RecordId, RequestId};
use crate::lock_table::LockGuard;
use crate::message::{Payload, RawRecord, TaskResult};
use crate::response::group_value;
use crate::task::Task;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairerStats {
    pub pending: usize,
    pub processed: u64,
    pub canceled: u64,
    pub failed_batches: u64,
}

pub struct BackgroundRepairer {
    database: String,
    context: ReplicationContext,
    executor: Arc<TaskExecutor>,
    config: RepairerConfig,
    chain: ConflictResolverChain,
    pending: DashMap<RecordId, Instant>,
    processed: AtomicU64,
    canceled: AtomicU64,
    failed_batches: AtomicU64,
    worker: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl BackgroundRepairer {
    pub fn new(
        database: impl Into<String>,
        context: ReplicationContext,
        executor: Arc<TaskExecutor>,
        config: RepairerConfig,
    ) -> Result<Self, ReplicationError> {
        let chain = ConflictResolverChain::from_names(&config.resolvers)?;
        Ok(Self {
            database: database.into(),
            context,
            executor,
            config,
            chain,
            pending: DashMap::new(),
            processed: AtomicU64::new(0),
            canceled: AtomicU64::new(0),
            failed_batches: AtomicU64::new(0),
            worker: Mutex::new(None),
        })
    }

    /// Queue a record for the next cycles
    pub fn enqueue_repair(&self, rid: RecordId) {
        if !rid.is_persistent() {
            return;
        }
        self.pending.entry(rid).or_insert_with(Instant::now);
    }

    pub fn cancel_repair(&self, rid: RecordId) -> bool {
        let removed = self.pending.remove(&rid).is_some();
        if removed {
            self.canceled.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    pub fn is_pending(&self, rid: RecordId) -> bool {
        self.pending.contains_key(&rid)
    }

    pub fn stats(&self) -> RepairerStats {
        RepairerStats {
            pending: self.pending.len(),
            processed: self.processed.load(Ordering::Relaxed),
            canceled: self.canceled.load(Ordering::Relaxed),
            failed_batches: self.failed_batches.load(Ordering::Relaxed),
        }
    }

    /// Start the periodic cycle; no-op when disabled or already running
    pub fn start(self: &Arc<Self>) {
        if !self.config.enabled {
            info!(database = %self.database, "Background repairer disabled");
            return;
        }
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let cancel = token.clone();
        let repairer = Arc::clone(self);
        let period = self.config.check_interval();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(err) = repairer.check().await {
                            warn!(database = %repairer.database, error = %err, "Repair cycle failed");
                        }
                    }
                }
            }
            debug!(database = %repairer.database, "Background repairer stopped");
        });
        *worker = Some((token, handle));
        info!(database = %self.database, interval_ms = period.as_millis() as u64, "Background repairer started");
    }

    pub async fn stop(&self) {
        let worker = self.worker.lock().take();
        if let Some((token, handle)) = worker {
            token.cancel();
            if let Err(err) = handle.await
                && !err.is_cancelled()
            {
                error!(database = %self.database, error = %err, "Background repairer panicked");
            }
        }
    }

    /// Run one repair cycle, returning how many records were settled
    pub async fn check(&self) -> Result<usize, ReplicationError> {
        let mut batch: Vec<RecordId> = self.pending.iter().map(|entry| *entry.key()).collect();
        if batch.is_empty() {
            return Ok(0);
        }
        batch.sort();
        batch.truncate(self.config.batch_size.max(1));

        let request_id = self.context.next_request_id();
        let locks = self.executor.locks();
        let _guard = LockGuard::new(Arc::clone(locks), request_id);
        let mut locked = Vec::with_capacity(batch.len());
        for rid in batch {
            match locks
                .lock_with_retry(rid, request_id, self.config.lock_retries, self.config.lock_retry_delay())
                .await
            {
                Ok(()) => locked.push(rid),
                Err(_) => debug!(database = %self.database, rid = %rid, "Record busy, repairing next cycle"),
            }
        }
        if locked.is_empty() {
            return Ok(0);
        }

        let storage = self.executor.storage();
        let mut clusters = BTreeSet::new();
        let mut local = Vec::with_capacity(locked.len());
        for rid in &locked {
            if let Some(name) = storage.cluster_name(rid.cluster_id).await {
                clusters.insert(name);
            }
            local.push(storage.read(*rid).await?);
        }

        let config = self.context.database_config(&self.database).await?;
        let mut remote = config.servers_for_clusters(&clusters);
        remote.remove(self.context.node());
        if remote.is_empty() {
            self.settle(&locked);
            return Ok(locked.len());
        }

        let involved = remote.len() + 1;
        let replicated = self
            .context
            .send_request(
                OutboundRequest::new(self.database.clone(), Task::RepairRecords { rids: locked.clone() })
                    .id(request_id)
                    .clusters(clusters.clone())
                    .targets(remote)
                    .local_result(Ok(TaskResult::Records(local)), Arc::clone(&self.executor)),
            )
            .await?;

        let copies = match replicated.response.map(|response| response.payload) {
            Some(Ok(TaskResult::Union(copies))) => copies,
            other => {
                self.failed_batches.fetch_add(1, Ordering::Relaxed);
                warn!(database = %self.database, response = ?other, "Unexpected repair read, trying later");
                return Ok(0);
            }
        };
        if copies.len() < involved {
            self.failed_batches.fetch_add(1, Ordering::Relaxed);
            info!(database = %self.database, answered = copies.len(), involved, "Not every node answered, repairing later");
            return Ok(0);
        }
        let Some(copies) = self.collect_copies(copies, locked.len()) else {
            self.failed_batches.fetch_add(1, Ordering::Relaxed);
            return Ok(0);
        };

        let mut fixes: BTreeMap<NodeId, Vec<Task>> = BTreeMap::new();
        let mut settled = Vec::new();
        for (index, rid) in locked.iter().enumerate() {
            let candidates = group_copies(&copies, index);
            if candidates.len() <= 1 {
                settled.push(*rid);
                continue;
            }

            let cluster = storage.cluster_name(rid.cluster_id).await.unwrap_or_default();
            let servers = config.cluster_servers(&cluster);
            let quorum = config
                .quorum_verifier(&cluster)
                .write_quorum(config.master_count(&servers));
            let conflict = ConflictContext {
                database: &self.database,
                cluster: &cluster,
                rid: *rid,
                quorum,
            };
            self.context.metrics().conflict();

            let Some(winner) = self.chain.resolve(&conflict, candidates.clone()) else {
                self.context.metrics().split_brain();
                error!(
                    database = %self.database,
                    rid = %rid,
                    copies = candidates.len(),
                    "Split brain on record, no copy wins"
                );
                continue;
            };

            for loser in candidates.iter().filter(|candidate| candidate.value != winner.value) {
                for node in &loser.nodes {
                    let fix = match &winner.value {
                        Some(record) => Task::FixUpdateRecord {
                            rid: *rid,
                            record: record.clone(),
                        },
                        None => Task::FixDeleteRecord { rid: *rid },
                    };
                    fixes.entry(node.clone()).or_default().push(fix);
                }
            }
            settled.push(*rid);
        }

        let fixed: usize = fixes.values().map(Vec::len).sum();
        if !self.send_fixes(request_id, &clusters, fixes).await {
            self.failed_batches.fetch_add(1, Ordering::Relaxed);
            return Ok(0);
        }

        self.context.metrics().records_repaired(fixed as u64);
        self.settle(&settled);
        info!(database = %self.database, settled = settled.len(), fixes = fixed, "Repair cycle completed");
        Ok(settled.len())
    }

    fn settle(&self, rids: &[RecordId]) {
        for rid in rids {
            self.pending.remove(rid);
        }
        self.processed.fetch_add(rids.len() as u64, Ordering::Relaxed);
    }

    /// Per node copies of the batch; `None` when any node failed to answer properly
    fn collect_copies(
        &self,
        copies: BTreeMap<NodeId, Payload>,
        expected: usize,
    ) -> Option<BTreeMap<NodeId, Vec<Option<RawRecord>>>> {
        let mut collected = BTreeMap::new();
        for (node, payload) in copies {
            match payload {
                Ok(TaskResult::Records(records)) if records.len() == expected => {
                    collected.insert(node, records);
                }
                Ok(other) => {
                    warn!(database = %self.database, node = %node, result = ?other, "Malformed repair read");
                    return None;
                }
                Err(err) => {
                    info!(database = %self.database, node = %node, error = %err, "Cannot repair records, trying later");
                    return None;
                }
            }
        }
        Some(collected)
    }

    /// Fixes go out bundled per node; true when every node acknowledged
    async fn send_fixes(
        &self,
        request_id: RequestId,
        clusters: &BTreeSet<String>,
        fixes: BTreeMap<NodeId, Vec<Task>>,
    ) -> bool {
        let mut deliveries = Vec::new();
        let mut local_ok = true;
        for (node, tasks) in fixes {
            self.context.metrics().fix_sent();
            if node == self.context.node() {
                for task in &tasks {
                    if let Err(err) = self.executor.apply(task).await {
                        error!(database = %self.database, task = task.name(), error = %err, "Local repair failed");
                        local_ok = false;
                    }
                }
                continue;
            }

            let partitions: Vec<i32> = tasks
                .iter()
                .flat_map(Task::partitions)
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            let task = Task::CompleteTransaction {
                transaction: request_id,
                success: false,
                fixes: tasks,
                partitions,
            };
            deliveries.push(async move {
                let acks = self
                    .context
                    .deliver(&self.database, clusters, BTreeSet::from([node.clone()]), task)
                    .await;
                let ok = matches!(acks.get(&node), Some(Ok(_)));
                if !ok {
                    warn!(database = %self.database, node = %node, "Repair not acknowledged");
                }
                ok
            });
        }
        join_all(deliveries).await.into_iter().all(|ok| ok) && local_ok
    }
}

/// Group the nodes by the copy of record `index` they hold
fn group_copies(copies: &BTreeMap<NodeId, Vec<Option<RawRecord>>>, index: usize) -> Vec<Candidate> {
    let mut candidates = Vec::new();
    for (node, records) in copies {
        group_value(&mut candidates, node.clone(), records.get(index).cloned().flatten());
    }
    candidates
}
