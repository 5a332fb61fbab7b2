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

//! Background replication queue
//!
//! Asynchronous operations finish their local part on the caller's task and
//! hand the replication step to [`AsyncReplicator`], a single worker draining
//! a bounded queue in submission order. The caller gets a
//! [`ReplicationHandle`] resolving to the distributed outcome. Jobs still
//! queued at shutdown run their cleanup and resolve to `Canceled`.

use crate::error::ReplicationError;
use crate::lock_table::LockGuard;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Invoked exactly once with the distributed outcome
pub type CompletionCallback<T, E = ReplicationError> = Box<dyn FnOnce(&Result<T, E>) + Send + 'static>;

/// Pending outcome of an asynchronous operation
#[must_use = "the handle is the only way to observe the replication outcome"]
pub struct ReplicationHandle<T, E = ReplicationError> {
    receiver: oneshot::Receiver<Result<T, E>>,
}

impl<T, E> ReplicationHandle<T, E>
where
    E: From<ReplicationError>,
{
    /// Handle that is already resolved
    pub fn ready(result: Result<T, E>) -> Self {
        let (sender, receiver) = oneshot::channel();
        let _ = sender.send(result);
        Self { receiver }
    }

    /// Wait for the outcome; a dropped job resolves to `Canceled`
    pub async fn wait(self) -> Result<T, E> {
        self.receiver
            .await
            .unwrap_or_else(|_| Err(E::from(ReplicationError::Canceled)))
    }
}

/// Router gate held by an operation
pub enum GateGuard {
    Shared(OwnedRwLockReadGuard<()>),
    Exclusive(OwnedRwLockWriteGuard<()>),
}

/// Releases record locks and the router gate when the operation is over
pub struct ReleaseGuard {
    locks: Option<LockGuard>,
    gate: Option<GateGuard>,
}

impl ReleaseGuard {
    pub fn new(locks: LockGuard, gate: GateGuard) -> Self {
        Self {
            locks: Some(locks),
            gate: Some(gate),
        }
    }

    /// Release now instead of at drop
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        // locks before gate, so the next gate holder finds them free
        drop(self.locks.take());
        drop(self.gate.take());
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Queued job; `true` means it is abandoned and must only clean up
type QueuedJob = Box<dyn FnOnce(bool) -> BoxFuture<'static, ()> + Send>;

/// Single background worker replicating asynchronous operations in order
pub struct AsyncReplicator {
    name: String,
    sender: mpsc::Sender<QueuedJob>,
    /// Shared with the worker so shutdown can drain what it left behind
    receiver: Arc<AsyncMutex<mpsc::Receiver<QueuedJob>>>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncReplicator {
    pub fn new(name: &str, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<QueuedJob>(capacity.max(1));
        let receiver = Arc::new(AsyncMutex::new(receiver));
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let queue = Arc::clone(&receiver);
        let worker_name = name.to_string();

        let worker = tokio::spawn(async move {
            loop {
                let job = {
                    let mut receiver = queue.lock().await;
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        job = receiver.recv() => match job {
                            Some(job) => job,
                            None => break,
                        },
                    }
                };
                job(false).await;
            }
            debug!(queue = %worker_name, "Async replication worker stopped");
        });

        Self {
            name: name.to_string(),
            sender,
            receiver,
            cancel,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Queue `job`; the returned handle resolves to its output
    ///
    /// `callback` runs exactly once with the outcome, including when the job
    /// is abandoned at shutdown. Waits while the queue is full.
    pub async fn submit<T, E, F>(&self, job: F, callback: Option<CompletionCallback<T, E>>) -> ReplicationHandle<T, E>
    where
        T: Send + 'static,
        E: From<ReplicationError> + Send + 'static,
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.enqueue(job, None, callback).await
    }

    /// Like [`AsyncReplicator::submit`], running `abandon` before the handle
    /// resolves to `Canceled` when the job never gets to run
    pub async fn submit_with_abandon<T, E, F>(
        &self,
        job: F,
        abandon: BoxFuture<'static, ()>,
        callback: Option<CompletionCallback<T, E>>,
    ) -> ReplicationHandle<T, E>
    where
        T: Send + 'static,
        E: From<ReplicationError> + Send + 'static,
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.enqueue(job, Some(abandon), callback).await
    }

    async fn enqueue<T, E, F>(
        &self,
        job: F,
        abandon: Option<BoxFuture<'static, ()>>,
        callback: Option<CompletionCallback<T, E>>,
    ) -> ReplicationHandle<T, E>
    where
        T: Send + 'static,
        E: From<ReplicationError> + Send + 'static,
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        let completion = Completion {
            sender: Some(sender),
            callback,
        };

        let queued: QueuedJob = Box::new(move |abandoned: bool| -> BoxFuture<'static, ()> {
            Box::pin(async move {
                let mut completion = completion;
                if abandoned {
                    if let Some(abandon) = abandon {
                        abandon.await;
                    }
                    // the job still owns its guards until here
                    drop(job);
                    completion.finish(Err(E::from(ReplicationError::Canceled)));
                } else {
                    let result = job.await;
                    completion.finish(result);
                }
            })
        });

        if let Err(mpsc::error::SendError(rejected)) = self.sender.send(queued).await {
            rejected(true).await;
        }
        ReplicationHandle { receiver }
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Stop starting new jobs; the one in progress keeps running
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Finish the job in progress, abandon the queued ones
    ///
    /// Abandoned jobs run their cleanup before their handles resolve.
    pub async fn shutdown(&self, grace: Duration) {
        self.close();
        let worker = self.worker.lock().take();
        if let Some(mut worker) = worker
            && tokio::time::timeout(grace, &mut worker).await.is_err()
        {
            warn!(queue = %self.name, "Async replication worker did not stop in time, aborting");
            worker.abort();
            let _ = worker.await;
        }

        let mut receiver = self.receiver.lock().await;
        receiver.close();
        let mut abandoned = 0usize;
        while let Ok(job) = receiver.try_recv() {
            job(true).await;
            abandoned += 1;
        }
        if abandoned > 0 {
            warn!(queue = %self.name, abandoned, "Asynchronous replications abandoned at shutdown");
        }
        info!(queue = %self.name, "Async replication queue stopped");
    }
}

impl Drop for AsyncReplicator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Delivers an outcome to the handle and the callback exactly once
struct Completion<T, E: From<ReplicationError>> {
    sender: Option<oneshot::Sender<Result<T, E>>>,
    callback: Option<CompletionCallback<T, E>>,
}

impl<T, E: From<ReplicationError>> Completion<T, E> {
    fn finish(&mut self, result: Result<T, E>) {
        if let Some(callback) = self.callback.take() {
            callback(&result);
        }
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(result);
        }
    }
}

impl<T, E: From<ReplicationError>> Drop for Completion<T, E> {
    fn drop(&mut self) {
        if self.sender.is_some() || self.callback.is_some() {
            self.finish(Err(E::from(ReplicationError::Canceled)));
        }
    }
}
