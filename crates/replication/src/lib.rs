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

//! # Meridian Replication
//!
//! Coordination core of a multi-master replicated record store. Every node
//! runs a [`ReplicationServer`]; each open database gets a
//! [`DistributedDatabase`] with:
//!
//! - an [`OperationRouter`] running single-record operations locally and
//!   replicating them with a quorum,
//! - a [`TransactionCoordinator`] for two-phase multi-record transactions,
//! - partitioned lanes executing inbound requests in per-cluster order,
//! - a [`BackgroundRepairer`] settling records that diverged.
//!
//! Storage and transport are traits; [`memory`] provides in-process
//! implementations used by tests and single-process clusters.
//!
//! ## Example
//!
//! ```rust,no_run
//! use meridian_replication::{Transaction, DistributedDatabase};
//! use std::sync::Arc;
//!
//! async fn transfer(database: Arc<DistributedDatabase>) -> anyhow::Result<()> {
//!     let router = database.router();
//!     let created = router.create_record("account", "balance=10", b'd').await?;
//!
//!     let report = database
//!         .transactions()
//!         .commit(Transaction::new().update(created.rid, "balance=5", Some(created.version), b'd'))
//!         .await?;
//!     assert_eq!(report.results.len(), 1);
//!     Ok(())
//! }
//! ```

pub mod async_queue;
pub mod config;
pub mod conflict;
pub mod context;
pub mod database;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod id;
pub mod lock_table;
pub mod memory;
pub mod message;
pub mod metrics;
pub mod repairer;
pub mod response;
pub mod router;
pub mod server;
pub mod storage;
pub mod task;
pub mod transaction;
pub mod transport;
pub mod worker_pool;

pub use async_queue::{CompletionCallback, ReplicationHandle};
pub use config::{RepairerConfig, ReplicationConfig};
pub use conflict::{Candidate, ConflictResolver, ConflictResolverChain};
pub use response::ValueGroup;
pub use context::ReplicationContext;
pub use database::DistributedDatabase;
pub use error::ReplicationError;
pub use id::{NodeId, RecordId, RequestId};
pub use message::{ExecutionMode, Payload, RawRecord, RemoteError, Request, Response, TaskResult};
pub use metrics::ReplicationStats;
pub use repairer::{BackgroundRepairer, RepairerStats};
pub use router::{Completion, OperationResult, OperationRouter, RecordVersion};
pub use server::ReplicationServer;
pub use storage::{Storage, StorageError};
pub use task::{RecordOperation, Task};
pub use transaction::{Transaction, TransactionCoordinator, TxError, TxReport, TxState};
pub use transport::{InboundHandler, Transport, TransportError};
