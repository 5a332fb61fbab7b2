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

//! Replication counters
//!
//! Every event is exported through the `metrics` facade and mirrored in an
//! atomic counter so a node can report its own statistics without a
//! recorder installed.

use metrics::{counter, histogram};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct ReplicationMetrics {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    responses_unexpected: AtomicU64,
    timeouts: AtomicU64,
    conflicts: AtomicU64,
    split_brain: AtomicU64,
    fixes_sent: AtomicU64,
    undo_sent: AtomicU64,
    repaired_records: AtomicU64,
}

impl ReplicationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        counter!("meridian_replication_messages_sent_total").increment(1);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        counter!("meridian_replication_messages_received_total").increment(1);
    }

    pub fn response_unexpected(&self) {
        self.responses_unexpected.fetch_add(1, Ordering::Relaxed);
        counter!("meridian_replication_responses_unexpected_total").increment(1);
    }

    pub fn timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        counter!("meridian_replication_timeouts_total").increment(1);
    }

    pub fn conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
        counter!("meridian_replication_conflicts_total").increment(1);
    }

    pub fn split_brain(&self) {
        self.split_brain.fetch_add(1, Ordering::Relaxed);
        counter!("meridian_replication_split_brain_total").increment(1);
    }

    pub fn fix_sent(&self) {
        self.fixes_sent.fetch_add(1, Ordering::Relaxed);
        counter!("meridian_replication_fixes_sent_total").increment(1);
    }

    pub fn undo_sent(&self) {
        self.undo_sent.fetch_add(1, Ordering::Relaxed);
        counter!("meridian_replication_undo_sent_total").increment(1);
    }

    pub fn records_repaired(&self, count: u64) {
        self.repaired_records.fetch_add(count, Ordering::Relaxed);
        counter!("meridian_replication_repaired_records_total").increment(count);
    }

    pub fn quorum_wait(&self, elapsed: Duration) {
        histogram!("meridian_replication_quorum_wait_seconds").record(elapsed.as_secs_f64());
    }

    /// Get current replication statistics
    pub fn get_stats(&self) -> ReplicationStats {
        ReplicationStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            responses_unexpected: self.responses_unexpected.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            split_brain: self.split_brain.load(Ordering::Relaxed),
            fixes_sent: self.fixes_sent.load(Ordering::Relaxed),
            undo_sent: self.undo_sent.load(Ordering::Relaxed),
            repaired_records: self.repaired_records.load(Ordering::Relaxed),
        }
    }
}

/// Replication statistics for monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicationStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub responses_unexpected: u64,
    pub timeouts: u64,
    pub conflicts: u64,
    pub split_brain: u64,
    pub fixes_sent: u64,
    pub undo_sent: u64,
    pub repaired_records: u64,
}
