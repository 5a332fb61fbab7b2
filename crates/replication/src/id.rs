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

//! Request and record identities

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Node name as registered in the topology
pub type NodeId = String;

/// Identity of a replicated request: originating node plus a per-node sequence
///
/// Ordered by node first, then sequence. Used as the lock ownership token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId {
    pub node: u32,
    pub sequence: u64,
}

impl RequestId {
    pub fn new(node: u32, sequence: u64) -> Self {
        Self { node, sequence }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.sequence)
    }
}

/// Physical identity of a record: storage cluster plus position inside it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId {
    pub cluster_id: i32,
    pub position: i64,
}

impl RecordId {
    /// Position of a record that has not been assigned one yet
    pub const UNASSIGNED: i64 = -1;

    pub fn new(cluster_id: i32, position: i64) -> Self {
        Self { cluster_id, position }
    }

    /// Returns true once the storage engine assigned a position
    pub fn is_persistent(&self) -> bool {
        self.cluster_id >= 0 && self.position > Self::UNASSIGNED
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}:{}", self.cluster_id, self.position)
    }
}

/// Allocates request ids for one node
#[derive(Debug)]
pub struct RequestIdGenerator {
    node: u32,
    next: AtomicU64,
}

impl RequestIdGenerator {
    pub fn new(node: u32) -> Self {
        Self {
            node,
            next: AtomicU64::new(1),
        }
    }

    /// Numeric identifier of the owning node
    pub fn node(&self) -> u32 {
        self.node
    }

    pub fn next_id(&self) -> RequestId {
        RequestId::new(self.node, self.next.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_ids_are_ordered_per_node() {
        let ids = RequestIdGenerator::new(3);
        let first = ids.next_id();
        let second = ids.next_id();

        assert!(first < second);
        assert_eq!(first.to_string(), "3:1");
        assert!(RequestId::new(2, 100) < RequestId::new(3, 1));
    }

    #[test]
    fn test_record_id_display() {
        assert_eq!(RecordId::new(9, 42).to_string(), "#9:42");
        assert!(!RecordId::new(9, RecordId::UNASSIGNED).is_persistent());
    }
}
