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

//! Record lock table
//!
//! Maps a record to the request currently owning it. At most one owner per
//! record; the table never blocks, waiting is the caller's business.

use crate::error::ReplicationError;
use crate::id::{RecordId, RequestId};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockEntry {
    pub owner: RequestId,
    pub acquired_at: Instant,
}

#[derive(Debug, Default)]
pub struct RecordLockTable {
    locks: DashMap<RecordId, LockEntry>,
}

impl RecordLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock unless another request owns it
    ///
    /// Re-acquisition by the current owner succeeds without changing anything.
    pub fn try_lock(&self, rid: RecordId, owner: RequestId) -> bool {
        match self.locks.entry(rid) {
            Entry::Occupied(entry) => entry.get().owner == owner,
            Entry::Vacant(entry) => {
                entry.insert(LockEntry {
                    owner,
                    acquired_at: Instant::now(),
                });
                trace!(rid = %rid, owner = %owner, "Record locked");
                true
            }
        }
    }

    /// Release the lock if `owner` holds it, otherwise do nothing
    pub fn unlock(&self, rid: RecordId, owner: RequestId) -> bool {
        self.locks.remove_if(&rid, |_, entry| entry.owner == owner).is_some()
    }

    /// Release every lock held by `owner`, returning how many were dropped
    pub fn release_all(&self, owner: RequestId) -> usize {
        let mut released = 0;
        self.locks.retain(|_, entry| {
            if entry.owner == owner {
                released += 1;
                false
            } else {
                true
            }
        });
        if released > 0 {
            trace!(owner = %owner, released, "Released record locks");
        }
        released
    }

    pub fn owner(&self, rid: RecordId) -> Option<RequestId> {
        self.locks.get(&rid).map(|entry| entry.owner)
    }

    /// Records currently held by `owner`
    pub fn locked_by(&self, owner: RequestId) -> Vec<RecordId> {
        let mut rids: Vec<RecordId> = self
            .locks
            .iter()
            .filter(|entry| entry.value().owner == owner)
            .map(|entry| *entry.key())
            .collect();
        rids.sort();
        rids
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Drop every lock, used when the database shuts down
    pub fn clear(&self) -> usize {
        let count = self.locks.len();
        self.locks.clear();
        count
    }

    /// Try the lock up to `attempts` times, sleeping `delay` in between
    pub async fn lock_with_retry(
        &self,
        rid: RecordId,
        owner: RequestId,
        attempts: u32,
        delay: Duration,
    ) -> Result<(), ReplicationError> {
        let attempts = attempts.max(1);
        for attempt in 1..=attempts {
            if self.try_lock(rid, owner) {
                return Ok(());
            }
            if attempt < attempts {
                debug!(rid = %rid, owner = %owner, attempt, "Record locked, retrying");
                tokio::time::sleep(delay).await;
            }
        }
        Err(ReplicationError::RecordLocked {
            rid,
            owner: self.owner(rid),
        })
    }
}

/// Releases every lock of a request when dropped
#[derive(Debug)]
pub struct LockGuard {
    table: Arc<RecordLockTable>,
    owner: RequestId,
    armed: bool,
}

impl LockGuard {
    pub fn new(table: Arc<RecordLockTable>, owner: RequestId) -> Self {
        Self {
            table,
            owner,
            armed: true,
        }
    }

    pub fn owner(&self) -> RequestId {
        self.owner
    }

    /// Keep the locks past the guard's lifetime
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.armed {
            self.table.release_all(self.owner);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const R1: RecordId = RecordId {
        cluster_id: 1,
        position: 1,
    };
    const R2: RecordId = RecordId {
        cluster_id: 1,
        position: 2,
    };

    #[test]
    fn test_single_holder() {
        let table = RecordLockTable::new();
        let a = RequestId::new(1, 1);
        let b = RequestId::new(2, 1);

        assert!(table.try_lock(R1, a));
        assert!(table.try_lock(R1, a));
        assert!(!table.try_lock(R1, b));
        assert_eq!(table.owner(R1), Some(a));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_unlock_by_other_owner_is_ignored() {
        let table = RecordLockTable::new();
        let a = RequestId::new(1, 1);
        let b = RequestId::new(2, 1);

        table.try_lock(R1, a);
        assert!(!table.unlock(R1, b));
        assert_eq!(table.owner(R1), Some(a));
        assert!(table.unlock(R1, a));
        assert!(table.is_empty());
    }

    #[test]
    fn test_release_all() {
        let table = RecordLockTable::new();
        let a = RequestId::new(1, 1);
        let b = RequestId::new(2, 1);

        table.try_lock(R1, a);
        table.try_lock(R2, a);
        table.try_lock(RecordId::new(2, 0), b);

        assert_eq!(table.locked_by(a), vec![R1, R2]);
        assert_eq!(table.release_all(a), 2);
        assert_eq!(table.release_all(a), 0);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let table = Arc::new(RecordLockTable::new());
        let a = RequestId::new(1, 1);

        {
            let _guard = LockGuard::new(Arc::clone(&table), a);
            table.try_lock(R1, a);
            table.try_lock(R2, a);
        }
        assert!(table.is_empty());

        let guard = LockGuard::new(Arc::clone(&table), a);
        table.try_lock(R1, a);
        guard.disarm();
        assert_eq!(table.owner(R1), Some(a));
    }

    #[tokio::test]
    async fn test_lock_with_retry() {
        let table = Arc::new(RecordLockTable::new());
        let a = RequestId::new(1, 1);
        let b = RequestId::new(2, 1);
        table.try_lock(R1, a);

        let err = table
            .lock_with_retry(R1, b, 2, Duration::from_millis(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::RecordLocked { owner: Some(owner), .. } if owner == a));

        let releaser = Arc::clone(&table);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            releaser.unlock(R1, a);
        });
        table
            .lock_with_retry(R1, b, 50, Duration::from_millis(5))
            .await
            .unwrap();
        assert_eq!(table.owner(R1), Some(b));
    }
}
