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

//! Background repair of divergent copies

mod common;

use common::{PERSON, TestCluster, eventually};
use meridian_replication::{RawRecord, RecordId, Storage};

/// The copy held by a write quorum replaces the odd one out
#[tokio::test]
async fn test_majority_copy_wins() {
    let cluster = TestCluster::start(&["a", "b", "c"]).await;
    let created = cluster
        .node("a")
        .database
        .router()
        .create_record("person", "truth", b'd')
        .await
        .expect("create");
    let c = cluster.node("c");
    assert!(eventually(|| async { c.read(created.rid).await.is_some() }).await);
    c.storage
        .put(created.rid, RawRecord::new("drift", 1, b'd'))
        .await
        .unwrap();

    let repairer = cluster.node("a").database.repairer();
    repairer.enqueue_repair(created.rid);
    assert_eq!(repairer.check().await.expect("repair cycle"), 1);

    let record = c.read(created.rid).await.expect("record kept");
    assert_eq!(record.content.as_ref(), b"truth");
    assert!(!repairer.is_pending(created.rid));
    assert_eq!(repairer.stats().processed, 1);
    assert!(cluster.node("a").server.context().metrics().get_stats().repaired_records >= 1);

    cluster.shutdown().await;
}

/// A copy only one node holds is removed when the others do not have it
#[tokio::test]
async fn test_missing_copy_wins() {
    let cluster = TestCluster::start(&["a", "b", "c"]).await;
    let ghost = RecordId::new(PERSON, 5);
    cluster
        .node("c")
        .storage
        .put(ghost, RawRecord::new("ghost", 3, b'd'))
        .await
        .unwrap();

    let repairer = cluster.node("a").database.repairer();
    repairer.enqueue_repair(ghost);
    assert_eq!(repairer.check().await.expect("repair cycle"), 1);
    assert!(cluster.node("c").read(ghost).await.is_none());

    cluster.shutdown().await;
}

/// Without a winner the record stays queued for a later cycle
#[tokio::test]
async fn test_tie_stays_pending() {
    let cluster = TestCluster::start(&["a", "b"]).await;
    let rid = RecordId::new(PERSON, 0);
    cluster.node("a").storage.put(rid, RawRecord::new("left", 4, b'd')).await.unwrap();
    cluster.node("b").storage.put(rid, RawRecord::new("right", 4, b'd')).await.unwrap();

    let repairer = cluster.node("a").database.repairer();
    repairer.enqueue_repair(rid);
    assert_eq!(repairer.check().await.expect("repair cycle"), 0);

    assert!(repairer.is_pending(rid));
    assert_eq!(cluster.node("a").read(rid).await.unwrap().content.as_ref(), b"left");
    assert_eq!(cluster.node("b").read(rid).await.unwrap().content.as_ref(), b"right");
    assert!(cluster.node("a").server.context().metrics().get_stats().split_brain >= 1);

    assert!(repairer.cancel_repair(rid));
    assert_eq!(repairer.stats().canceled, 1);

    cluster.shutdown().await;
}

/// A batch some node could not answer is kept whole
#[tokio::test]
async fn test_unanswered_batch_stays_pending() {
    let cluster = TestCluster::start(&["a", "b", "c"]).await;
    let rid = RecordId::new(PERSON, 0);
    cluster.node("c").storage.put(rid, RawRecord::new("lonely", 1, b'd')).await.unwrap();
    cluster.network.set_down("c", true);

    let repairer = cluster.node("a").database.repairer();
    repairer.enqueue_repair(rid);
    assert_eq!(repairer.check().await.expect("repair cycle"), 0);
    assert!(repairer.is_pending(rid));
    assert_eq!(repairer.stats().failed_batches, 1);

    cluster.network.set_down("c", false);
    cluster.shutdown().await;
}

/// Records another request holds are left for the next cycle
#[tokio::test]
async fn test_locked_record_is_skipped() {
    let cluster = TestCluster::start(&["a", "b", "c"]).await;
    let rid = RecordId::new(PERSON, 0);
    let a = cluster.node("a");
    assert!(a.database.executor().locks().try_lock(rid, meridian_replication::RequestId::new(7, 7)));

    let repairer = a.database.repairer();
    repairer.enqueue_repair(rid);
    assert_eq!(repairer.check().await.expect("repair cycle"), 0);
    assert!(repairer.is_pending(rid));

    cluster.shutdown().await;
}
