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

//! In-process collaborators
//!
//! [`MemoryStorage`] and [`LocalNetwork`] let a whole cluster run inside one
//! process. The network can take nodes down or mute their replies to emulate
//! crashes and timeouts.

use crate::id::{NodeId, RecordId};
use crate::message::{RawRecord, Request, Response};
use crate::storage::{Storage, StorageError};
use crate::transport::{InboundHandler, Transport, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, trace};

#[derive(Debug)]
struct MemoryCluster {
    name: String,
    records: BTreeMap<i64, RawRecord>,
    next_position: i64,
}

#[derive(Debug, Default)]
struct MemoryInner {
    clusters: HashMap<i32, MemoryCluster>,
    names: HashMap<String, i32>,
    next_cluster: i32,
}

/// Storage engine keeping every cluster in memory
#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: RwLock<MemoryInner>,
    fail_writes: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage with the given clusters, numbered from 0 in order
    pub fn with_clusters(names: &[&str]) -> Self {
        let storage = Self::new();
        for name in names {
            // names are distinct by construction in callers; duplicates are skipped
            let _ = storage.add_cluster(name);
        }
        storage
    }

    fn add_cluster(&self, name: &str) -> Result<i32, StorageError> {
        let mut inner = self.inner.write();
        if inner.names.contains_key(name) {
            return Err(StorageError::ClusterExists(name.to_string()));
        }
        let id = inner.next_cluster;
        inner.next_cluster += 1;
        inner.names.insert(name.to_string(), id);
        inner.clusters.insert(
            id,
            MemoryCluster {
                name: name.to_string(),
                records: BTreeMap::new(),
                next_position: 0,
            },
        );
        Ok(id)
    }

    /// Make every write fail with an engine error
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Live records of a cluster in position order
    pub fn records(&self, cluster_id: i32) -> Vec<(RecordId, RawRecord)> {
        let inner = self.inner.read();
        inner
            .clusters
            .get(&cluster_id)
            .map(|cluster| {
                cluster
                    .records
                    .iter()
                    .map(|(position, record)| (RecordId::new(cluster_id, *position), record.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn check_writable(&self) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Engine("writes disabled".to_string()));
        }
        Ok(())
    }
}

fn cluster_mut(inner: &mut MemoryInner, cluster_id: i32) -> Result<&mut MemoryCluster, StorageError> {
    inner
        .clusters
        .get_mut(&cluster_id)
        .ok_or_else(|| StorageError::ClusterNotFound(cluster_id.to_string()))
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn read(&self, rid: RecordId) -> Result<Option<RawRecord>, StorageError> {
        let inner = self.inner.read();
        let cluster = inner
            .clusters
            .get(&rid.cluster_id)
            .ok_or_else(|| StorageError::ClusterNotFound(rid.cluster_id.to_string()))?;
        Ok(cluster.records.get(&rid.position).cloned())
    }

    async fn create(&self, cluster_id: i32, content: Bytes, record_type: u8) -> Result<(RecordId, u32), StorageError> {
        self.check_writable()?;
        let mut inner = self.inner.write();
        let cluster = cluster_mut(&mut inner, cluster_id)?;
        let position = cluster.next_position;
        cluster.next_position += 1;
        cluster.records.insert(position, RawRecord::new(content, 1, record_type));
        Ok((RecordId::new(cluster_id, position), 1))
    }

    async fn update(
        &self,
        rid: RecordId,
        content: Bytes,
        expected_version: Option<u32>,
        record_type: u8,
    ) -> Result<u32, StorageError> {
        self.check_writable()?;
        let mut inner = self.inner.write();
        let cluster = cluster_mut(&mut inner, rid.cluster_id)?;
        let record = cluster
            .records
            .get_mut(&rid.position)
            .ok_or(StorageError::RecordNotFound(rid))?;

        if let Some(expected) = expected_version
            && expected != record.version
        {
            return Err(StorageError::VersionMismatch {
                rid,
                expected,
                actual: record.version,
            });
        }

        record.version += 1;
        record.content = content;
        record.record_type = record_type;
        Ok(record.version)
    }

    async fn delete(&self, rid: RecordId, expected_version: Option<u32>) -> Result<bool, StorageError> {
        self.check_writable()?;
        let mut inner = self.inner.write();
        let cluster = cluster_mut(&mut inner, rid.cluster_id)?;
        let Some(record) = cluster.records.get(&rid.position) else {
            return Ok(false);
        };

        if let Some(expected) = expected_version
            && expected != record.version
        {
            return Err(StorageError::VersionMismatch {
                rid,
                expected,
                actual: record.version,
            });
        }

        cluster.records.remove(&rid.position);
        Ok(true)
    }

    async fn put(&self, rid: RecordId, record: RawRecord) -> Result<(), StorageError> {
        self.check_writable()?;
        let mut inner = self.inner.write();
        let cluster = cluster_mut(&mut inner, rid.cluster_id)?;
        cluster.next_position = cluster.next_position.max(rid.position + 1);
        cluster.records.insert(rid.position, record);
        Ok(())
    }

    async fn next_position(&self, cluster_id: i32) -> Result<i64, StorageError> {
        let inner = self.inner.read();
        inner
            .clusters
            .get(&cluster_id)
            .map(|cluster| cluster.next_position)
            .ok_or_else(|| StorageError::ClusterNotFound(cluster_id.to_string()))
    }

    async fn cluster_name(&self, cluster_id: i32) -> Option<String> {
        self.inner
            .read()
            .clusters
            .get(&cluster_id)
            .map(|cluster| cluster.name.clone())
    }

    async fn cluster_id(&self, name: &str) -> Option<i32> {
        self.inner.read().names.get(name).copied()
    }

    async fn create_cluster(&self, name: &str) -> Result<i32, StorageError> {
        self.check_writable()?;
        self.add_cluster(name)
    }
}

struct Endpoint {
    requests: mpsc::Sender<Request>,
    responses: mpsc::Sender<Response>,
    handler: RwLock<Option<Weak<dyn InboundHandler>>>,
    down: AtomicBool,
    mute: AtomicBool,
}

impl Endpoint {
    fn handler(&self) -> Option<Arc<dyn InboundHandler>> {
        self.handler.read().as_ref().and_then(Weak::upgrade)
    }
}

/// Loopback network connecting the nodes of one process
pub struct LocalNetwork {
    endpoints: RwLock<HashMap<NodeId, Arc<Endpoint>>>,
    capacity: usize,
}

impl LocalNetwork {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            endpoints: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        })
    }

    /// Add a node and return its outbound transport
    ///
    /// Inbound messages are delivered in arrival order, requests and responses
    /// on separate tasks so a blocked request never holds back replies.
    pub fn join(self: &Arc<Self>, node: &str) -> Arc<LocalTransport> {
        let (request_tx, mut request_rx) = mpsc::channel::<Request>(self.capacity);
        let (response_tx, mut response_rx) = mpsc::channel::<Response>(self.capacity);
        let endpoint = Arc::new(Endpoint {
            requests: request_tx,
            responses: response_tx,
            handler: RwLock::new(None),
            down: AtomicBool::new(false),
            mute: AtomicBool::new(false),
        });
        self.endpoints.write().insert(node.to_string(), Arc::clone(&endpoint));

        let requests_endpoint = Arc::clone(&endpoint);
        let name = node.to_string();
        tokio::spawn(async move {
            while let Some(request) = request_rx.recv().await {
                match requests_endpoint.handler() {
                    Some(handler) => handler.on_request(request).await,
                    None => debug!(node = %name, request = %request.id, "No handler attached, request dropped"),
                }
            }
        });

        let name = node.to_string();
        tokio::spawn(async move {
            while let Some(response) = response_rx.recv().await {
                match endpoint.handler() {
                    Some(handler) => handler.on_response(response).await,
                    None => debug!(node = %name, request = %response.request_id, "No handler attached, response dropped"),
                }
            }
        });

        Arc::new(LocalTransport {
            node: node.to_string(),
            network: Arc::clone(self),
        })
    }

    /// Route inbound messages of a node to its handler
    pub fn attach(&self, node: &str, handler: Arc<dyn InboundHandler>) {
        if let Some(endpoint) = self.endpoints.read().get(node) {
            *endpoint.handler.write() = Some(Arc::downgrade(&handler));
        }
    }

    /// Take a node off the network: sends to it fail as unreachable
    pub fn set_down(&self, node: &str, down: bool) {
        if let Some(endpoint) = self.endpoints.read().get(node) {
            endpoint.down.store(down, Ordering::SeqCst);
        }
    }

    /// Keep accepting a node's requests but drop every reply it sends
    pub fn set_mute(&self, node: &str, mute: bool) {
        if let Some(endpoint) = self.endpoints.read().get(node) {
            endpoint.mute.store(mute, Ordering::SeqCst);
        }
    }

    fn endpoint(&self, node: &str) -> Result<Arc<Endpoint>, TransportError> {
        self.endpoints
            .read()
            .get(node)
            .cloned()
            .ok_or_else(|| TransportError::UnknownNode(node.to_string()))
    }

    fn reachable(&self, node: &str) -> Result<Arc<Endpoint>, TransportError> {
        let endpoint = self.endpoint(node)?;
        if endpoint.down.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable(node.to_string()));
        }
        Ok(endpoint)
    }
}

/// Outbound transport of one node on a [`LocalNetwork`]
pub struct LocalTransport {
    node: NodeId,
    network: Arc<LocalNetwork>,
}

impl LocalTransport {
    pub fn node(&self) -> &str {
        &self.node
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send_request(&self, node: &str, request: Request) -> Result<(), TransportError> {
        self.network.reachable(&self.node)?;
        let endpoint = self.network.reachable(node)?;
        trace!(from = %self.node, to = %node, request = %request.id, "Delivering request");
        endpoint.requests.send(request).await.map_err(|_| TransportError::Closed)
    }

    async fn send_response(&self, node: &str, response: Response) -> Result<(), TransportError> {
        let own = self.network.reachable(&self.node)?;
        if own.mute.load(Ordering::SeqCst) {
            trace!(from = %self.node, to = %node, request = %response.request_id, "Muted, response dropped");
            return Ok(());
        }
        let endpoint = self.network.reachable(node)?;
        endpoint.responses.send(response).await.map_err(|_| TransportError::Closed)
    }

    async fn available_nodes(&self, _database: &str) -> BTreeSet<NodeId> {
        self.network
            .endpoints
            .read()
            .iter()
            .filter(|(_, endpoint)| !endpoint.down.load(Ordering::SeqCst) && endpoint.handler().is_some())
            .map(|(node, _)| node.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_positions_are_never_reused() {
        let storage = MemoryStorage::with_clusters(&["person"]);
        let (first, version) = storage.create(0, Bytes::from_static(b"a"), b'd').await.unwrap();
        assert_eq!(first, RecordId::new(0, 0));
        assert_eq!(version, 1);

        assert!(storage.delete(first, Some(1)).await.unwrap());
        assert!(!storage.delete(first, None).await.unwrap());

        let (second, _) = storage.create(0, Bytes::from_static(b"b"), b'd').await.unwrap();
        assert_eq!(second.position, 1);
        assert_eq!(storage.next_position(0).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_version_checks() {
        let storage = MemoryStorage::with_clusters(&["person"]);
        let (rid, _) = storage.create(0, Bytes::from_static(b"a"), b'd').await.unwrap();

        assert_eq!(
            storage
                .update(rid, Bytes::from_static(b"b"), Some(1), b'd')
                .await
                .unwrap(),
            2
        );
        let err = storage
            .update(rid, Bytes::from_static(b"c"), Some(1), b'd')
            .await
            .unwrap_err();
        assert_eq!(
            err,
            StorageError::VersionMismatch {
                rid,
                expected: 1,
                actual: 2
            }
        );
    }

    #[tokio::test]
    async fn test_put_advances_positions() {
        let storage = MemoryStorage::with_clusters(&["person"]);
        storage
            .put(RecordId::new(0, 4), RawRecord::new("x", 3, b'd'))
            .await
            .unwrap();

        assert_eq!(storage.next_position(0).await.unwrap(), 5);
        assert_eq!(storage.records(0).len(), 1);
        assert_eq!(storage.cluster_id("person").await, Some(0));
        assert!(storage.create_cluster("person").await.is_err());
    }

    #[tokio::test]
    async fn test_down_node_is_unreachable() {
        let network = LocalNetwork::new(8);
        let a = network.join("a");
        let _b = network.join("b");

        network.set_down("b", true);
        let response = Response::new(crate::id::RequestId::new(1, 1), "a", Ok(crate::message::TaskResult::Ack));
        assert_eq!(
            a.send_response("b", response.clone()).await,
            Err(TransportError::Unreachable("b".to_string()))
        );
        assert_eq!(
            a.send_response("c", response).await,
            Err(TransportError::UnknownNode("c".to_string()))
        );
    }
}
