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

//! Boundary to the messaging substrate

use crate::id::NodeId;
use crate::message::{Request, Response};
use async_trait::async_trait;
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Node {0} is unreachable")]
    Unreachable(NodeId),

    #[error("Unknown node {0}")]
    UnknownNode(NodeId),

    #[error("Transport closed")]
    Closed,
}

/// Outbound side: best-effort delivery to named nodes
#[async_trait]
pub trait Transport: Send + Sync {
    /// Hand a request to a node; `Ok` is the delivery ack, not the reply
    async fn send_request(&self, node: &str, request: Request) -> Result<(), TransportError>;

    async fn send_response(&self, node: &str, response: Response) -> Result<(), TransportError>;

    /// Nodes currently serving the database
    async fn available_nodes(&self, database: &str) -> BTreeSet<NodeId>;
}

/// Inbound side, implemented by the replication server of a node
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn on_request(&self, request: Request);

    async fn on_response(&self, response: Response);
}
