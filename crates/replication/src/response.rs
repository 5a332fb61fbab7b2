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

//! Response coordination for one outgoing request
//!
//! Collects the replies of every expected node, groups equivalent payloads,
//! decides whether the quorum holds and turns the collected state into a
//! final response plus the fix or undo messages needed to bring the
//! participants back in line.
//!
//! # Quorum
//!
//! A group reaches the quorum when it holds a successful payload and at least
//! `quorum` of its nodes are quorum members. With grouping disabled the raw
//! count of member replies is used instead. When read-your-writes is on, the
//! local node's own reply is required before the quorum can be declared.
//!
//! # Conclusion
//!
//! - quorum type `None` never fails;
//! - two successful groups of equal size at or above the quorum are a split
//!   brain: nothing is fixed, every remote participant is undone;
//! - a reached quorum fixes every differing node, or undoes the operation when
//!   some difference cannot be fixed;
//! - a missed quorum undoes every remote participant and reports the most
//!   specific failure seen.

use crate::error::ReplicationError;
use crate::id::{NodeId, RequestId};
use crate::message::{Payload, RemoteError, Request, Response, TaskResult};
use crate::metrics::ReplicationMetrics;
use crate::task::{ResultStrategy, Task};
use meridian_quorum::QuorumType;
use meridian_topology::SystemTopology;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Follow-up message produced by conflict resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairAction {
    /// Re-apply the winning value on a node that diverged
    Fix { node: NodeId, task: Task },

    /// Revert the operation on a node that applied it
    Undo { node: NodeId, task: Task },
}

impl RepairAction {
    pub fn node(&self) -> &str {
        match self {
            RepairAction::Fix { node, .. } | RepairAction::Undo { node, .. } => node,
        }
    }

    pub fn task(&self) -> &Task {
        match self {
            RepairAction::Fix { task, .. } | RepairAction::Undo { task, .. } => task,
        }
    }

    pub fn is_undo(&self) -> bool {
        matches!(self, RepairAction::Undo { .. })
    }
}

/// Final response plus the messages needed to reconcile the participants
#[derive(Debug)]
pub struct Outcome {
    pub response: Result<Option<Response>, ReplicationError>,
    pub actions: Vec<RepairAction>,
}

/// Behaviour switches of a coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Require the local node's reply before declaring the quorum
    pub wait_for_local: bool,

    /// Group equivalent payloads; off means plain counting
    pub group_responses: bool,

    /// Only complete once every expected node answered
    pub wait_for_all: bool,

    pub sync_timeout: Duration,

    /// Longest wait before reachability is re-evaluated
    pub check_interval: Duration,

    /// Added to the sync timeout when judging whether a topology change is recent
    pub cluster_shape_grace: Duration,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            wait_for_local: true,
            group_responses: true,
            wait_for_all: false,
            sync_timeout: Duration::from_secs(15),
            check_interval: Duration::from_secs(10),
            cluster_shape_grace: Duration::from_secs(10),
        }
    }
}

/// Nodes that answered with the same value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueGroup<V> {
    pub value: V,
    pub nodes: Vec<NodeId>,
}

/// Add `node` to the group holding `value`, opening a new group when none does
pub(crate) fn group_value<V: PartialEq>(groups: &mut Vec<ValueGroup<V>>, node: NodeId, value: V) {
    match groups.iter_mut().find(|group| group.value == value) {
        Some(group) => group.nodes.push(node),
        None => groups.push(ValueGroup {
            value,
            nodes: vec![node],
        }),
    }
}

type ResponseGroup = ValueGroup<Payload>;

#[derive(Debug, Clone)]
enum Conclusion {
    Pending,
    /// Nothing to reconcile afterwards
    Passive,
    Winner(Payload),
    Failed,
}

#[derive(Debug)]
struct QuorumState {
    expected: BTreeSet<NodeId>,
    members: BTreeSet<NodeId>,
    received: BTreeMap<NodeId, Response>,
    groups: Vec<ResponseGroup>,
    conclusion: Conclusion,
    followups: Vec<RepairAction>,
    completed: bool,
    canceled: bool,
    stop_waiting: bool,
}

pub struct ResponseCoordinator {
    request: Request,
    local: NodeId,
    quorum: usize,
    options: CoordinatorOptions,
    topology: Arc<SystemTopology>,
    metrics: Arc<ReplicationMetrics>,
    state: Mutex<QuorumState>,
    wake: watch::Sender<()>,
    created: Instant,
}

impl ResponseCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        request: Request,
        local: impl Into<NodeId>,
        expected: BTreeSet<NodeId>,
        members: BTreeSet<NodeId>,
        quorum: usize,
        options: CoordinatorOptions,
        topology: Arc<SystemTopology>,
        metrics: Arc<ReplicationMetrics>,
    ) -> Self {
        let (wake, _) = watch::channel(());
        Self {
            request,
            local: local.into(),
            quorum,
            options,
            topology,
            metrics,
            state: Mutex::new(QuorumState {
                expected,
                members,
                received: BTreeMap::new(),
                groups: Vec::new(),
                conclusion: Conclusion::Pending,
                followups: Vec::new(),
                completed: false,
                canceled: false,
                stop_waiting: false,
            }),
            wake,
            created: Instant::now(),
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request.id
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    /// Record one reply; returns true once the request is complete
    pub fn collect_response(&self, response: Response) -> bool {
        let mut state = self.state.lock();
        let node = response.executor.clone();

        if !state.expected.contains(&node) {
            warn!(request = %self.request.id, node = %node, "Response from unexpected node ignored");
            self.metrics.response_unexpected();
            return state.completed;
        }
        if state.received.contains_key(&node) {
            warn!(request = %self.request.id, node = %node, "Duplicate response ignored");
            self.metrics.response_unexpected();
            return state.completed;
        }

        debug!(request = %self.request.id, node = %node, ok = response.payload.is_ok(), "Response received");

        if self.options.group_responses {
            group_value(&mut state.groups, node.clone(), response.payload.clone());
        }

        self.late_followup(&mut state, &node, &response.payload);
        state.received.insert(node, response);
        self.check_completion(&mut state)
    }

    fn late_followup(&self, state: &mut QuorumState, node: &str, payload: &Payload) {
        let action = match &state.conclusion {
            Conclusion::Winner(winner) if payload != winner => {
                match self.request.task.fix_task(self.request.id, payload, winner) {
                    Some(task) => Some(RepairAction::Fix {
                        node: node.to_string(),
                        task,
                    }),
                    None => {
                        warn!(request = %self.request.id, node = %node, "Late response differs and cannot be fixed");
                        None
                    }
                }
            }
            Conclusion::Failed if node != self.local => payload
                .as_ref()
                .ok()
                .and_then(|result| self.request.task.undo_task(self.request.id, result))
                .map(|task| RepairAction::Undo {
                    node: node.to_string(),
                    task,
                }),
            _ => None,
        };

        if let Some(action) = action {
            info!(request = %self.request.id, node = %node, undo = action.is_undo(), "Late response needs a follow-up");
            self.metrics.conflict();
            state.followups.push(action);
        }
    }

    fn check_completion(&self, state: &mut QuorumState) -> bool {
        if state.completed {
            return true;
        }

        let all_received = state.expected.iter().all(|node| state.received.contains_key(node));
        if all_received || (!self.options.wait_for_all && self.quorum_reached(state)) {
            state.completed = true;
            self.wake.send_replace(());
        }
        state.completed
    }

    fn quorum_reached(&self, state: &QuorumState) -> bool {
        if self.quorum == 0 {
            return true;
        }
        if self.options.wait_for_local
            && state.expected.contains(&self.local)
            && !state.received.contains_key(&self.local)
        {
            return false;
        }
        if self.options.group_responses {
            self.quorum_group(state).is_some()
        } else {
            state.received.keys().filter(|node| state.members.contains(*node)).count() >= self.quorum
        }
    }

    /// First successful group with enough quorum members
    fn quorum_group(&self, state: &QuorumState) -> Option<usize> {
        state.groups.iter().position(|group| {
            group.nodes.len() >= self.quorum
                && group.value.is_ok()
                && group.nodes.iter().filter(|node| state.members.contains(*node)).count() >= self.quorum
        })
    }

    pub fn is_minimum_quorum_reached(&self) -> bool {
        let state = self.state.lock();
        self.quorum_reached(&state)
    }

    pub fn is_completed(&self) -> bool {
        self.state.lock().completed
    }

    pub fn all_received(&self) -> bool {
        let state = self.state.lock();
        state.expected.iter().all(|node| state.received.contains_key(node))
    }

    pub fn received_count(&self) -> usize {
        self.state.lock().received.len()
    }

    pub fn missing_nodes(&self) -> Vec<NodeId> {
        let state = self.state.lock();
        state
            .expected
            .iter()
            .filter(|node| !state.received.contains_key(*node))
            .cloned()
            .collect()
    }

    /// Payload of every node that answered
    pub fn payloads(&self) -> BTreeMap<NodeId, Payload> {
        self.state
            .lock()
            .received
            .iter()
            .map(|(node, response)| (node.clone(), response.payload.clone()))
            .collect()
    }

    /// Groups in arrival order, for diagnostics
    pub fn groups(&self) -> Vec<(Payload, Vec<NodeId>)> {
        self.state
            .lock()
            .groups
            .iter()
            .map(|group| (group.value.clone(), group.nodes.clone()))
            .collect()
    }

    /// Stop expecting a node that went away
    pub fn remove_unreachable(&self, node: &str) -> bool {
        let mut state = self.state.lock();
        let removed = state.expected.remove(node);
        state.members.remove(node);
        if removed && !state.received.contains_key(node) {
            debug!(request = %self.request.id, node = %node, "Node no longer expected");
        }
        let completed = self.check_completion(&mut state);
        self.wake.send_replace(());
        completed
    }

    /// Abort the wait; the waiter gets [`ReplicationError::Canceled`]
    pub fn cancel(&self) {
        self.state.lock().canceled = true;
        self.wake.send_replace(());
    }

    /// End the wait now and evaluate what arrived so far
    pub fn timeout(&self) {
        self.state.lock().stop_waiting = true;
        self.wake.send_replace(());
    }

    pub fn take_followups(&self) -> Vec<RepairAction> {
        std::mem::take(&mut self.state.lock().followups)
    }

    /// Wait until the request completes, the timeout expires or no missing
    /// node can answer anymore
    ///
    /// The deadline is pushed back by one sync timeout for every topology
    /// change observed within the sync timeout plus grace, and once when a
    /// missing node is resynchronizing. Returns whether the quorum holds.
    pub async fn wait_for_quorum(&self, timeout: Duration) -> Result<bool, ReplicationError> {
        let started = Instant::now();
        let mut deadline = started + timeout;
        let mut wake = self.wake.subscribe();
        let mut seen_change = self.topology.last_change().await;
        let mut resync_extended = false;
        let shape_window = self.options.sync_timeout + self.options.cluster_shape_grace;

        loop {
            {
                let mut state = self.state.lock();
                if state.canceled {
                    return Err(ReplicationError::Canceled);
                }
                if self.check_completion(&mut state) || state.stop_waiting {
                    break;
                }
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }

            let slice = (deadline - now).min(self.options.check_interval);
            match tokio::time::timeout(slice, wake.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => break,
                Err(_) => {}
            }

            let missing = self.missing_nodes();
            if missing.is_empty() {
                continue;
            }

            let mut reachable = false;
            let mut resynchronizing = false;
            for node in &missing {
                if self.topology.is_node_available(node, &self.request.database).await {
                    reachable = true;
                    resynchronizing |= self
                        .topology
                        .database_status(node, &self.request.database)
                        .await
                        .is_resynchronizing();
                }
            }

            if !reachable {
                warn!(
                    request = %self.request.id,
                    missing = ?missing,
                    "No missing node can answer, giving up the wait"
                );
                break;
            }

            let last_change = self.topology.last_change().await;
            if last_change > seen_change && last_change.elapsed() <= shape_window {
                seen_change = last_change;
                deadline += self.options.sync_timeout;
                info!(request = %self.request.id, "Topology changed recently, extending quorum wait");
            }

            if resynchronizing && !resync_extended {
                resync_extended = true;
                deadline += self.options.sync_timeout;
                info!(request = %self.request.id, "Node resynchronizing, extending quorum wait");
            }
        }

        self.metrics.quorum_wait(started.elapsed());

        let state = self.state.lock();
        if state.canceled {
            return Err(ReplicationError::Canceled);
        }
        if state.completed {
            return Ok(self.quorum_reached(&state));
        }

        self.metrics.timeout();
        warn!(
            request = %self.request.id,
            received = state.received.len(),
            expected = state.expected.len(),
            quorum = self.quorum,
            "Timeout waiting for responses"
        );
        Ok(self.quorum_reached(&state))
    }

    /// Authoritative response, or the failure to surface
    pub fn final_response(&self) -> Result<Option<Response>, ReplicationError> {
        self.conclude().response
    }

    /// Fix and undo messages for the participants
    pub fn reconcile(&self) -> Vec<RepairAction> {
        self.conclude().actions
    }

    pub fn conclude(&self) -> Outcome {
        let mut state = self.state.lock();
        let request_id = self.request.id;
        let task = &self.request.task;

        if self.request.quorum_type == QuorumType::None {
            state.conclusion = Conclusion::Passive;
            let response = match task.result_strategy() {
                ResultStrategy::Union => Some(self.union_response(&state)),
                ResultStrategy::Any => self.largest_representative(&state),
            };
            return Outcome {
                response: Ok(response),
                actions: Vec::new(),
            };
        }

        if state.received.is_empty() {
            state.conclusion = Conclusion::Failed;
            let response = if self.quorum > 0 && !task.is_idempotent() {
                Err(ReplicationError::QuorumNotReached {
                    request: request_id,
                    quorum: self.quorum,
                    received: 0,
                    detail: "no response received".to_string(),
                })
            } else {
                Ok(None)
            };
            return Outcome {
                response,
                actions: Vec::new(),
            };
        }

        if task.result_strategy() == ResultStrategy::Union || !self.options.group_responses {
            let member_count = state.received.keys().filter(|node| state.members.contains(*node)).count();
            if member_count >= self.quorum {
                state.conclusion = Conclusion::Passive;
                let response = match task.result_strategy() {
                    ResultStrategy::Union => Some(self.union_response(&state)),
                    ResultStrategy::Any => self.largest_representative(&state),
                };
                return Outcome {
                    response: Ok(response),
                    actions: Vec::new(),
                };
            }
            state.conclusion = Conclusion::Failed;
            return Outcome {
                response: Err(self.failure_error(&state)),
                actions: Vec::new(),
            };
        }

        if let Some(groups) = self.split_brain(&state) {
            error!(request = %request_id, task = task.name(), quorum = self.quorum, groups = %groups, "Split brain detected, no winner can be chosen");
            self.metrics.split_brain();
            let actions = self.undo_actions(&state);
            state.conclusion = Conclusion::Failed;
            return Outcome {
                response: Err(ReplicationError::SplitBrain {
                    request: request_id,
                    groups,
                }),
                actions,
            };
        }

        if self.quorum_reached(&state)
            && let Some(winner) = self.quorum_group(&state)
        {
            let good = state.groups[winner].value.clone();
            let representative = self.representative(&state, winner);

            if state.groups.len() == 1 {
                state.conclusion = Conclusion::Winner(good);
                return Outcome {
                    response: Ok(representative),
                    actions: Vec::new(),
                };
            }

            self.metrics.conflict();
            let mut actions = Vec::new();
            let mut unfixable = Vec::new();
            for (index, group) in state.groups.iter().enumerate() {
                if index == winner {
                    continue;
                }
                for node in &group.nodes {
                    match task.fix_task(request_id, &group.value, &good) {
                        Some(fix) => actions.push(RepairAction::Fix {
                            node: node.clone(),
                            task: fix,
                        }),
                        None => unfixable.push(node.clone()),
                    }
                }
            }

            if unfixable.is_empty() {
                warn!(
                    request = %request_id,
                    fixes = actions.len(),
                    groups = %self.dump_groups(&state),
                    "Quorum reached with conflicts, fixing diverged nodes"
                );
                state.conclusion = Conclusion::Winner(good);
                return Outcome {
                    response: Ok(representative),
                    actions,
                };
            }

            warn!(
                request = %request_id,
                nodes = ?unfixable,
                "Conflicting responses cannot be fixed, undoing the operation"
            );
            let conflict = unfixable
                .iter()
                .filter_map(|node| state.received.get(node))
                .find_map(|response| response.payload.as_ref().err().cloned());
            let actions = self.undo_actions(&state);
            state.conclusion = Conclusion::Failed;
            return Outcome {
                response: Err(match conflict {
                    Some(err) => ReplicationError::from_remote(err),
                    None => self.failure_error(&state),
                }),
                actions,
            };
        }

        let actions = self.undo_actions(&state);
        state.conclusion = Conclusion::Failed;
        Outcome {
            response: Err(self.failure_error(&state)),
            actions,
        }
    }

    /// Dump of the tied groups when the two largest successful groups tie at or
    /// above the quorum
    fn split_brain(&self, state: &QuorumState) -> Option<String> {
        let mut sizes: Vec<usize> = state
            .groups
            .iter()
            .filter(|group| group.value.is_ok())
            .map(|group| group.nodes.len())
            .collect();
        sizes.sort_unstable_by(|a, b| b.cmp(a));

        match sizes.as_slice() {
            [first, second, ..] if first == second && *first >= self.quorum.max(1) => Some(self.dump_groups(state)),
            _ => None,
        }
    }

    fn undo_actions(&self, state: &QuorumState) -> Vec<RepairAction> {
        state
            .received
            .iter()
            .filter(|(node, _)| **node != self.local)
            .filter_map(|(node, response)| {
                let result = response.payload.as_ref().ok()?;
                let task = self.request.task.undo_task(self.request.id, result)?;
                Some(RepairAction::Undo {
                    node: node.clone(),
                    task,
                })
            })
            .collect()
    }

    fn failure_error(&self, state: &QuorumState) -> ReplicationError {
        let payloads = || state.received.values().map(|response| &response.payload);

        if let Some(Err(locked)) = payloads().find(|payload| matches!(payload, Err(RemoteError::RecordLocked { .. }))) {
            return ReplicationError::from_remote(locked.clone());
        }
        if let Some(Err(create)) =
            payloads().find(|payload| matches!(payload, Err(RemoteError::ConcurrentCreate { .. })))
        {
            return ReplicationError::from_remote(create.clone());
        }
        if let Some(largest) = state.groups.iter().max_by_key(|group| group.nodes.len())
            && let Err(err) = &largest.value
        {
            return ReplicationError::from_remote(err.clone());
        }

        ReplicationError::QuorumNotReached {
            request: self.request.id,
            quorum: self.quorum,
            received: state.received.len(),
            detail: self.dump_groups(state),
        }
    }

    fn representative(&self, state: &QuorumState, group: usize) -> Option<Response> {
        let nodes = &state.groups.get(group)?.nodes;
        let node = nodes.iter().find(|node| **node == self.local).or_else(|| nodes.first())?;
        state.received.get(node).cloned()
    }

    fn largest_representative(&self, state: &QuorumState) -> Option<Response> {
        let largest = state
            .groups
            .iter()
            .enumerate()
            .max_by(|(ia, a), (ib, b)| a.nodes.len().cmp(&b.nodes.len()).then(ib.cmp(ia)))
            .map(|(index, _)| index);
        match largest {
            Some(index) => self.representative(state, index),
            None => state.received.values().next().cloned(),
        }
    }

    fn union_response(&self, state: &QuorumState) -> Response {
        let union = state
            .received
            .iter()
            .map(|(node, response)| (node.clone(), response.payload.clone()))
            .collect();
        Response::new(self.request.id, self.local.clone(), Ok(TaskResult::Union(union)))
    }

    fn dump_groups(&self, state: &QuorumState) -> String {
        let mut dump = String::new();
        for (index, group) in state.groups.iter().enumerate() {
            if index > 0 {
                dump.push_str("; ");
            }
            let _ = write!(dump, "{:?}={:?}", group.nodes, group.value);
        }
        dump
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::RecordId;
    use crate::message::{ExecutionMode, RawRecord};
    use meridian_topology::{DatabaseStatus, TopologyConfig};

    const DB: &str = "db";

    async fn topology(nodes: &[&str]) -> Arc<SystemTopology> {
        let topology = SystemTopology::new("test", TopologyConfig::default()).await.unwrap();
        for (index, node) in nodes.iter().enumerate() {
            topology
                .register_node(node.to_string(), index as u32 + 1, format!("{node}:2424"))
                .await;
            topology
                .set_database_status(node, DB, DatabaseStatus::Online)
                .await
                .unwrap();
        }
        Arc::new(topology)
    }

    fn nodes(names: &[&str]) -> BTreeSet<NodeId> {
        names.iter().map(|name| name.to_string()).collect()
    }

    fn update_request() -> Request {
        let rid = RecordId::new(1, 1);
        Request {
            id: RequestId::new(1, 10),
            sender: "a".to_string(),
            database: DB.to_string(),
            clusters: BTreeSet::from(["person".to_string()]),
            task: Task::UpdateRecord {
                rid,
                record: RawRecord::new("new", 2, b'd'),
                previous: Some(RawRecord::new("old", 1, b'd')),
            },
            execution_mode: ExecutionMode::Response,
            quorum_type: QuorumType::Write,
        }
    }

    fn options() -> CoordinatorOptions {
        CoordinatorOptions {
            sync_timeout: Duration::from_millis(200),
            check_interval: Duration::from_millis(50),
            cluster_shape_grace: Duration::ZERO,
            ..CoordinatorOptions::default()
        }
    }

    async fn coordinator(request: Request, all: &[&str], quorum: usize, options: CoordinatorOptions) -> ResponseCoordinator {
        ResponseCoordinator::new(
            request,
            "a",
            nodes(all),
            nodes(all),
            quorum,
            options,
            topology(all).await,
            Arc::new(ReplicationMetrics::new()),
        )
    }

    fn reply(node: &str, payload: Payload) -> Response {
        Response::new(RequestId::new(1, 10), node, payload)
    }

    /// Equal values share a group in the order they were first seen
    #[test]
    fn test_group_value_merges_equal_values() {
        let mut groups = Vec::new();
        group_value(&mut groups, "a".to_string(), Some(1));
        group_value(&mut groups, "b".to_string(), None);
        group_value(&mut groups, "c".to_string(), Some(1));

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].value, Some(1));
        assert_eq!(groups[0].nodes, vec!["a", "c"]);
        assert_eq!(groups[1].nodes, vec!["b"]);
    }

    #[tokio::test]
    async fn test_none_quorum_never_fails() {
        let mut request = update_request();
        request.quorum_type = QuorumType::None;
        let coordinator = coordinator(request, &["a", "b", "c"], 0, options()).await;

        assert!(coordinator.wait_for_quorum(Duration::from_millis(10)).await.unwrap());
        assert!(coordinator.final_response().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_silent_node_does_not_block_quorum() {
        let coordinator = coordinator(update_request(), &["a", "b", "c"], 2, options()).await;

        assert!(!coordinator.collect_response(reply("a", Ok(TaskResult::Version(2)))));
        assert!(coordinator.collect_response(reply("b", Ok(TaskResult::Version(2)))));
        assert!(coordinator.wait_for_quorum(Duration::from_secs(1)).await.unwrap());

        let outcome = coordinator.conclude();
        let response = outcome.response.unwrap().unwrap();
        assert_eq!(response.payload, Ok(TaskResult::Version(2)));
        assert!(outcome.actions.is_empty());
    }

    #[tokio::test]
    async fn test_minority_is_fixed_with_winner() {
        let coordinator = coordinator(update_request(), &["a", "b", "c"], 2, options()).await;

        coordinator.collect_response(reply("a", Ok(TaskResult::Version(2))));
        coordinator.collect_response(reply("b", Ok(TaskResult::Version(3))));
        assert!(!coordinator.is_completed());
        assert!(coordinator.collect_response(reply("c", Ok(TaskResult::Version(2)))));

        let outcome = coordinator.conclude();
        assert_eq!(outcome.response.unwrap().unwrap().executor, "a");
        assert_eq!(
            outcome.actions,
            vec![RepairAction::Fix {
                node: "b".to_string(),
                task: Task::FixUpdateRecord {
                    rid: RecordId::new(1, 1),
                    record: RawRecord::new("new", 2, b'd'),
                },
            }]
        );
    }

    #[tokio::test]
    async fn test_split_brain_sends_no_fix() {
        let coordinator = coordinator(update_request(), &["a", "b", "c", "d"], 2, options()).await;

        coordinator.collect_response(reply("a", Ok(TaskResult::Version(2))));
        coordinator.collect_response(reply("b", Ok(TaskResult::Version(2))));
        coordinator.collect_response(reply("c", Ok(TaskResult::Version(5))));
        coordinator.collect_response(reply("d", Ok(TaskResult::Version(5))));

        let outcome = coordinator.conclude();
        assert!(matches!(outcome.response, Err(ReplicationError::SplitBrain { .. })));
        assert!(outcome.actions.iter().all(RepairAction::is_undo));
        let undone: Vec<&str> = outcome.actions.iter().map(RepairAction::node).collect();
        assert_eq!(undone, vec!["b", "c", "d"]);
    }

    #[tokio::test]
    async fn test_three_way_tie_below_quorum_is_quorum_failure() {
        let coordinator = coordinator(update_request(), &["a", "b", "c"], 2, options()).await;

        coordinator.collect_response(reply("a", Ok(TaskResult::Version(2))));
        coordinator.collect_response(reply("b", Ok(TaskResult::Version(3))));
        coordinator.collect_response(reply("c", Ok(TaskResult::Version(4))));

        let outcome = coordinator.conclude();
        assert!(matches!(outcome.response, Err(ReplicationError::QuorumNotReached { .. })));
        assert_eq!(outcome.actions.len(), 2);
    }

    #[tokio::test]
    async fn test_locked_replicas_make_failure_retryable() {
        let coordinator = coordinator(update_request(), &["a", "b", "c"], 2, options()).await;
        let locked = RemoteError::RecordLocked {
            rid: RecordId::new(1, 1),
            owner: Some(RequestId::new(2, 1)),
        };

        coordinator.collect_response(reply("a", Ok(TaskResult::Version(2))));
        coordinator.collect_response(reply("b", Err(locked.clone())));
        coordinator.collect_response(reply("c", Err(locked)));

        let outcome = coordinator.conclude();
        let err = outcome.response.unwrap_err();
        assert!(err.is_retryable());
        assert!(outcome.actions.is_empty());
    }

    #[tokio::test]
    async fn test_locked_minority_undoes_everything() {
        let coordinator = coordinator(update_request(), &["a", "b", "c"], 2, options()).await;

        coordinator.collect_response(reply("a", Ok(TaskResult::Version(2))));
        coordinator.collect_response(reply("b", Ok(TaskResult::Version(2))));
        coordinator.collect_response(reply(
            "c",
            Err(RemoteError::RecordLocked {
                rid: RecordId::new(1, 1),
                owner: None,
            }),
        ));

        let outcome = coordinator.conclude();
        assert!(outcome.response.unwrap_err().is_retryable());
        assert_eq!(
            outcome.actions,
            vec![RepairAction::Undo {
                node: "b".to_string(),
                task: Task::FixUpdateRecord {
                    rid: RecordId::new(1, 1),
                    record: RawRecord::new("old", 1, b'd'),
                },
            }]
        );
    }

    #[tokio::test]
    async fn test_grouping_ignores_arrival_order() {
        let forward = coordinator(update_request(), &["a", "b", "c"], 2, options()).await;
        forward.collect_response(reply("a", Ok(TaskResult::Version(2))));
        forward.collect_response(reply("b", Ok(TaskResult::Version(3))));
        forward.collect_response(reply("c", Ok(TaskResult::Version(2))));

        let backward = coordinator(update_request(), &["a", "b", "c"], 2, options()).await;
        backward.collect_response(reply("c", Ok(TaskResult::Version(2))));
        backward.collect_response(reply("b", Ok(TaskResult::Version(3))));
        backward.collect_response(reply("a", Ok(TaskResult::Version(2))));

        let normalize = |coordinator: &ResponseCoordinator| {
            let mut groups: Vec<(Payload, BTreeSet<NodeId>)> = coordinator
                .groups()
                .into_iter()
                .map(|(payload, nodes)| (payload, nodes.into_iter().collect()))
                .collect();
            groups.sort_by_key(|(_, nodes)| nodes.iter().next().cloned());
            groups
        };
        assert_eq!(normalize(&forward), normalize(&backward));
    }

    #[tokio::test]
    async fn test_read_your_writes_waits_for_local() {
        let coordinator = coordinator(update_request(), &["a", "b", "c"], 2, options()).await;

        coordinator.collect_response(reply("b", Ok(TaskResult::Version(2))));
        assert!(!coordinator.collect_response(reply("c", Ok(TaskResult::Version(2)))));
        assert!(!coordinator.is_minimum_quorum_reached());
        assert!(coordinator.collect_response(reply("a", Ok(TaskResult::Version(2)))));
    }

    #[tokio::test]
    async fn test_remove_unreachable_completes() {
        let coordinator = coordinator(update_request(), &["a", "b", "c"], 3, options()).await;

        coordinator.collect_response(reply("a", Ok(TaskResult::Version(2))));
        coordinator.collect_response(reply("b", Ok(TaskResult::Version(2))));
        assert!(!coordinator.is_completed());

        assert!(coordinator.remove_unreachable("c"));
        assert!(coordinator.wait_for_quorum(Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_unexpected_and_duplicate_responses_are_ignored() {
        let coordinator = coordinator(update_request(), &["a", "b"], 2, options()).await;

        coordinator.collect_response(reply("z", Ok(TaskResult::Version(2))));
        coordinator.collect_response(reply("a", Ok(TaskResult::Version(2))));
        coordinator.collect_response(reply("a", Ok(TaskResult::Version(9))));

        assert_eq!(coordinator.received_count(), 1);
        assert_eq!(coordinator.groups().len(), 1);
    }

    #[tokio::test]
    async fn test_wait_ends_early_when_missing_nodes_are_gone() {
        let coordinator = coordinator(update_request(), &["a", "b", "c"], 2, options()).await;
        coordinator
            .topology
            .set_database_status("b", DB, DatabaseStatus::Offline)
            .await
            .unwrap();
        coordinator
            .topology
            .set_database_status("c", DB, DatabaseStatus::NotAvailable)
            .await
            .unwrap();

        coordinator.collect_response(reply("a", Ok(TaskResult::Version(2))));
        let started = Instant::now();
        assert!(!coordinator.wait_for_quorum(Duration::from_secs(5)).await.unwrap());
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(matches!(
            coordinator.final_response(),
            Err(ReplicationError::QuorumNotReached { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_wakes_waiter() {
        let coordinator = Arc::new(coordinator(update_request(), &["a", "b"], 2, options()).await);
        let canceler = Arc::clone(&coordinator);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceler.cancel();
        });

        assert!(matches!(
            coordinator.wait_for_quorum(Duration::from_secs(5)).await,
            Err(ReplicationError::Canceled)
        ));
    }

    #[tokio::test]
    async fn test_late_response_gets_followup_fix() {
        let coordinator = coordinator(update_request(), &["a", "b", "c"], 2, options()).await;
        coordinator.collect_response(reply("a", Ok(TaskResult::Version(2))));
        coordinator.collect_response(reply("b", Ok(TaskResult::Version(2))));
        assert!(coordinator.conclude().response.is_ok());

        coordinator.collect_response(reply("c", Err(RemoteError::Storage("disk full".into()))));
        let followups = coordinator.take_followups();
        assert_eq!(followups.len(), 1);
        assert_eq!(followups[0].node(), "c");
        assert!(!followups[0].is_undo());
        assert!(coordinator.take_followups().is_empty());
    }

    #[tokio::test]
    async fn test_union_strategy_merges_payloads() {
        let rid = RecordId::new(1, 1);
        let mut request = update_request();
        request.task = Task::RepairRecords { rids: vec![rid] };
        request.quorum_type = QuorumType::None;
        let coordinator = coordinator(request, &["a", "b"], 0, options()).await;

        coordinator.collect_response(reply("a", Ok(TaskResult::Records(vec![None]))));
        coordinator.collect_response(reply("b", Ok(TaskResult::Records(vec![None]))));

        match coordinator.final_response().unwrap().unwrap().payload {
            Ok(TaskResult::Union(map)) => assert_eq!(map.len(), 2),
            other => panic!("unexpected payload {other:?}"),
        }
    }
}
