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

//! Conflict resolution for divergent record copies
//!
//! Resolvers are chained: each one either names a winner or narrows the
//! candidates handed to the next. When the chain runs out without a winner
//! the copies are in split brain and left alone.

use crate::error::ReplicationError;
use crate::id::RecordId;
use crate::message::RawRecord;
use crate::response::ValueGroup;
use std::sync::Arc;
use tracing::debug;

/// One distinct copy of a record and the nodes holding it; the value is
/// `None` when the nodes do not have the record
pub type Candidate = ValueGroup<Option<RawRecord>>;

#[derive(Debug, Clone, Copy)]
pub struct ConflictContext<'a> {
    pub database: &'a str,
    pub cluster: &'a str,
    pub rid: RecordId,
    /// Write quorum of the record's cluster
    pub quorum: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub winner: Option<Candidate>,
    /// Candidates still in contention for the next resolver
    pub remaining: Vec<Candidate>,
}

impl Resolution {
    fn winner(candidate: &Candidate) -> Self {
        Self {
            winner: Some(candidate.clone()),
            remaining: Vec::new(),
        }
    }

    fn undecided(remaining: Vec<Candidate>) -> Self {
        Self { winner: None, remaining }
    }
}

pub trait ConflictResolver: Send + Sync {
    fn name(&self) -> &'static str;

    fn resolve(&self, context: &ConflictContext<'_>, candidates: &[Candidate]) -> Resolution;
}

/// The only copy held by at least a write quorum of nodes wins
#[derive(Debug, Default)]
pub struct QuorumResolver;

impl ConflictResolver for QuorumResolver {
    fn name(&self) -> &'static str {
        "quorum"
    }

    fn resolve(&self, context: &ConflictContext<'_>, candidates: &[Candidate]) -> Resolution {
        let mut reaching = candidates
            .iter()
            .filter(|candidate| context.quorum > 0 && candidate.nodes.len() >= context.quorum);
        match (reaching.next(), reaching.next()) {
            (Some(winner), None) => Resolution::winner(winner),
            _ => Resolution::undecided(candidates.to_vec()),
        }
    }
}

/// The copy held by strictly more nodes than any other wins
#[derive(Debug, Default)]
pub struct MajorityResolver;

impl ConflictResolver for MajorityResolver {
    fn name(&self) -> &'static str {
        "majority"
    }

    fn resolve(&self, _context: &ConflictContext<'_>, candidates: &[Candidate]) -> Resolution {
        let largest = candidates.iter().map(|candidate| candidate.nodes.len()).max().unwrap_or(0);
        let top: Vec<Candidate> = candidates
            .iter()
            .filter(|candidate| candidate.nodes.len() == largest)
            .cloned()
            .collect();

        match top.as_slice() {
            [winner] => Resolution::winner(winner),
            _ => Resolution::undecided(top),
        }
    }
}

/// The existing copy with the highest version wins
#[derive(Debug, Default)]
pub struct VersionResolver;

impl ConflictResolver for VersionResolver {
    fn name(&self) -> &'static str {
        "version"
    }

    fn resolve(&self, _context: &ConflictContext<'_>, candidates: &[Candidate]) -> Resolution {
        let version = |candidate: &Candidate| candidate.value.as_ref().map(|record| record.version);
        let Some(highest) = candidates.iter().filter_map(version).max() else {
            return Resolution::undecided(candidates.to_vec());
        };

        let top: Vec<Candidate> = candidates
            .iter()
            .filter(|candidate| version(candidate) == Some(highest))
            .cloned()
            .collect();
        match top.as_slice() {
            [winner] => Resolution::winner(winner),
            _ => Resolution::undecided(top),
        }
    }
}

/// Ordered chain of resolvers
#[derive(Clone)]
pub struct ConflictResolverChain {
    resolvers: Vec<Arc<dyn ConflictResolver>>,
}

impl ConflictResolverChain {
    pub fn new(resolvers: Vec<Arc<dyn ConflictResolver>>) -> Self {
        Self { resolvers }
    }

    /// Build the chain from resolver names, e.g. `["quorum", "majority", "version"]`
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, ReplicationError> {
        let resolvers = names
            .iter()
            .map(|name| -> Result<Arc<dyn ConflictResolver>, ReplicationError> {
                match name.as_ref() {
                    "quorum" => Ok(Arc::new(QuorumResolver)),
                    "majority" => Ok(Arc::new(MajorityResolver)),
                    "version" => Ok(Arc::new(VersionResolver)),
                    other => Err(ReplicationError::Configuration(format!(
                        "unknown conflict resolver '{other}', available: quorum, majority, version"
                    ))),
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(resolvers))
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.resolvers.iter().map(|resolver| resolver.name()).collect()
    }

    /// Winning copy, or `None` for split brain
    pub fn resolve(&self, context: &ConflictContext<'_>, candidates: Vec<Candidate>) -> Option<Candidate> {
        let mut candidates = candidates;
        for resolver in &self.resolvers {
            if candidates.is_empty() {
                break;
            }
            let resolution = resolver.resolve(context, &candidates);
            if let Some(winner) = resolution.winner {
                debug!(rid = %context.rid, resolver = resolver.name(), nodes = ?winner.nodes, "Conflict resolved");
                return Some(winner);
            }
            candidates = resolution.remaining;
        }
        None
    }
}

impl Default for ConflictResolverChain {
    fn default() -> Self {
        Self::new(vec![Arc::new(QuorumResolver), Arc::new(MajorityResolver), Arc::new(VersionResolver)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(value: Option<(&'static str, u32)>, nodes: &[&str]) -> Candidate {
        Candidate {
            value: value.map(|(content, version)| RawRecord::new(content, version, b'd')),
            nodes: nodes.iter().map(|node| node.to_string()).collect(),
        }
    }

    fn context(quorum: usize) -> ConflictContext<'static> {
        ConflictContext {
            database: "db",
            cluster: "person",
            rid: RecordId::new(1, 1),
            quorum,
        }
    }

    #[test]
    fn test_quorum_winner() {
        let chain = ConflictResolverChain::default();
        let winner = chain.resolve(
            &context(2),
            vec![candidate(Some(("a", 3)), &["n1"]), candidate(Some(("b", 2)), &["n2", "n3"])],
        );
        assert_eq!(winner.unwrap().nodes, vec!["n2", "n3"]);
    }

    #[test]
    fn test_version_breaks_majority_tie() {
        let chain = ConflictResolverChain::from_names(&["quorum", "majority", "version"]).unwrap();
        let winner = chain.resolve(
            &context(3),
            vec![
                candidate(Some(("a", 3)), &["n1", "n2"]),
                candidate(Some(("b", 5)), &["n3", "n4"]),
                candidate(None, &["n5"]),
            ],
        );
        assert_eq!(winner.unwrap().value.unwrap().version, 5);
    }

    #[test]
    fn test_full_tie_is_split_brain() {
        let chain = ConflictResolverChain::default();
        let winner = chain.resolve(
            &context(2),
            vec![candidate(Some(("a", 3)), &["n1"]), candidate(Some(("b", 3)), &["n2"])],
        );
        assert!(winner.is_none());
    }

    #[test]
    fn test_missing_copy_can_win() {
        let chain = ConflictResolverChain::from_names(&["majority"]).unwrap();
        let winner = chain
            .resolve(
                &context(0),
                vec![candidate(Some(("a", 1)), &["n1"]), candidate(None, &["n2", "n3"])],
            )
            .unwrap();
        assert!(winner.value.is_none());
    }

    #[test]
    fn test_unknown_resolver_name() {
        assert!(matches!(
            ConflictResolverChain::from_names(&["dc"]),
            Err(ReplicationError::Configuration(_))
        ));
    }
}
