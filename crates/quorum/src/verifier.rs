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

//! Quorum verification logic

use crate::error::QuorumError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of quorum a replicated request asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QuorumType {
    /// Fire and forget, the caller does not wait for anybody
    #[default]
    None,

    /// Read quorum over every server owning the involved clusters
    Read,

    /// Write quorum over the master servers owning the involved clusters
    Write,

    /// Every server owning the involved clusters
    All,
}

/// Configured quorum size, as written in the distributed configuration
///
/// Accepts `"majority"`, `"all"` or a plain number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SettingRepr", into = "SettingRepr")]
pub enum QuorumSetting {
    /// N/2 + 1 of the nodes the setting applies to
    Majority,

    /// All of the nodes the setting applies to
    All,

    /// An explicit number of nodes
    Fixed(usize),
}

impl QuorumSetting {
    /// Resolve the setting against a number of nodes
    pub fn resolve(&self, nodes: usize) -> usize {
        match self {
            QuorumSetting::Majority => nodes / 2 + 1,
            QuorumSetting::All => nodes,
            QuorumSetting::Fixed(count) => *count,
        }
    }
}

impl fmt::Display for QuorumSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuorumSetting::Majority => f.write_str("majority"),
            QuorumSetting::All => f.write_str("all"),
            QuorumSetting::Fixed(count) => write!(f, "{count}"),
        }
    }
}

impl FromStr for QuorumSetting {
    type Err = QuorumError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "majority" => Ok(QuorumSetting::Majority),
            "all" => Ok(QuorumSetting::All),
            other => other
                .parse::<usize>()
                .map(QuorumSetting::Fixed)
                .map_err(|_| QuorumError::InvalidConfiguration {
                    reason: format!("unknown quorum value '{value}'"),
                }),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum SettingRepr {
    Count(usize),
    Keyword(String),
}

impl TryFrom<SettingRepr> for QuorumSetting {
    type Error = QuorumError;

    fn try_from(repr: SettingRepr) -> Result<Self, Self::Error> {
        match repr {
            SettingRepr::Count(count) => Ok(QuorumSetting::Fixed(count)),
            SettingRepr::Keyword(keyword) => keyword.parse(),
        }
    }
}

impl From<QuorumSetting> for SettingRepr {
    fn from(setting: QuorumSetting) -> Self {
        match setting {
            QuorumSetting::Fixed(count) => SettingRepr::Count(count),
            other => SettingRepr::Keyword(other.to_string()),
        }
    }
}

/// Node counts a quorum is computed from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuorumInput {
    /// Servers configured for the involved clusters, reachable or not
    pub total_servers: usize,

    /// Configured servers with the master role
    pub master_servers: usize,

    /// Nodes that count toward the quorum and can answer right now
    pub available_members: usize,
}

/// Quorum verifier for replicated operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuorumVerifier {
    read: QuorumSetting,
    write: QuorumSetting,
}

impl QuorumVerifier {
    /// Create a new quorum verifier
    pub fn new(read: QuorumSetting, write: QuorumSetting) -> Self {
        Self { read, write }
    }

    /// Read quorum for the given number of servers
    pub fn read_quorum(&self, servers: usize) -> usize {
        self.read.resolve(servers)
    }

    /// Write quorum for the given number of master servers
    pub fn write_quorum(&self, masters: usize) -> usize {
        self.write.resolve(masters)
    }

    /// Compute the quorum for a request and reject it when it cannot be met
    pub fn calculate(&self, quorum_type: QuorumType, input: &QuorumInput) -> Result<usize, QuorumError> {
        let quorum = match quorum_type {
            QuorumType::None => return Ok(0),
            QuorumType::Read => self.read_quorum(input.total_servers),
            QuorumType::Write => self.write_quorum(input.master_servers),
            QuorumType::All => input.total_servers,
        };

        if quorum <= input.available_members {
            return Ok(quorum);
        }

        let required = quorum;
        let available = input.available_members;
        Err(match quorum_type {
            QuorumType::Read => QuorumError::InsufficientReadQuorum { required, available },
            QuorumType::Write => QuorumError::InsufficientWriteQuorum { required, available },
            _ => QuorumError::InsufficientNodes { required, available },
        })
    }

    /// Check if write quorum is met
    pub fn check_write_quorum(&self, masters: usize, available_masters: usize) -> bool {
        available_masters >= self.write_quorum(masters)
    }

    /// Check if read quorum is met
    pub fn check_read_quorum(&self, servers: usize, available: usize) -> bool {
        available >= self.read_quorum(servers)
    }
}

impl Default for QuorumVerifier {
    /// Reads from a single node, writes to a majority
    fn default() -> Self {
        Self::new(QuorumSetting::Fixed(1), QuorumSetting::Majority)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(total: usize, masters: usize, available: usize) -> QuorumInput {
        QuorumInput {
            total_servers: total,
            master_servers: masters,
            available_members: available,
        }
    }

    #[test]
    fn test_write_quorum() {
        let verifier = QuorumVerifier::default();
        assert_eq!(verifier.write_quorum(4), 3);
        assert_eq!(verifier.write_quorum(3), 2);

        assert!(verifier.check_write_quorum(4, 3));
        assert!(!verifier.check_write_quorum(4, 2));
    }

    #[test]
    fn test_read_quorum() {
        let verifier = QuorumVerifier::new(QuorumSetting::Majority, QuorumSetting::All);
        assert_eq!(verifier.read_quorum(4), 3);
        assert_eq!(verifier.write_quorum(4), 4);

        assert!(verifier.check_read_quorum(4, 3));
        assert!(!verifier.check_read_quorum(4, 1));
    }

    #[test]
    fn test_write_quorum_counts_masters_only() {
        let verifier = QuorumVerifier::default();
        // 5 servers, 3 of them masters: majority of masters
        assert_eq!(verifier.calculate(QuorumType::Write, &input(5, 3, 3)).unwrap(), 2);
        assert_eq!(verifier.calculate(QuorumType::All, &input(5, 3, 5)).unwrap(), 5);
    }

    #[test]
    fn test_none_never_fails() {
        let verifier = QuorumVerifier::new(QuorumSetting::All, QuorumSetting::All);
        assert_eq!(verifier.calculate(QuorumType::None, &input(3, 3, 0)).unwrap(), 0);
    }

    #[test]
    fn test_quorum_above_available_is_rejected() {
        let verifier = QuorumVerifier::new(QuorumSetting::Fixed(2), QuorumSetting::All);

        let err = verifier.calculate(QuorumType::Write, &input(3, 3, 2)).unwrap_err();
        assert_eq!(
            err,
            QuorumError::InsufficientWriteQuorum {
                required: 3,
                available: 2
            }
        );

        let err = verifier.calculate(QuorumType::Read, &input(3, 3, 1)).unwrap_err();
        assert!(matches!(err, QuorumError::InsufficientReadQuorum { required: 2, .. }));

        let err = verifier.calculate(QuorumType::All, &input(3, 3, 2)).unwrap_err();
        assert!(matches!(err, QuorumError::InsufficientNodes { required: 3, .. }));
    }

    #[test]
    fn test_setting_parsing() {
        assert_eq!("majority".parse::<QuorumSetting>().unwrap(), QuorumSetting::Majority);
        assert_eq!("ALL".parse::<QuorumSetting>().unwrap(), QuorumSetting::All);
        assert_eq!("2".parse::<QuorumSetting>().unwrap(), QuorumSetting::Fixed(2));
        assert!("most".parse::<QuorumSetting>().is_err());
    }

    #[test]
    fn test_setting_serde() {
        let settings: Vec<QuorumSetting> = serde_json::from_str(r#"["majority", 2, "all"]"#).unwrap();
        assert_eq!(
            settings,
            vec![QuorumSetting::Majority, QuorumSetting::Fixed(2), QuorumSetting::All]
        );

        let encoded = serde_json::to_string(&settings).unwrap();
        assert_eq!(encoded, r#"["majority",2,"all"]"#);
    }
}
