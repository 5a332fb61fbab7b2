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

//! # Meridian Quorum Management
//!
//! Quorum arithmetic for per-operation replication. Every replicated request
//! carries a [`QuorumType`]; the distributed database configuration carries a
//! [`QuorumSetting`] for reads and writes. [`QuorumVerifier`] turns the two into
//! the number of equivalent responses an operation needs.
//!
//! ## Quorum Rules
//!
//! - **None**: no response is required
//! - **Read**: the configured read quorum over all servers of the involved clusters
//! - **Write**: the configured write quorum over the master servers only
//! - **All**: every server of the involved clusters
//!
//! A quorum larger than the number of nodes that can currently answer is a
//! configuration error and is reported before anything is sent.
//!
//! ## Example
//!
//! ```rust
//! use meridian_quorum::{QuorumInput, QuorumSetting, QuorumType, QuorumVerifier};
//!
//! let verifier = QuorumVerifier::new(QuorumSetting::Fixed(1), QuorumSetting::Majority);
//!
//! let input = QuorumInput {
//!     total_servers: 3,
//!     master_servers: 3,
//!     available_members: 3,
//! };
//! assert_eq!(verifier.calculate(QuorumType::Write, &input).unwrap(), 2);
//! ```

pub mod error;
pub mod verifier;

pub use error::QuorumError;
pub use verifier::{QuorumInput, QuorumSetting, QuorumType, QuorumVerifier};
