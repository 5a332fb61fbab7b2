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

//! Quorum-related error types

use thiserror::Error;

/// Errors related to quorum operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuorumError {
    /// Fewer master nodes can answer than the write quorum requires
    #[error("Insufficient write quorum: required {required}, available {available}")]
    InsufficientWriteQuorum { required: usize, available: usize },

    /// Fewer nodes can answer than the read quorum requires
    #[error("Insufficient read quorum: required {required}, available {available}")]
    InsufficientReadQuorum { required: usize, available: usize },

    /// An ALL quorum was requested while some servers are not available
    #[error("Quorum ALL cannot be reached: required {required}, available {available}")]
    InsufficientNodes { required: usize, available: usize },

    /// Quorum configuration is invalid
    #[error("Invalid quorum configuration: {reason}")]
    InvalidConfiguration { reason: String },
}
