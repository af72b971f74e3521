// Copyright 2025 Lablup Inc. and Jeongkyu Shin
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

//! Error types for range set parsing

use thiserror::Error;

/// Errors that can occur while parsing a range set expression
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RangeSetError {
    /// Empty subrange (e.g. `1,,3` or a bare empty string)
    #[error("empty range in \"{subrange}\"")]
    EmptyRange { subrange: String },

    /// Non-numeric token where an index was expected
    #[error("cannot convert string to integer: \"{subrange}\"")]
    InvalidNumber { subrange: String },

    /// Reversed range (e.g. `5-3`)
    #[error("invalid values in range \"{subrange}\" (start must be <= end)")]
    ReversedRange { subrange: String },

    /// Step used on a single index, or a step of zero
    #[error("invalid step usage in \"{subrange}\"")]
    InvalidStep { subrange: String },

    /// Zero-padded endpoints of different lengths (e.g. `05-010`)
    #[error("padding mismatch in \"{subrange}\"")]
    PaddingMismatch { subrange: String },

    /// Range would expand to an unreasonable number of items
    #[error("range too large in \"{subrange}\"")]
    RangeTooLarge { subrange: String },
}

impl RangeSetError {
    /// The faulty subrange, to let callers target the error.
    pub fn subrange(&self) -> &str {
        match self {
            Self::EmptyRange { subrange }
            | Self::InvalidNumber { subrange }
            | Self::ReversedRange { subrange }
            | Self::InvalidStep { subrange }
            | Self::PaddingMismatch { subrange }
            | Self::RangeTooLarge { subrange } => subrange,
        }
    }
}
