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

//! Error types for node set parsing and group resolution

use thiserror::Error;

use crate::rangeset::RangeSetError;

use super::resolver::ResolverError;

/// Errors that can occur while parsing a node set expression or resolving
/// node groups.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NodeSetError {
    /// A bracket range failed to parse
    #[error("bad range in \"{part}\": {source}")]
    BadRange {
        part: String,
        source: RangeSetError,
    },

    /// Opening bracket without its closing counterpart
    #[error("missing bracket in \"{part}\"")]
    MissingBracket { part: String },

    /// Closing bracket with no opening counterpart
    #[error("illegal closing bracket in \"{part}\"")]
    IllegalClosingBracket { part: String },

    /// Bracket reopened directly after a closing bracket (`a[1][2]` style
    /// patterns need a separator)
    #[error("illegal reopening bracket in \"{part}\"")]
    IllegalReopeningBracket { part: String },

    /// Binary operator with a missing operand
    #[error("missing nodeset operand with '{op}' operator")]
    MissingOperand { op: char },

    /// `/step` ranges cannot be combined with digits after the bracket
    #[error("illegal trailing digits after range with steps in \"{part}\"")]
    TrailingDigitsAfterStep { part: String },

    /// Catch-all scan failure
    #[error("parse error in \"{part}\"")]
    Parse { part: String },

    /// A group source upcall failed
    #[error("group resolution failed: {source}")]
    External {
        #[from]
        source: ResolverError,
    },

    /// Not enough upcalls available to compute the "all nodes" set
    #[error("not enough working upcalls (all, or map + list) to get all nodes of source '{group_source}'")]
    AllNodesUnavailable { group_source: String },
}

impl NodeSetError {
    pub(crate) fn bad_range(part: &str, source: RangeSetError) -> Self {
        NodeSetError::BadRange {
            part: part.to_string(),
            source,
        }
    }
}
