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

//! Parallel cluster command execution framework.
//!
//! `muster` executes shell commands and copies files in parallel across
//! large sets of remote hosts, folds identical outputs, and relays work
//! hierarchically through gateway nodes:
//!
//! - [`rangeset`] / [`nodeset`]: compact folded host set algebra
//!   (`node[1-99]`, groups, wildcards, set operators)
//! - [`msgtree`]: output aggregation keyed by producer sets
//! - [`engine`] / [`event`]: the single-threaded cooperative reactor and
//!   its event protocol
//! - [`worker`]: command and copy workers (exec, ssh, rsh, popen, scp/rcp)
//! - [`task`]: the per-thread façade tying it all together
//! - [`tree`]: gateway propagation with a framed, versioned wire protocol

pub mod engine;
pub mod event;
pub mod msgtree;
pub mod nodeset;
pub mod rangeset;
pub mod task;
pub mod tree;
pub mod worker;

pub use event::{EventHandler, NullHandler, StreamKind, TimerId, WorkerId};
pub use msgtree::MsgTree;
pub use nodeset::NodeSet;
pub use rangeset::{RangeSet, RangeSetND};
pub use task::{task_self, task_wait, Task, TaskConfig, TaskError};
pub use worker::{CopyWorker, ExecWorker, PopenWorker, RshWorker, SshWorker, WorkerOptions};
