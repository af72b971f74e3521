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

//! Worker hierarchy
//!
//! A worker is one unit of user-requested work: a command or a file copy
//! that may address many destinations. All variants emit the same event
//! sequence per destination (`start, pickup, read*, hup, close`) and are
//! driven identically by the engine:
//!
//! - [`ExecWorker`]: local commands, one child per node, with `%h`-style
//!   placeholders
//! - [`SshWorker`] / [`RshWorker`]: remote shell argv synthesis around
//!   opaque `ssh`/`rsh` child processes
//! - [`CopyWorker`]: push/pull file copy over `scp`/`rcp`
//! - [`PopenWorker`]: a single local command with no target set
//! - `TreeWorker` (see [`crate::tree`]): gateway-relayed execution

pub mod copy;
pub mod exec;
pub mod popen;
pub mod rsh;
pub mod ssh;

pub use copy::{CopyTransport, CopyWorker};
pub use exec::ExecWorker;
pub use popen::PopenWorker;
pub use rsh::RshWorker;
pub use ssh::SshWorker;

use thiserror::Error;

use crate::engine::CommandLine;
use crate::nodeset::NodeSet;
use crate::task::TaskConfig;

/// Key used by local single-process workers that have no target node.
pub const LOCAL_KEY: &str = "(local)";

/// Errors raised while preparing a worker's clients.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// Unknown `%` placeholder in a command pattern
    #[error("'%{token}' is not a valid pattern, use '%%' to escape '%'")]
    BadPlaceholder { token: String },

    /// Worker was given an empty node set
    #[error("worker has no target nodes")]
    NoTargets,

    /// Inconsistent worker parameters
    #[error("invalid worker options: {reason}")]
    InvalidOptions { reason: String },
}

/// Per-worker overrides of task-level defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerOptions {
    /// deliver stderr separately (default: task `stderr` flag)
    pub stderr: Option<bool>,
    /// plumb stdin (default: task `stdin` flag)
    pub stdin: Option<bool>,
    /// connect deadline override, seconds
    pub connect_timeout: Option<f64>,
    /// command deadline override, seconds
    pub command_timeout: Option<f64>,
}

/// One destination's launch recipe, produced by a worker at resume time.
#[derive(Debug, Clone)]
pub(crate) struct ClientBuild {
    pub key: String,
    pub command: CommandLine,
    pub env: Vec<(String, String)>,
}

/// Common behavior of command and copy workers: turn the worker
/// description into one client per destination.
pub(crate) trait WorkerKind {
    fn name(&self) -> &'static str;

    /// Build the client list from the task configuration.
    fn build_clients(&self, config: &TaskConfig) -> Result<Vec<ClientBuild>, WorkerError>;

    /// Target node set, when the worker addresses nodes.
    fn target_nodes(&self) -> Option<&NodeSet> {
        None
    }

    fn options(&self) -> &WorkerOptions;
}

/// Split a path or option string into argv fragments on whitespace, with
/// `~` expanded to `$HOME` at fragment start.
pub(crate) fn split_args(s: &str) -> Vec<String> {
    s.split_whitespace().map(expand_user).collect()
}

fn expand_user(arg: &str) -> String {
    if let Some(rest) = arg.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{home}/{rest}");
        }
    }
    arg.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_args() {
        assert_eq!(split_args("ssh -p 2222"), vec!["ssh", "-p", "2222"]);
        assert!(split_args("").is_empty());
    }

    #[test]
    fn test_expand_user() {
        std::env::set_var("HOME", "/home/test");
        assert_eq!(
            split_args("-i ~/.ssh/id_rsa"),
            vec!["-i", "/home/test/.ssh/id_rsa"]
        );
    }
}
