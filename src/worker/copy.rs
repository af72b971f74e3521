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

//! File copy workers: push and pull over `scp` or `rcp`, one child per
//! destination, with the same event contract as command workers.
//!
//! Pulled files land in the destination directory suffixed with the
//! source node name (`file.node1`, `file.node2`, ...) so concurrent
//! retrievals never collide.

use std::path::Path;

use crate::engine::CommandLine;
use crate::nodeset::NodeSet;
use crate::task::TaskConfig;

use super::{split_args, ClientBuild, WorkerError, WorkerKind, WorkerOptions};

/// Copy transport selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyTransport {
    Scp,
    Rcp,
}

/// Copy a file or directory to (push) or from (pull) every node.
#[derive(Debug, Clone)]
pub struct CopyWorker {
    nodes: NodeSet,
    source: String,
    dest: String,
    transport: CopyTransport,
    /// pull from nodes instead of pushing to them
    reverse: bool,
    preserve: bool,
    options: WorkerOptions,
}

impl CopyWorker {
    pub fn new(
        nodes: NodeSet,
        source: impl Into<String>,
        dest: impl Into<String>,
        transport: CopyTransport,
    ) -> Self {
        CopyWorker {
            nodes,
            source: source.into(),
            dest: dest.into(),
            transport,
            reverse: false,
            preserve: false,
            options: WorkerOptions::default(),
        }
    }

    /// Pull `source` from each node into the `dest` directory.
    pub fn reverse(mut self) -> Self {
        self.reverse = true;
        self
    }

    /// Preserve file modification times and modes.
    pub fn preserve(mut self) -> Self {
        self.preserve = true;
        self
    }

    pub fn with_options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }

    fn is_dir(&self) -> bool {
        // reverse copy always targets a local directory
        self.reverse
            || Path::new(&self.source)
                .metadata()
                .map(|m| m.is_dir())
                .unwrap_or(false)
    }

    fn pull_dest(&self, node: &str) -> String {
        let base = Path::new(&self.source)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.source.clone());
        format!("{}/{}.{}", self.dest.trim_end_matches('/'), base, node)
    }

    fn argv(&self, config: &TaskConfig, node: &str) -> Vec<String> {
        let (path, user, options, bracket_host) = match self.transport {
            CopyTransport::Scp => (
                config.scp_path.as_deref().unwrap_or("scp"),
                config.scp_user.as_ref().or(config.ssh_user.as_ref()),
                config.scp_options.as_ref().or(config.ssh_options.as_ref()),
                true, // scp needs [host] for IPv6 literals
            ),
            CopyTransport::Rcp => (
                config.rcp_path.as_deref().unwrap_or("rcp"),
                config.rsh_user.as_ref(),
                config.rcp_options.as_ref().or(config.rsh_options.as_ref()),
                false,
            ),
        };

        let mut argv = split_args(path);
        if let Some(options) = options {
            argv.extend(split_args(options));
        }
        if self.is_dir() {
            argv.push("-r".to_string());
        }
        if self.preserve {
            argv.push("-p".to_string());
        }
        if self.transport == CopyTransport::Scp && config.connect_timeout > 0.0 {
            argv.push(format!("-oConnectTimeout={}", config.connect_timeout as u64));
        }

        let host = if bracket_host {
            format!("[{node}]")
        } else {
            node.to_string()
        };
        let remote = |path: &str| match user {
            Some(user) => format!("{user}@{host}:{path}"),
            None => format!("{host}:{path}"),
        };

        if self.reverse {
            argv.push(remote(&self.source));
            argv.push(self.pull_dest(node));
        } else {
            argv.push(self.source.clone());
            argv.push(remote(&self.dest));
        }
        argv
    }
}

impl WorkerKind for CopyWorker {
    fn name(&self) -> &'static str {
        match self.transport {
            CopyTransport::Scp => "scp",
            CopyTransport::Rcp => "rcp",
        }
    }

    fn build_clients(&self, config: &TaskConfig) -> Result<Vec<ClientBuild>, WorkerError> {
        if self.nodes.is_empty() {
            return Err(WorkerError::NoTargets);
        }
        if self.source.is_empty() || self.dest.is_empty() {
            return Err(WorkerError::InvalidOptions {
                reason: "copy requires both source and dest".to_string(),
            });
        }
        Ok(self
            .nodes
            .iter()
            .map(|node| ClientBuild {
                key: node.clone(),
                command: CommandLine::Argv(self.argv(config, &node)),
                env: Vec::new(),
            })
            .collect())
    }

    fn target_nodes(&self) -> Option<&NodeSet> {
        Some(&self.nodes)
    }

    fn options(&self) -> &WorkerOptions {
        &self.options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns(s: &str) -> NodeSet {
        s.parse().unwrap()
    }

    #[test]
    fn test_push_argv() {
        let worker = CopyWorker::new(ns("n1"), "/etc/hosts", "/etc/hosts", CopyTransport::Scp);
        let clients = worker.build_clients(&TaskConfig::default()).unwrap();
        match &clients[0].command {
            CommandLine::Argv(argv) => {
                assert_eq!(argv[0], "scp");
                assert_eq!(argv[argv.len() - 2], "/etc/hosts");
                assert_eq!(argv[argv.len() - 1], "[n1]:/etc/hosts");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_pull_argv_suffixes_node() {
        let worker =
            CopyWorker::new(ns("n[1-2]"), "/var/log/messages", "/tmp/logs", CopyTransport::Scp)
                .reverse();
        let clients = worker.build_clients(&TaskConfig::default()).unwrap();
        match &clients[1].command {
            CommandLine::Argv(argv) => {
                assert_eq!(argv[argv.len() - 2], "[n2]:/var/log/messages");
                assert_eq!(argv[argv.len() - 1], "/tmp/logs/messages.n2");
                assert!(argv.contains(&"-r".to_string()));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_rcp_plain_host() {
        let worker = CopyWorker::new(ns("n1"), "/a", "/b", CopyTransport::Rcp);
        let clients = worker.build_clients(&TaskConfig::default()).unwrap();
        match &clients[0].command {
            CommandLine::Argv(argv) => {
                assert_eq!(argv[0], "rcp");
                assert_eq!(argv[argv.len() - 1], "n1:/b");
                assert!(!argv.iter().any(|a| a.starts_with("-oConnectTimeout")));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_missing_paths() {
        let worker = CopyWorker::new(ns("n1"), "", "/b", CopyTransport::Scp);
        assert!(matches!(
            worker.build_clients(&TaskConfig::default()),
            Err(WorkerError::InvalidOptions { .. })
        ));
    }
}
