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

//! Local process worker, one child per target node.
//!
//! The command is a shell string with optional placeholders replaced per
//! destination: `%h`/`%host` (target node name), `%n`/`%rank` (zero-based
//! destination rank) and `%hosts` (the full folded target set, which also
//! switches the worker to a single client). `%%` escapes a literal `%`.
//! This is the building block the remote-shell workers derive from.

use crate::engine::CommandLine;
use crate::nodeset::NodeSet;
use crate::task::TaskConfig;

use super::{ClientBuild, WorkerError, WorkerKind, WorkerOptions};

/// Replace `%`-keywords in `pattern` for one destination.
pub(crate) fn replace_cmd(
    pattern: &str,
    node: &str,
    rank: usize,
    hosts: &str,
) -> Result<String, WorkerError> {
    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('%') => {
                chars.next();
                out.push('%');
            }
            Some(c) if c.is_ascii_alphabetic() || *c == '_' => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match ident.as_str() {
                    "h" | "host" => out.push_str(node),
                    "hosts" => out.push_str(hosts),
                    "n" | "rank" => out.push_str(&rank.to_string()),
                    _ => return Err(WorkerError::BadPlaceholder { token: ident }),
                }
            }
            _ => {
                return Err(WorkerError::BadPlaceholder {
                    token: String::new(),
                })
            }
        }
    }
    Ok(out)
}

/// Run a local command for each node of a node set.
#[derive(Debug, Clone)]
pub struct ExecWorker {
    nodes: NodeSet,
    command: String,
    options: WorkerOptions,
}

impl ExecWorker {
    pub fn new(nodes: NodeSet, command: impl Into<String>) -> Self {
        ExecWorker {
            nodes,
            command: command.into(),
            options: WorkerOptions::default(),
        }
    }

    pub fn with_options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn nodes(&self) -> &NodeSet {
        &self.nodes
    }
}

impl WorkerKind for ExecWorker {
    fn name(&self) -> &'static str {
        "exec"
    }

    fn build_clients(&self, _config: &TaskConfig) -> Result<Vec<ClientBuild>, WorkerError> {
        if self.nodes.is_empty() {
            return Err(WorkerError::NoTargets);
        }
        let hosts = self.nodes.to_string();

        // %hosts addresses the whole target set through one client
        if self.command.contains("%hosts") {
            let cmd = replace_cmd(&self.command, &hosts, 0, &hosts)?;
            return Ok(vec![ClientBuild {
                key: hosts,
                command: CommandLine::Shell(cmd),
                env: Vec::new(),
            }]);
        }

        let mut clients = Vec::new();
        for (rank, node) in self.nodes.iter().enumerate() {
            let cmd = replace_cmd(&self.command, &node, rank, &hosts)?;
            clients.push(ClientBuild {
                key: node,
                command: CommandLine::Shell(cmd),
                env: Vec::new(),
            });
        }
        Ok(clients)
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
    fn test_replace_cmd() {
        assert_eq!(
            replace_cmd("echo %h rank %n", "n1", 3, "n[1-5]").unwrap(),
            "echo n1 rank 3"
        );
        assert_eq!(
            replace_cmd("ping -c1 %host", "n2", 0, "n2").unwrap(),
            "ping -c1 n2"
        );
        assert_eq!(replace_cmd("100%% done", "n1", 0, "n1").unwrap(), "100% done");
        assert!(matches!(
            replace_cmd("echo %unknown", "n1", 0, "n1"),
            Err(WorkerError::BadPlaceholder { .. })
        ));
    }

    #[test]
    fn test_per_node_clients() {
        let worker = ExecWorker::new(ns("n[1-3]"), "echo %h");
        let clients = worker.build_clients(&TaskConfig::default()).unwrap();
        assert_eq!(clients.len(), 3);
        assert_eq!(clients[0].key, "n1");
        match &clients[2].command {
            CommandLine::Shell(cmd) => assert_eq!(cmd, "echo n3"),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_hosts_placeholder_single_client() {
        let worker = ExecWorker::new(ns("n[1-3]"), "pdcp -w %hosts");
        let clients = worker.build_clients(&TaskConfig::default()).unwrap();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].key, "n[1-3]");
        match &clients[0].command {
            CommandLine::Shell(cmd) => assert_eq!(cmd, "pdcp -w n[1-3]"),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_no_targets() {
        let worker = ExecWorker::new(NodeSet::new(), "true");
        assert!(matches!(
            worker.build_clients(&TaskConfig::default()),
            Err(WorkerError::NoTargets)
        ));
    }
}
