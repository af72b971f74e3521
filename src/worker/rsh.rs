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

//! Classic `rsh` remote shell worker (also fits `krsh`/`mrsh` through
//! `rsh_path`). Unlike ssh, rsh has no connect-timeout option to forward.

use crate::engine::CommandLine;
use crate::nodeset::NodeSet;
use crate::task::TaskConfig;

use super::{split_args, ClientBuild, WorkerError, WorkerKind, WorkerOptions};

pub(crate) fn rsh_argv(config: &TaskConfig, node: &str, command: &str) -> Vec<String> {
    let path = config.rsh_path.as_deref().unwrap_or("rsh");
    let mut argv = split_args(path);

    if let Some(user) = &config.rsh_user {
        argv.push("-l".to_string());
        argv.push(user.clone());
    }
    if let Some(options) = &config.rsh_options {
        argv.extend(split_args(options));
    }

    argv.push(node.to_string());
    argv.push(command.to_string());
    argv
}

/// Run a command on each node of a node set through `rsh`.
#[derive(Debug, Clone)]
pub struct RshWorker {
    nodes: NodeSet,
    command: String,
    options: WorkerOptions,
}

impl RshWorker {
    pub fn new(nodes: NodeSet, command: impl Into<String>) -> Self {
        RshWorker {
            nodes,
            command: command.into(),
            options: WorkerOptions::default(),
        }
    }

    pub fn with_options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }
}

impl WorkerKind for RshWorker {
    fn name(&self) -> &'static str {
        "rsh"
    }

    fn build_clients(&self, config: &TaskConfig) -> Result<Vec<ClientBuild>, WorkerError> {
        if self.nodes.is_empty() {
            return Err(WorkerError::NoTargets);
        }
        let hosts = self.nodes.to_string();
        let mut clients = Vec::new();
        for (rank, node) in self.nodes.iter().enumerate() {
            let command = super::exec::replace_cmd(&self.command, &node, rank, &hosts)?;
            clients.push(ClientBuild {
                key: node.clone(),
                command: CommandLine::Argv(rsh_argv(config, &node, &command)),
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
