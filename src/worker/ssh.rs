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

//! OpenSSH remote shell worker.
//!
//! The remote shell is an opaque `ssh` child process per destination.
//! Argv synthesis honors the task info keys `ssh_path`, `ssh_user` and
//! `ssh_options`; custom options come first so every hardwired option can
//! be overridden.

use crate::engine::CommandLine;
use crate::nodeset::NodeSet;
use crate::task::TaskConfig;

use super::{split_args, ClientBuild, WorkerError, WorkerKind, WorkerOptions};

/// Build the ssh argv for one destination.
pub(crate) fn ssh_argv(config: &TaskConfig, node: &str, command: &str) -> Vec<String> {
    let path = config.ssh_path.as_deref().unwrap_or("ssh");
    let mut argv = split_args(path);

    // custom options first: the first obtained value wins in ssh, so all
    // hardwired options below stay overridable
    if let Some(options) = &config.ssh_options {
        argv.extend(split_args(options));
    }

    argv.push("-oForwardAgent=no".to_string());
    argv.push("-oForwardX11=no".to_string());

    if let Some(user) = &config.ssh_user {
        argv.push("-l".to_string());
        argv.push(user.clone());
    }

    let connect_timeout = config.connect_timeout;
    if connect_timeout > 0.0 {
        argv.push(format!("-oConnectTimeout={}", connect_timeout as u64));
    }

    // disable passphrase/password querying; use ssh_options with
    // -oBatchMode=no together with sshpass to reenable it
    argv.push("-oBatchMode=yes".to_string());

    argv.push(node.to_string());
    argv.push(command.to_string());
    argv
}

/// Run a command on each node of a node set through `ssh`.
#[derive(Debug, Clone)]
pub struct SshWorker {
    nodes: NodeSet,
    command: String,
    options: WorkerOptions,
}

impl SshWorker {
    pub fn new(nodes: NodeSet, command: impl Into<String>) -> Self {
        SshWorker {
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

impl WorkerKind for SshWorker {
    fn name(&self) -> &'static str {
        "ssh"
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
                command: CommandLine::Argv(ssh_argv(config, &node, &command)),
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

    #[test]
    fn test_ssh_argv_defaults() {
        let config = TaskConfig::default();
        let argv = ssh_argv(&config, "n1", "uname -r");
        assert_eq!(argv[0], "ssh");
        assert!(argv.contains(&"-oBatchMode=yes".to_string()));
        assert!(argv.contains(&"-oConnectTimeout=10".to_string()));
        assert_eq!(argv[argv.len() - 2], "n1");
        assert_eq!(argv[argv.len() - 1], "uname -r");
    }

    #[test]
    fn test_ssh_argv_custom() {
        let config = TaskConfig {
            ssh_path: Some("/usr/bin/ssh -4".to_string()),
            ssh_user: Some("admin".to_string()),
            ssh_options: Some("-p 2222".to_string()),
            connect_timeout: 0.0,
            ..TaskConfig::default()
        };
        let argv = ssh_argv(&config, "n1", "true");
        assert_eq!(&argv[..2], ["/usr/bin/ssh", "-4"]);
        assert_eq!(&argv[2..4], ["-p", "2222"]);
        let luser = argv.iter().position(|a| a == "-l").unwrap();
        assert_eq!(argv[luser + 1], "admin");
        assert!(!argv.iter().any(|a| a.starts_with("-oConnectTimeout")));
    }

    #[test]
    fn test_build_clients() {
        let worker = SshWorker::new("n[1-2]".parse().unwrap(), "echo ok");
        let clients = worker.build_clients(&TaskConfig::default()).unwrap();
        assert_eq!(clients.len(), 2);
        assert_eq!(clients[0].key, "n1");
        match &clients[0].command {
            CommandLine::Argv(argv) => assert_eq!(argv[0], "ssh"),
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
