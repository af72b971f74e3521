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

//! Task configuration ("info" dictionary).

use std::time::Duration;

/// Per-task configuration. A `Task` starts with the defaults below; tools
/// adjust fields through [`crate::task::Task::set_info`].
#[derive(Debug, Clone, PartialEq)]
pub struct TaskConfig {
    /// engine sliding-window size: max concurrently running children
    pub fanout: usize,
    /// per-destination connect deadline, seconds (0 disables)
    pub connect_timeout: f64,
    /// per-destination command deadline, seconds (0 disables)
    pub command_timeout: f64,
    /// gateway output batching delay, seconds
    pub grooming_delay: f64,
    /// soft file-descriptor limit raised before the first spawn
    pub fd_max: u64,
    /// deliver stderr as a separate stream (merged into stdout when false)
    pub stderr: bool,
    /// plumb stdin to children by default
    pub stdin: bool,
    /// aggregate stdout into the task message tree
    pub stdout_msgtree: bool,
    /// aggregate stderr into the task message tree
    pub stderr_msgtree: bool,
    /// max undelivered messages per port; sends over this bound fail
    pub port_qlimit: usize,
    /// enable diagnostic logging through the debug sink
    pub debug: bool,

    // remote shell options, see the ssh/rsh workers
    pub ssh_path: Option<String>,
    pub ssh_user: Option<String>,
    pub ssh_options: Option<String>,
    pub scp_path: Option<String>,
    pub scp_user: Option<String>,
    pub scp_options: Option<String>,
    pub rsh_path: Option<String>,
    pub rsh_user: Option<String>,
    pub rsh_options: Option<String>,
    pub rcp_path: Option<String>,
    pub rcp_options: Option<String>,

    /// command spawning the remote gateway process for tree propagation
    pub gw_invoke_cmd: Option<String>,
    /// worker used for remote commands: "ssh" (default), "rsh" or "exec"
    pub distant_worker: String,
}

impl Default for TaskConfig {
    fn default() -> Self {
        TaskConfig {
            fanout: 64,
            connect_timeout: 10.0,
            command_timeout: 0.0,
            grooming_delay: 0.25,
            fd_max: 8192,
            stderr: false,
            stdin: true,
            stdout_msgtree: true,
            stderr_msgtree: true,
            port_qlimit: 100,
            debug: false,
            ssh_path: None,
            ssh_user: None,
            ssh_options: None,
            scp_path: None,
            scp_user: None,
            scp_options: None,
            rsh_path: None,
            rsh_user: None,
            rsh_options: None,
            rcp_path: None,
            rcp_options: None,
            gw_invoke_cmd: None,
            distant_worker: "ssh".to_string(),
        }
    }
}

fn seconds(value: f64) -> Option<Duration> {
    if value > 0.0 {
        Some(Duration::from_secs_f64(value))
    } else {
        None
    }
}

impl TaskConfig {
    pub fn connect_timeout_duration(&self) -> Option<Duration> {
        seconds(self.connect_timeout)
    }

    pub fn command_timeout_duration(&self) -> Option<Duration> {
        seconds(self.command_timeout)
    }

    pub fn grooming_delay_duration(&self) -> Option<Duration> {
        seconds(self.grooming_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = TaskConfig::default();
        assert_eq!(cfg.fanout, 64);
        assert_eq!(cfg.connect_timeout, 10.0);
        assert_eq!(cfg.command_timeout, 0.0);
        assert!(cfg.command_timeout_duration().is_none());
        assert_eq!(
            cfg.connect_timeout_duration(),
            Some(Duration::from_secs(10))
        );
        assert!(cfg.stdin);
        assert!(!cfg.stderr);
    }
}
