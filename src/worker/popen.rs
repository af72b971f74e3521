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

//! Single local command worker with no target set. Results are keyed by
//! [`super::LOCAL_KEY`].

use crate::engine::CommandLine;
use crate::task::TaskConfig;

use super::{ClientBuild, WorkerError, WorkerKind, WorkerOptions, LOCAL_KEY};

/// Run one local command.
#[derive(Debug, Clone)]
pub struct PopenWorker {
    command: String,
    options: WorkerOptions,
}

impl PopenWorker {
    pub fn new(command: impl Into<String>) -> Self {
        PopenWorker {
            command: command.into(),
            options: WorkerOptions::default(),
        }
    }

    pub fn with_options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }
}

impl WorkerKind for PopenWorker {
    fn name(&self) -> &'static str {
        "popen"
    }

    fn build_clients(&self, _config: &TaskConfig) -> Result<Vec<ClientBuild>, WorkerError> {
        Ok(vec![ClientBuild {
            key: LOCAL_KEY.to_string(),
            command: CommandLine::Shell(self.command.clone()),
            env: Vec::new(),
        }])
    }

    fn options(&self) -> &WorkerOptions {
        &self.options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_client() {
        let worker = PopenWorker::new("echo hello");
        let clients = worker.build_clients(&TaskConfig::default()).unwrap();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].key, LOCAL_KEY);
    }
}
