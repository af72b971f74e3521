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

//! Typed payloads of the gateway channel frames.
//!
//! Node sets cross the wire as folded strings, either in the frame key or
//! inside JSON payloads; there is no host-language serialisation involved,
//! so root and gateways may run different builds within a major release.

use serde::{Deserialize, Serialize};

use super::codec::ProtocolError;
use crate::task::TaskConfig;

/// Task configuration subset forwarded to gateways.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForwardConfig {
    pub fanout: usize,
    pub connect_timeout: f64,
    pub command_timeout: f64,
    pub grooming_delay: f64,
    pub stderr: bool,
    /// worker used for final-hop execution: "ssh", "rsh" or "exec"
    pub worker: String,
}

impl ForwardConfig {
    pub fn from_task_config(config: &TaskConfig, worker: &str) -> Self {
        ForwardConfig {
            fanout: config.fanout,
            connect_timeout: config.connect_timeout,
            command_timeout: config.command_timeout,
            grooming_delay: config.grooming_delay,
            stderr: config.stderr,
            worker: worker.to_string(),
        }
    }

    /// Apply the forwarded subset onto a gateway's local defaults.
    pub fn apply(&self, config: &mut TaskConfig) {
        config.fanout = self.fanout;
        config.connect_timeout = self.connect_timeout;
        config.command_timeout = self.command_timeout;
        config.grooming_delay = self.grooming_delay;
        config.stderr = self.stderr;
    }
}

/// CTL frame payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlPayload {
    /// sequence number echoed by the matching ACK
    pub seq: u32,
    pub action: ControlAction,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlAction {
    /// Run `command` on `targets` (folded node set), recursing through
    /// `topology` routes when further hops are needed.
    Shell {
        targets: String,
        command: String,
        config: ForwardConfig,
        /// routes table text forwarded for recursion
        topology: String,
        /// name of the receiving gateway (its root in the topology)
        gateway: String,
    },
    /// Close the standard input of every destination.
    WriteEof,
}

/// HUP frame payload; the frame key folds all nodes sharing this rc.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct HupPayload {
    pub rc: i32,
}

/// ACK frame payload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AckPayload {
    pub ack: u32,
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(value).map_err(|e| ProtocolError::BadPayload {
        reason: e.to_string(),
    })
}

pub(crate) fn decode<'a, T: Deserialize<'a>>(payload: &'a [u8]) -> Result<T, ProtocolError> {
    serde_json::from_slice(payload).map_err(|e| ProtocolError::BadPayload {
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_roundtrip() {
        let ctl = ControlPayload {
            seq: 7,
            action: ControlAction::Shell {
                targets: "node[1-4]".to_string(),
                command: "uname -r".to_string(),
                config: ForwardConfig::from_task_config(&TaskConfig::default(), "ssh"),
                topology: "root: gw[1-2]\ngw[1-2]: node[1-8]\n".to_string(),
                gateway: "gw1".to_string(),
            },
        };
        let bytes = encode(&ctl).unwrap();
        let back: ControlPayload = decode(&bytes).unwrap();
        assert_eq!(back, ctl);
    }

    #[test]
    fn test_hup_payload() {
        let bytes = encode(&HupPayload { rc: 137 }).unwrap();
        let back: HupPayload = decode(&bytes).unwrap();
        assert_eq!(back.rc, 137);
    }

    #[test]
    fn test_bad_payload() {
        assert!(decode::<HupPayload>(b"not json").is_err());
    }
}
