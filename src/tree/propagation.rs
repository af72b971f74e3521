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

//! Parent side of tree propagation.
//!
//! A [`TreeWorker`] relays a command through gateway hops: targets whose
//! first hop is a gateway are grouped per gateway, a framed channel is
//! opened over the distant worker to each gateway, and the rest is
//! contacted directly. Channel frames coming back are translated into the
//! regular worker event stream, so callers cannot tell tree and flat
//! execution apart.

use std::collections::HashMap;

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::event::StreamKind;
use crate::nodeset::NodeSet;
use crate::task::TaskConfig;
use crate::worker::WorkerOptions;

use super::codec::{Frame, FrameCodec, FrameType};
use super::messages::{
    decode, encode, AckPayload, ControlAction, ControlPayload, ForwardConfig, HupPayload,
};
use super::topology::{Router, TopologyError};

/// Synthetic return code reported for targets lost to a gateway failure.
pub const GW_SYNTHETIC_RC: i32 = 255;

/// Run a command on a node set through the configured topology.
#[derive(Debug, Clone)]
pub struct TreeWorker {
    nodes: NodeSet,
    command: String,
    options: WorkerOptions,
}

impl TreeWorker {
    pub fn new(nodes: NodeSet, command: impl Into<String>) -> Self {
        TreeWorker {
            nodes,
            command: command.into(),
            options: WorkerOptions::default(),
        }
    }

    pub fn with_options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn nodes(&self) -> &NodeSet {
        &self.nodes
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }
}

/// Translated effect of incoming channel bytes, applied by the run loop.
#[derive(Debug)]
pub(crate) enum TreeAction {
    Deliver {
        node: String,
        stream: StreamKind,
        data: Vec<u8>,
    },
    Hup {
        node: String,
        rc: i32,
    },
    Timeout {
        node: String,
    },
    /// Unrecoverable framing error: the channel is failed, no retry.
    ChannelError {
        gateway: String,
        reason: String,
    },
}

/// One open gateway channel.
pub(crate) struct GatewayPeer {
    pub targets: NodeSet,
    /// targets that received a terminal event (hup or timeout)
    pub terminal: NodeSet,
    pub eof_seen: bool,
    pub failed: bool,
    pub acked: Vec<u32>,
    buf: BytesMut,
    codec: FrameCodec,
}

impl GatewayPeer {
    fn new(targets: NodeSet) -> Self {
        GatewayPeer {
            targets,
            terminal: NodeSet::new(),
            eof_seen: false,
            failed: false,
            acked: Vec::new(),
            buf: BytesMut::new(),
            codec: FrameCodec,
        }
    }
}

/// Execution plan of one tree worker.
pub(crate) struct TreePlan {
    /// targets contacted without any gateway
    pub direct: NodeSet,
    /// gateway -> (targets, encoded CTL shell frame)
    pub launches: Vec<(String, NodeSet, Vec<u8>)>,
    /// targets behind dead gateways, failed synthetically at start
    pub unreachable: NodeSet,
}

/// Channel-side state of a running tree worker.
pub(crate) struct TreeState {
    pub peers: HashMap<String, GatewayPeer>,
    next_seq: u32,
}

impl TreeState {
    /// Split `targets` by first hop and build the initial control frame
    /// for every gateway involved.
    pub fn plan(
        targets: &NodeSet,
        router: &Router,
        config: &TaskConfig,
        command: &str,
    ) -> Result<(TreeState, TreePlan), TopologyError> {
        let mut direct = NodeSet::new();
        let mut unreachable = NodeSet::new();
        let mut per_gateway: HashMap<String, NodeSet> = HashMap::new();

        for node in targets.iter() {
            let single = NodeSet::parse(&node).map_err(TopologyError::BadNodeSet)?;
            match router.next_hop(&node) {
                Ok(None) => direct.update(&single),
                Ok(Some(gw)) => per_gateway.entry(gw).or_default().update(&single),
                Err(TopologyError::Unreachable { .. }) => unreachable.update(&single),
                Err(other) => return Err(other),
            }
        }

        let mut state = TreeState {
            peers: HashMap::new(),
            next_seq: 0,
        };
        let mut launches = Vec::new();
        let forward = ForwardConfig::from_task_config(config, &config.distant_worker);
        let mut gateways: Vec<(String, NodeSet)> = per_gateway.into_iter().collect();
        gateways.sort_by(|a, b| a.0.cmp(&b.0));

        for (gw, gw_targets) in gateways {
            state.next_seq += 1;
            let ctl = ControlPayload {
                seq: state.next_seq,
                action: ControlAction::Shell {
                    targets: gw_targets.to_string(),
                    command: command.to_string(),
                    config: forward.clone(),
                    topology: router.table().source().to_string(),
                    gateway: gw.clone(),
                },
            };
            let frame = Frame::new(FrameType::Ctl, gw.clone(), encode(&ctl)?);
            let bytes = frame.to_bytes()?;
            state.peers.insert(gw.clone(), GatewayPeer::new(gw_targets.clone()));
            launches.push((gw, gw_targets, bytes));
        }

        Ok((
            state,
            TreePlan {
                direct,
                launches,
                unreachable,
            },
        ))
    }

    pub fn is_gateway(&self, key: &str) -> bool {
        self.peers.contains_key(key)
    }

    /// Consume raw channel bytes from a gateway and translate complete
    /// frames into actions.
    pub fn feed(&mut self, gateway: &str, data: &[u8]) -> Vec<TreeAction> {
        let mut actions = Vec::new();
        let Some(peer) = self.peers.get_mut(gateway) else {
            return actions;
        };
        if peer.failed {
            return actions;
        }
        peer.buf.extend_from_slice(data);

        loop {
            match peer.codec.decode(&mut peer.buf) {
                Ok(Some(frame)) => handle_frame(peer, frame, &mut actions),
                Ok(None) => break,
                Err(err) => {
                    peer.failed = true;
                    actions.push(TreeAction::ChannelError {
                        gateway: gateway.to_string(),
                        reason: err.to_string(),
                    });
                    break;
                }
            }
        }
        actions
    }

    /// Targets of `gateway` without a terminal event yet; marks them
    /// terminal so they are failed exactly once.
    pub fn fail_pending(&mut self, gateway: &str) -> Vec<String> {
        let Some(peer) = self.peers.get_mut(gateway) else {
            return Vec::new();
        };
        let pending = peer.targets.difference(&peer.terminal);
        peer.terminal.update(&pending);
        peer.failed = true;
        pending.iter().collect()
    }

    /// Whether the gateway finished cleanly (EOF frame seen).
    pub fn finished(&self, gateway: &str) -> bool {
        self.peers
            .get(gateway)
            .map(|p| p.eof_seen && !p.failed)
            .unwrap_or(false)
    }

    /// Encode a stdin chunk for one gateway's target subset.
    pub fn stdin_frame(&self, gateway: &str, bytes: &[u8]) -> Option<Vec<u8>> {
        let peer = self.peers.get(gateway)?;
        Frame::new(FrameType::In, peer.targets.to_string(), bytes.to_vec())
            .to_bytes()
            .ok()
    }

    /// Encode the stdin-EOF control for a gateway.
    pub fn write_eof_frame(&mut self, gateway: &str) -> Option<Vec<u8>> {
        if !self.peers.contains_key(gateway) {
            return None;
        }
        self.next_seq += 1;
        let ctl = ControlPayload {
            seq: self.next_seq,
            action: ControlAction::WriteEof,
        };
        Frame::new(FrameType::Ctl, gateway, encode(&ctl).ok()?)
            .to_bytes()
            .ok()
    }
}

fn handle_frame(peer: &mut GatewayPeer, frame: Frame, actions: &mut Vec<TreeAction>) {
    match frame.ftype {
        FrameType::Out | FrameType::Err => {
            let stream = if frame.ftype == FrameType::Out {
                StreamKind::Stdout
            } else {
                StreamKind::Stderr
            };
            let Ok(nodes) = NodeSet::parse(&frame.key) else {
                tracing::warn!(key = %frame.key, "bad node set in output frame");
                return;
            };
            if frame.payload.is_empty() {
                return;
            }
            let mut lines: Vec<&[u8]> = frame.payload.split(|b| *b == b'\n').collect();
            if frame.payload.ends_with(b"\n") {
                lines.pop();
            }
            for line in lines {
                for node in nodes.iter() {
                    actions.push(TreeAction::Deliver {
                        node,
                        stream,
                        data: line.to_vec(),
                    });
                }
            }
        }
        FrameType::Hup => {
            let rc = decode::<HupPayload>(&frame.payload)
                .map(|p| p.rc)
                .unwrap_or(GW_SYNTHETIC_RC);
            if let Ok(nodes) = NodeSet::parse(&frame.key) {
                peer.terminal.update(&nodes);
                for node in nodes.iter() {
                    actions.push(TreeAction::Hup { node, rc });
                }
            }
        }
        FrameType::Timeout => {
            if let Ok(nodes) = NodeSet::parse(&frame.key) {
                peer.terminal.update(&nodes);
                for node in nodes.iter() {
                    actions.push(TreeAction::Timeout { node });
                }
            }
        }
        FrameType::Ack => {
            if let Ok(ack) = decode::<AckPayload>(&frame.payload) {
                peer.acked.push(ack.ack);
            }
        }
        FrameType::Eof => {
            peer.eof_seen = true;
        }
        FrameType::Ctl | FrameType::In => {
            tracing::warn!(ftype = ?frame.ftype, "unexpected frame from gateway");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::topology::RoutesTable;

    fn state_for(routes: &str, targets: &str) -> (TreeState, TreePlan) {
        let table = RoutesTable::parse(routes).unwrap();
        let router = Router::new("admin", &table).unwrap();
        TreeState::plan(
            &targets.parse().unwrap(),
            &router,
            &TaskConfig::default(),
            "uname -r",
        )
        .unwrap()
    }

    #[test]
    fn test_plan_split() {
        let (state, plan) = state_for(
            "admin: gw[1-2]\ngw1: node[1-4]\ngw2: node[5-8]\n",
            "node[1-8],edge9",
        );
        assert_eq!(plan.direct.to_string(), "edge9");
        assert_eq!(plan.launches.len(), 2);
        assert_eq!(plan.launches[0].0, "gw1");
        assert_eq!(plan.launches[0].1.to_string(), "node[1-4]");
        assert!(state.is_gateway("gw2"));
        assert!(plan.unreachable.is_empty());
    }

    #[test]
    fn test_plan_unreachable_gateway() {
        let table = RoutesTable::parse("admin: gw[1-2]\ngw1: node[1-4]\ngw2: node[5-8]\n").unwrap();
        let mut router = Router::new("admin", &table).unwrap();
        router.mark_unreachable("gw1");
        let (_, plan) = TreeState::plan(
            &"node[1-8]".parse().unwrap(),
            &router,
            &TaskConfig::default(),
            "true",
        )
        .unwrap();
        assert_eq!(plan.unreachable.to_string(), "node[1-4]");
        assert_eq!(plan.launches.len(), 1);
        assert_eq!(plan.launches[0].0, "gw2");
    }

    #[test]
    fn test_feed_output_and_hup() {
        let (mut state, _) = state_for("admin: gw1\ngw1: node[1-4]\n", "node[1-4]");

        let out = Frame::new(FrameType::Out, "node[1-2]", b"linux\n".to_vec());
        let hup = Frame::new(
            FrameType::Hup,
            "node[1-2]",
            encode(&HupPayload { rc: 0 }).unwrap(),
        );
        let mut bytes = out.to_bytes().unwrap();
        bytes.extend(hup.to_bytes().unwrap());

        let actions = state.feed("gw1", &bytes);
        let delivers = actions
            .iter()
            .filter(|a| matches!(a, TreeAction::Deliver { .. }))
            .count();
        let hups = actions
            .iter()
            .filter(|a| matches!(a, TreeAction::Hup { rc: 0, .. }))
            .count();
        assert_eq!(delivers, 2);
        assert_eq!(hups, 2);
        assert_eq!(state.peers["gw1"].terminal.to_string(), "node[1-2]");
    }

    #[test]
    fn test_feed_split_frame() {
        let (mut state, _) = state_for("admin: gw1\ngw1: node[1-4]\n", "node[1-4]");
        let frame = Frame::new(FrameType::Out, "node1", b"partial read".to_vec());
        let bytes = frame.to_bytes().unwrap();
        let (a, b) = bytes.split_at(7);
        assert!(state.feed("gw1", a).is_empty());
        let actions = state.feed("gw1", b);
        assert_eq!(actions.len(), 1);
    }

    #[test]
    fn test_framing_error_fails_channel() {
        let (mut state, _) = state_for("admin: gw1\ngw1: node[1-4]\n", "node[1-4]");
        let actions = state.feed("gw1", b"garbage that is not a frame");
        assert!(matches!(
            actions.last(),
            Some(TreeAction::ChannelError { .. })
        ));
        let failed = state.fail_pending("gw1");
        assert_eq!(failed.len(), 4);
        // second failure is a no-op
        assert!(state.fail_pending("gw1").is_empty());
    }

    #[test]
    fn test_eof_finishes_channel() {
        let (mut state, _) = state_for("admin: gw1\ngw1: node[1-4]\n", "node[1-4]");
        let eof = Frame::new(FrameType::Eof, "gw1", Vec::new());
        state.feed("gw1", &eof.to_bytes().unwrap());
        assert!(state.finished("gw1"));
    }
}
