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

//! Gateway-side channel loop.
//!
//! The `muster-gateway` process speaks the frame codec on its standard
//! streams. On a shell control frame it spawns its own engine clients for
//! the requested targets, recursing through further gateway hops when the
//! forwarded topology requires it. Output is groomed: batched through
//! message trees and flushed upstream every `grooming_delay` seconds (or
//! earlier on buffer overrun) as folded OUT/ERR/HUP frames, ending with
//! one EOF frame.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::engine::{run_client, ClientSpec, EngineHandle, EngineMessage, StdinMsg};
use crate::event::StreamKind;
use crate::msgtree::MsgTree;
use crate::nodeset::NodeSet;
use crate::task::TaskConfig;
use crate::worker::{ExecWorker, RshWorker, SshWorker, WorkerKind, WorkerOptions};

use super::codec::{Frame, FrameCodec, FrameType};
use super::messages::{decode, encode, AckPayload, ControlAction, ControlPayload, HupPayload};
use super::propagation::{TreeAction, TreeState};
use super::topology::{Router, RoutesTable};

/// Flush upstream early when this much output is pending.
const MAX_GROOMING_BYTES: usize = 1024 * 1024;

/// Aggregation state between two grooming flushes.
#[derive(Default)]
struct Grooming {
    stdout: MsgTree,
    stderr: MsgTree,
    rcs: BTreeMap<i32, NodeSet>,
    timeouts: NodeSet,
    pending_bytes: usize,
}

impl Grooming {
    fn add(&mut self, key: &str, stream: StreamKind, data: &[u8]) {
        self.pending_bytes += data.len();
        match stream {
            StreamKind::Stdout => self.stdout.add(key, data),
            StreamKind::Stderr => self.stderr.add(key, data),
        }
    }

    fn add_rc(&mut self, key: &str, rc: i32) {
        if let Ok(single) = NodeSet::parse(key) {
            self.rcs.entry(rc).or_default().update(&single);
        }
    }

    fn add_timeout(&mut self, key: &str) {
        if let Ok(single) = NodeSet::parse(key) {
            self.timeouts.update(&single);
        }
    }

    fn overrun(&self) -> bool {
        self.pending_bytes > MAX_GROOMING_BYTES
    }

    /// Drain everything aggregated so far into upstream frames, output
    /// before exit statuses so per-key ordering is preserved.
    fn drain(&mut self) -> Result<Vec<Frame>> {
        let mut frames = Vec::new();
        for (tree, ftype) in [
            (&mut self.stdout, FrameType::Out),
            (&mut self.stderr, FrameType::Err),
        ] {
            for (buf, keys) in tree.walk() {
                let nodes = NodeSet::from_nodes(keys)?;
                frames.push(Frame::new(ftype, nodes.to_string(), buf));
            }
            tree.clear();
        }
        for (rc, nodes) in std::mem::take(&mut self.rcs) {
            frames.push(Frame::new(
                FrameType::Hup,
                nodes.to_string(),
                encode(&HupPayload { rc })?,
            ));
        }
        if !self.timeouts.is_empty() {
            let nodes = std::mem::take(&mut self.timeouts);
            frames.push(Frame::new(FrameType::Timeout, nodes.to_string(), Vec::new()));
        }
        self.pending_bytes = 0;
        Ok(frames)
    }
}

/// Run the gateway loop on the process standard streams until the
/// upstream side closes the channel or the work completes.
pub async fn run_gateway() -> Result<()> {
    let mut reader = FramedRead::new(tokio::io::stdin(), FrameCodec);
    let mut writer = FramedWrite::new(tokio::io::stdout(), FrameCodec);

    let (tx, mut rx) = mpsc::unbounded_channel::<EngineMessage>();
    let cancel = CancellationToken::new();
    let mut handle: Option<EngineHandle> = None;

    let mut grooming = Grooming::default();
    let mut interval = tokio::time::interval(Duration::from_millis(250));
    let mut active_clients: usize = 0;
    let mut started = false;
    let mut writers: Vec<(String, mpsc::UnboundedSender<StdinMsg>)> = Vec::new();
    // channels to deeper hops, when the topology has more levels
    let mut sub_state: Option<TreeState> = None;

    loop {
        tokio::select! {
            biased;
            frame = reader.next() => match frame {
                None => break, // parent shutdown
                Some(Err(err)) => {
                    tracing::error!(%err, "channel framing error, closing");
                    break;
                }
                Some(Ok(frame)) => {
                    if let Some(done) = handle_frame(
                        frame,
                        &mut writer,
                        &tx,
                        &cancel,
                        &mut handle,
                        &mut interval,
                        &mut active_clients,
                        &mut started,
                        &mut writers,
                        &mut sub_state,
                    )
                    .await?
                    {
                        if done {
                            break;
                        }
                    }
                }
            },
            msg = rx.recv() => {
                if let Some(msg) = msg {
                    consume_engine_message(msg, &mut grooming, &mut sub_state, &mut active_clients);
                    if grooming.overrun() {
                        send_frames(&mut writer, grooming.drain()?).await?;
                    }
                    if started && active_clients == 0 {
                        // work complete: final flush, EOF, leave
                        send_frames(&mut writer, grooming.drain()?).await?;
                        writer.send(Frame::new(FrameType::Eof, "", Vec::new())).await?;
                        writer.flush().await?;
                        break;
                    }
                }
            }
            _ = interval.tick() => {
                send_frames(&mut writer, grooming.drain()?).await?;
            }
        }
    }

    cancel.cancel();
    Ok(())
}

async fn send_frames(
    writer: &mut FramedWrite<tokio::io::Stdout, FrameCodec>,
    frames: Vec<Frame>,
) -> Result<()> {
    if frames.is_empty() {
        return Ok(());
    }
    for frame in frames {
        writer.feed(frame).await.context("send frame upstream")?;
    }
    writer.flush().await.context("flush upstream")?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn handle_frame(
    frame: Frame,
    writer: &mut FramedWrite<tokio::io::Stdout, FrameCodec>,
    tx: &mpsc::UnboundedSender<EngineMessage>,
    cancel: &CancellationToken,
    handle: &mut Option<EngineHandle>,
    interval: &mut tokio::time::Interval,
    active_clients: &mut usize,
    started: &mut bool,
    writers: &mut Vec<(String, mpsc::UnboundedSender<StdinMsg>)>,
    sub_state: &mut Option<TreeState>,
) -> Result<Option<bool>> {
    match frame.ftype {
        FrameType::Ctl => {
            let ctl: ControlPayload = decode(&frame.payload)?;
            writer
                .send(Frame::new(
                    FrameType::Ack,
                    "",
                    encode(&AckPayload { ack: ctl.seq })?,
                ))
                .await?;
            match ctl.action {
                ControlAction::Shell {
                    targets,
                    command,
                    config,
                    topology,
                    gateway,
                } => {
                    tracing::info!(%targets, %gateway, "gateway shell request");
                    let mut task_config = TaskConfig::default();
                    config.apply(&mut task_config);
                    task_config.distant_worker = config.worker.clone();
                    if task_config.grooming_delay > 0.0 {
                        *interval = tokio::time::interval(Duration::from_secs_f64(
                            task_config.grooming_delay,
                        ));
                    }
                    let engine = handle.get_or_insert_with(|| {
                        EngineHandle::new(tx.clone(), task_config.fanout, cancel.clone())
                    });

                    let targets: NodeSet = NodeSet::parse(&targets)?;
                    let table = RoutesTable::parse(&topology)?;
                    let router = Router::new(&gateway, &table)?;
                    let (state, plan) =
                        TreeState::plan(&targets, &router, &task_config, &command)?;

                    // unreachable subtrees fail synthetically, like at the root
                    for node in plan.unreachable.iter() {
                        let _ = tx.send(EngineMessage::Hup {
                            worker: crate::event::WorkerId(0),
                            key: node,
                            rc: super::propagation::GW_SYNTHETIC_RC,
                        });
                    }

                    // local targets through the forwarded worker class
                    if !plan.direct.is_empty() {
                        let clients = build_direct_clients(
                            &task_config,
                            plan.direct.clone(),
                            &command,
                        )?;
                        for spec in clients {
                            let (stx, srx) = mpsc::unbounded_channel();
                            writers.push((spec.key.clone(), stx));
                            tokio::task::spawn_local(run_client(
                                spec,
                                engine.clone(),
                                srx,
                            ));
                            *active_clients += 1;
                        }
                    }

                    // deeper hops: open our own channels
                    for (gw, _targets, ctl_frame) in &plan.launches {
                        let (stx, srx) = mpsc::unbounded_channel();
                        let _ = stx.send(StdinMsg::Bytes(ctl_frame.clone()));
                        let spec = ClientSpec {
                            worker: crate::event::WorkerId(0),
                            key: gw.clone(),
                            command: gateway_invoke(&task_config, gw),
                            env: Vec::new(),
                            buffered: false,
                            split_stderr: true,
                            use_stdin: true,
                            connect_timeout: task_config.connect_timeout_duration(),
                            command_timeout: None,
                        };
                        writers.push((gw.clone(), stx));
                        tokio::task::spawn_local(run_client(spec, engine.clone(), srx));
                        *active_clients += 1;
                    }
                    *sub_state = Some(state);
                    *started = true;
                    if *active_clients == 0 {
                        // nothing to run at all
                        writer
                            .send(Frame::new(FrameType::Eof, "", Vec::new()))
                            .await?;
                        writer.flush().await?;
                        return Ok(Some(true));
                    }
                }
                ControlAction::WriteEof => {
                    for (key, stx) in writers.iter() {
                        match sub_state.as_mut() {
                            Some(state) if state.is_gateway(key) => {
                                if let Some(frame) = state.write_eof_frame(key) {
                                    let _ = stx.send(StdinMsg::Bytes(frame));
                                }
                            }
                            _ => {
                                let _ = stx.send(StdinMsg::Eof);
                            }
                        }
                    }
                }
            }
        }
        FrameType::In => {
            let nodes: NodeSet = NodeSet::parse(&frame.key)?;
            for (key, stx) in writers.iter() {
                match sub_state.as_ref() {
                    Some(state) if state.is_gateway(key) => {
                        if let Some(bytes) = state.stdin_frame(key, &frame.payload) {
                            let _ = stx.send(StdinMsg::Bytes(bytes));
                        }
                    }
                    _ => {
                        if nodes.contains(key).unwrap_or(false) {
                            let _ = stx.send(StdinMsg::Bytes(frame.payload.clone()));
                        }
                    }
                }
            }
        }
        other => {
            tracing::debug!(ftype = ?other, "ignoring unexpected frame from parent");
        }
    }
    Ok(Some(false))
}

/// Fold an engine event into the grooming state.
fn consume_engine_message(
    msg: EngineMessage,
    grooming: &mut Grooming,
    sub_state: &mut Option<TreeState>,
    active_clients: &mut usize,
) {
    match msg {
        EngineMessage::Read {
            key, stream, data, ..
        } => {
            // frames from deeper hops are decoded and re-groomed here
            if let Some(state) = sub_state.as_mut() {
                if state.is_gateway(&key) {
                    if stream == StreamKind::Stderr {
                        tracing::debug!(gateway = %key, "sub-gw: {}", String::from_utf8_lossy(&data));
                        return;
                    }
                    for action in state.feed(&key, &data) {
                        match action {
                            TreeAction::Deliver { node, stream, data } => {
                                grooming.add(&node, stream, &data)
                            }
                            TreeAction::Hup { node, rc } => grooming.add_rc(&node, rc),
                            TreeAction::Timeout { node } => grooming.add_timeout(&node),
                            TreeAction::ChannelError { gateway, reason } => {
                                tracing::warn!(%gateway, %reason, "sub-gateway channel failed");
                            }
                        }
                    }
                    return;
                }
            }
            grooming.add(&key, stream, &data);
        }
        EngineMessage::Hup { key, rc, .. } => {
            let is_sub_gw = sub_state
                .as_ref()
                .map(|s| s.is_gateway(&key))
                .unwrap_or(false);
            if is_sub_gw {
                if let Some(state) = sub_state.as_mut() {
                    if !state.finished(&key) {
                        for node in state.fail_pending(&key) {
                            grooming.add_rc(&node, super::propagation::GW_SYNTHETIC_RC);
                        }
                    }
                }
            } else {
                grooming.add_rc(&key, rc);
            }
        }
        EngineMessage::NodeTimeout { key, .. } => {
            let is_sub_gw = sub_state
                .as_ref()
                .map(|s| s.is_gateway(&key))
                .unwrap_or(false);
            if is_sub_gw {
                if let Some(state) = sub_state.as_mut() {
                    for node in state.fail_pending(&key) {
                        grooming.add_rc(&node, super::propagation::GW_SYNTHETIC_RC);
                    }
                }
            } else {
                grooming.add_timeout(&key);
            }
        }
        EngineMessage::ClientDone { .. } => {
            *active_clients = active_clients.saturating_sub(1);
        }
        _ => {}
    }
}

/// Clients for targets reached directly from this gateway.
fn build_direct_clients(
    config: &TaskConfig,
    nodes: NodeSet,
    command: &str,
) -> Result<Vec<ClientSpec>> {
    let builds = match config.distant_worker.as_str() {
        "exec" => ExecWorker::new(nodes, command).build_clients(config)?,
        "rsh" => RshWorker::new(nodes, command).build_clients(config)?,
        _ => SshWorker::new(nodes, command).build_clients(config)?,
    };
    let options = WorkerOptions::default();
    let split_stderr = options.stderr.unwrap_or(config.stderr);
    Ok(builds
        .into_iter()
        .map(|build| ClientSpec {
            worker: crate::event::WorkerId(0),
            key: build.key,
            command: build.command,
            env: build.env,
            buffered: true,
            split_stderr,
            use_stdin: true,
            connect_timeout: config.connect_timeout_duration(),
            command_timeout: config.command_timeout_duration(),
        })
        .collect())
}

fn gateway_invoke(config: &TaskConfig, gateway: &str) -> crate::engine::CommandLine {
    let invoke = config
        .gw_invoke_cmd
        .clone()
        .unwrap_or_else(|| "muster-gateway".to_string());
    match config.distant_worker.as_str() {
        "exec" => crate::engine::CommandLine::Shell(invoke),
        "rsh" => crate::engine::CommandLine::Argv(crate::worker::rsh::rsh_argv(
            config, gateway, &invoke,
        )),
        _ => crate::engine::CommandLine::Argv(crate::worker::ssh::ssh_argv(
            config, gateway, &invoke,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grooming_folds_identical_output() {
        let mut grooming = Grooming::default();
        for node in ["n1", "n2", "n3"] {
            grooming.add(node, StreamKind::Stdout, b"2.6.32");
        }
        grooming.add("n4", StreamKind::Stdout, b"3.10.0");
        grooming.add_rc("n1", 0);
        grooming.add_rc("n2", 0);
        grooming.add_rc("n4", 1);

        let frames = grooming.drain().unwrap();
        let outs: Vec<&Frame> = frames
            .iter()
            .filter(|f| f.ftype == FrameType::Out)
            .collect();
        assert_eq!(outs.len(), 2);
        assert!(outs.iter().any(|f| f.key == "n[1-3]"));
        let hups: Vec<&Frame> = frames
            .iter()
            .filter(|f| f.ftype == FrameType::Hup)
            .collect();
        assert_eq!(hups.len(), 2);
        assert!(hups.iter().any(|f| f.key == "n[1-2]"));

        // second drain is empty
        assert!(grooming.drain().unwrap().is_empty());
    }

    #[test]
    fn test_grooming_overrun() {
        let mut grooming = Grooming::default();
        assert!(!grooming.overrun());
        grooming.add("n1", StreamKind::Stdout, &vec![b'x'; MAX_GROOMING_BYTES + 1]);
        assert!(grooming.overrun());
    }

    #[test]
    fn test_grooming_timeout_frame() {
        let mut grooming = Grooming::default();
        grooming.add_timeout("n7");
        grooming.add_timeout("n8");
        let frames = grooming.drain().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].ftype, FrameType::Timeout);
        assert_eq!(frames[0].key, "n[7-8]");
    }
}
