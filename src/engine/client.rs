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

//! Engine client: one child process and its standard stream pumps.
//!
//! A client task waits for a fanout permit, spawns its child, then pumps
//! stdout/stderr (line-split or raw) and stdin concurrently while
//! enforcing the connect and command deadlines. Events are reported in
//! order: pickup, read*, hup; a final `ClientDone` lets the run loop
//! account for worker completion. Dropping the fanout permit at task end
//! starts the next queued client.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout_at, Instant};

use crate::event::{StreamKind, WorkerId};

use super::{EngineHandle, EngineMessage};

/// How to launch the child process.
#[derive(Debug, Clone)]
pub(crate) enum CommandLine {
    /// Interpreted by `/bin/sh -c`.
    Shell(String),
    /// Direct argv exec.
    Argv(Vec<String>),
}

/// Everything needed to run one destination's child process.
#[derive(Debug, Clone)]
pub(crate) struct ClientSpec {
    pub worker: WorkerId,
    pub key: String,
    pub command: CommandLine,
    pub env: Vec<(String, String)>,
    /// line-split output; raw chunks when false (gateway channels)
    pub buffered: bool,
    /// deliver stderr as its own stream instead of merging into stdout
    pub split_stderr: bool,
    pub use_stdin: bool,
    pub connect_timeout: Option<Duration>,
    pub command_timeout: Option<Duration>,
}

/// Stdin feed for one client.
#[derive(Debug)]
pub(crate) enum StdinMsg {
    Bytes(Vec<u8>),
    Eof,
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86400 * 365)
}

/// Drive one destination to completion. Infallible by design: failures
/// are reported as events, never as panics or errors.
pub(crate) async fn run_client(
    spec: ClientSpec,
    handle: EngineHandle,
    mut stdin_rx: mpsc::UnboundedReceiver<StdinMsg>,
) {
    let done = |reason: &str| {
        tracing::trace!(key = %spec.key, reason, "client done");
        let _ = handle.tx.send(EngineMessage::ClientDone {
            worker: spec.worker,
            key: spec.key.clone(),
        });
    };

    // fanout window: wait for a free slot, FIFO
    let _permit = tokio::select! {
        biased;
        _ = handle.cancel.cancelled() => {
            done("aborted before start");
            return;
        }
        permit = handle.fanout.clone().acquire_owned() => match permit {
            Ok(p) => p,
            Err(_) => {
                done("engine closed");
                return;
            }
        },
    };

    let _ = handle.tx.send(EngineMessage::Pickup {
        worker: spec.worker,
        key: spec.key.clone(),
    });

    let mut cmd = match &spec.command {
        CommandLine::Shell(line) => {
            let mut c = Command::new("/bin/sh");
            c.arg("-c").arg(line);
            c
        }
        CommandLine::Argv(argv) => {
            let mut c = Command::new(&argv[0]);
            c.args(&argv[1..]);
            c
        }
    };
    for (k, v) in &spec.env {
        cmd.env(k, v);
    }
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if spec.use_stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            // spawn failure is a per-destination failure, not a task error
            let _ = handle.tx.send(EngineMessage::Read {
                worker: spec.worker,
                key: spec.key.clone(),
                stream: StreamKind::Stderr,
                data: format!("muster: {err}").into_bytes(),
            });
            let _ = handle.tx.send(EngineMessage::Hup {
                worker: spec.worker,
                key: spec.key.clone(),
                rc: 255,
            });
            done("spawn failed");
            return;
        }
    };

    let mut stdin_writer = child.stdin.take();
    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");
    let mut out_reader = BufReader::new(stdout);
    let mut err_reader = BufReader::new(stderr);

    let start = Instant::now();
    let connect_deadline = spec.connect_timeout.map(|d| start + d);
    let command_deadline = spec.command_timeout.map(|d| start + d);

    let mut out_buf: Vec<u8> = Vec::new();
    let mut err_buf: Vec<u8> = Vec::new();
    let mut out_chunk = [0u8; 8192];
    let mut err_chunk = [0u8; 8192];
    let mut out_eof = false;
    let mut err_eof = false;
    let mut connected = false;

    let emit_read = |stream: StreamKind, data: Vec<u8>| {
        let stream = if spec.split_stderr {
            stream
        } else {
            StreamKind::Stdout
        };
        let _ = handle.tx.send(EngineMessage::Read {
            worker: spec.worker,
            key: spec.key.clone(),
            stream,
            data,
        });
    };

    while !(out_eof && err_eof) {
        // connect deadline runs until first output byte or EOF
        let deadline = match (connected, connect_deadline, command_deadline) {
            (false, Some(cd), Some(xd)) => Some(cd.min(xd)),
            (false, Some(cd), None) => Some(cd),
            (_, _, xd) => xd,
        };

        tokio::select! {
            biased;
            _ = handle.cancel.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                done("aborted");
                return;
            }
            _ = sleep_until(deadline.unwrap_or_else(far_future)), if deadline.is_some() => {
                kill_and_reap(&mut child).await;
                let _ = handle.tx.send(EngineMessage::NodeTimeout {
                    worker: spec.worker,
                    key: spec.key.clone(),
                });
                done("timed out");
                return;
            }
            msg = stdin_rx.recv(), if stdin_writer.is_some() => {
                match msg {
                    Some(StdinMsg::Bytes(bytes)) => {
                        let writer = stdin_writer.as_mut().expect("guarded");
                        match writer.write_all(&bytes).await {
                            Ok(()) => {
                                let _ = handle.tx.send(EngineMessage::Written {
                                    worker: spec.worker,
                                    key: spec.key.clone(),
                                    bytes: bytes.len(),
                                });
                            }
                            Err(err) => {
                                tracing::debug!(key = %spec.key, %err, "stdin write failed");
                                stdin_writer = None;
                            }
                        }
                    }
                    Some(StdinMsg::Eof) | None => {
                        stdin_writer = None; // drop closes the pipe
                    }
                }
            }
            n = read_part(&mut out_reader, spec.buffered, &mut out_buf, &mut out_chunk), if !out_eof => {
                connected = true;
                handle_read(n, spec.buffered, &mut out_buf, &out_chunk, &mut out_eof,
                            StreamKind::Stdout, &emit_read);
            }
            n = read_part(&mut err_reader, spec.buffered, &mut err_buf, &mut err_chunk), if !err_eof => {
                connected = true;
                handle_read(n, spec.buffered, &mut err_buf, &err_chunk, &mut err_eof,
                            StreamKind::Stderr, &emit_read);
            }
        }
    }
    drop(stdin_writer);

    // streams closed; collect the exit status under the command deadline
    let status = if let Some(dl) = command_deadline {
        match timeout_at(dl, child.wait()).await {
            Ok(res) => res,
            Err(_) => {
                kill_and_reap(&mut child).await;
                let _ = handle.tx.send(EngineMessage::NodeTimeout {
                    worker: spec.worker,
                    key: spec.key.clone(),
                });
                done("timed out at exit");
                return;
            }
        }
    } else {
        child.wait().await
    };

    let rc = match status {
        Ok(status) => exit_code(status),
        Err(err) => {
            tracing::debug!(key = %spec.key, %err, "wait failed");
            255
        }
    };
    let _ = handle.tx.send(EngineMessage::Hup {
        worker: spec.worker,
        key: spec.key.clone(),
        rc,
    });
    done("exited");
}

/// One read step: a full line (buffered) or an available chunk (raw).
/// Returns the byte count read, 0 at EOF.
async fn read_part<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    buffered: bool,
    line_buf: &mut Vec<u8>,
    chunk: &mut [u8],
) -> std::io::Result<usize> {
    if buffered {
        reader.read_until(b'\n', line_buf).await
    } else {
        reader.read(chunk).await
    }
}

fn handle_read(
    n: std::io::Result<usize>,
    buffered: bool,
    line_buf: &mut Vec<u8>,
    chunk: &[u8],
    eof: &mut bool,
    stream: StreamKind,
    emit: &impl Fn(StreamKind, Vec<u8>),
) {
    match n {
        Ok(0) => {
            *eof = true;
            if !line_buf.is_empty() {
                // final line without trailing newline
                emit(stream, std::mem::take(line_buf));
            }
        }
        Ok(n) if !buffered => {
            emit(stream, chunk[..n].to_vec());
        }
        Ok(_) => {
            if line_buf.last() == Some(&b'\n') {
                line_buf.pop();
                if line_buf.last() == Some(&b'\r') {
                    line_buf.pop();
                }
                emit(stream, std::mem::take(line_buf));
            }
        }
        Err(err) => {
            tracing::debug!(%err, "stream read failed");
            *eof = true;
        }
    }
}

async fn kill_and_reap(child: &mut Child) {
    let _ = child.start_kill();
    let _ = child.wait().await;
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status
            .code()
            .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
    }
    #[cfg(not(unix))]
    {
        status.code().unwrap_or(255)
    }
}
