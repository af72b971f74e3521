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

//! Reactor core
//!
//! The engine is a single-threaded cooperative reactor: a current-thread
//! tokio runtime plus a `LocalSet` on which every child process client and
//! timer runs as a local task. The fanout sliding window is a semaphore;
//! clients queue on it in FIFO order. All client output funnels through a
//! single event channel drained by the task's run loop on the owning
//! thread, so event callbacks are never concurrent and per-destination
//! byte order is preserved.

pub(crate) mod client;
mod port;
mod timer;

pub use port::Port;

pub(crate) use client::{run_client, ClientSpec, CommandLine, StdinMsg};
pub(crate) use timer::{run_timer, TimerGuard};

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use anyhow::Result;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::event::{PortId, PortMessage, StreamKind, TimerId, WorkerId};

/// Internal engine event, funneled from client/timer tasks (and foreign
/// threads, for ports) to the run loop.
pub(crate) enum EngineMessage {
    /// Child launched for a destination.
    Pickup { worker: WorkerId, key: String },
    /// Output received from a destination.
    Read {
        worker: WorkerId,
        key: String,
        stream: StreamKind,
        data: Vec<u8>,
    },
    /// Bytes written to a destination's stdin.
    Written {
        worker: WorkerId,
        key: String,
        bytes: usize,
    },
    /// Child exited.
    Hup {
        worker: WorkerId,
        key: String,
        rc: i32,
    },
    /// A destination hit its connect or command deadline.
    NodeTimeout { worker: WorkerId, key: String },
    /// One client task finished (always sent last by a client).
    ClientDone { worker: WorkerId, key: String },
    /// A timer fired.
    Timer { id: TimerId },
    /// Cross-thread port delivery.
    Port {
        id: PortId,
        message: PortMessage,
        /// the sending port's in-flight count, decremented on dispatch
        pending: Arc<AtomicUsize>,
    },
}

impl EngineMessage {
    /// The worker this message belongs to, for worker-scoped messages.
    pub(crate) fn worker(&self) -> Option<WorkerId> {
        match self {
            EngineMessage::Pickup { worker, .. }
            | EngineMessage::Read { worker, .. }
            | EngineMessage::Written { worker, .. }
            | EngineMessage::Hup { worker, .. }
            | EngineMessage::NodeTimeout { worker, .. }
            | EngineMessage::ClientDone { worker, .. } => Some(*worker),
            EngineMessage::Timer { .. } | EngineMessage::Port { .. } => None,
        }
    }
}

/// The reactor: owns the current-thread runtime the task's run loop and
/// all of its clients execute on.
pub(crate) struct Engine {
    rt: Runtime,
}

impl Engine {
    pub(crate) fn new() -> Result<Self> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Engine { rt })
    }

    pub(crate) fn runtime(&self) -> &Runtime {
        &self.rt
    }
}

/// Per-run reactor plumbing shared with spawned clients.
#[derive(Clone)]
pub(crate) struct EngineHandle {
    /// event funnel into the run loop
    pub tx: mpsc::UnboundedSender<EngineMessage>,
    /// fanout window
    pub fanout: Arc<Semaphore>,
    /// trips on task abort or fatal unwind
    pub cancel: CancellationToken,
}

impl EngineHandle {
    pub(crate) fn new(
        tx: mpsc::UnboundedSender<EngineMessage>,
        fanout: usize,
        cancel: CancellationToken,
    ) -> Self {
        EngineHandle {
            tx,
            fanout: Arc::new(Semaphore::new(fanout.max(1))),
            cancel,
        }
    }
}
