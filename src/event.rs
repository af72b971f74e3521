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

//! Worker event interface
//!
//! Applications receive execution progress through an [`EventHandler`]
//! passed to [`crate::task::Task::resume`]. All callbacks run on the task's
//! own thread; per-destination delivery order is
//! `start, pickup, read*, hup, close` (close always last).

use std::any::Any;

use anyhow::Result;

/// Identifies a scheduled worker within its task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub(crate) u64);

/// Identifies a registered timer within its task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub(crate) u64);

/// Identifies a registered port within its task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortId(pub(crate) u64);

/// Output stream of a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Message delivered through a [`crate::engine::Port`].
pub type PortMessage = Box<dyn Any + Send>;

/// Receiver of worker and timer events.
///
/// Every method has a no-op default so handlers only implement what they
/// need. A returned error is logged, recorded, and re-raised from
/// `resume()` once the run loop has terminated; it does not interrupt
/// event delivery.
#[allow(unused_variables)]
pub trait EventHandler {
    /// The worker has been scheduled and the engine is starting it.
    fn on_start(&mut self, worker: WorkerId) -> Result<()> {
        Ok(())
    }

    /// The child process for `node` has been launched.
    fn on_pickup(&mut self, worker: WorkerId, node: &str) -> Result<()> {
        Ok(())
    }

    /// A line (or raw chunk, on unbuffered streams) arrived from `node`.
    fn on_read(
        &mut self,
        worker: WorkerId,
        node: &str,
        stream: StreamKind,
        data: &[u8],
    ) -> Result<()> {
        Ok(())
    }

    /// Bytes were written to the destination's standard input.
    fn on_written(&mut self, worker: WorkerId, node: &str, bytes: usize) -> Result<()> {
        Ok(())
    }

    /// The child process for `node` exited with return code `rc`.
    fn on_hup(&mut self, worker: WorkerId, node: &str, rc: i32) -> Result<()> {
        Ok(())
    }

    /// All destinations of the worker have terminated. `timed_out` is set
    /// when at least one destination hit a timeout or the run was aborted.
    fn on_close(&mut self, worker: WorkerId, timed_out: bool) -> Result<()> {
        Ok(())
    }

    /// A task timer fired.
    fn on_timer(&mut self, timer: TimerId) -> Result<()> {
        Ok(())
    }

    /// A message arrived on a task port from another thread.
    fn on_port(&mut self, port: PortId, message: PortMessage) -> Result<()> {
        Ok(())
    }
}

/// Handler that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHandler;

impl EventHandler for NullHandler {}
