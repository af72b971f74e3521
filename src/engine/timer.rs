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

//! Engine timers: one-shot and periodic callbacks on the task thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::event::TimerId;

use super::{EngineHandle, EngineMessage};

/// Shared invalidation flag for a registered timer.
#[derive(Debug, Clone, Default)]
pub(crate) struct TimerGuard(Arc<AtomicBool>);

impl TimerGuard {
    pub(crate) fn invalidate(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    fn is_invalidated(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Fire a timer after `delay`, then every `interval` until invalidated.
/// Timers fire in non-decreasing deadline order since they share the
/// runtime's time driver and the run loop drains events in order.
pub(crate) async fn run_timer(
    id: TimerId,
    delay: Duration,
    interval: Option<Duration>,
    handle: EngineHandle,
    guard: TimerGuard,
) {
    let mut next = Instant::now() + delay;
    loop {
        tokio::select! {
            biased;
            _ = handle.cancel.cancelled() => return,
            _ = tokio::time::sleep_until(next) => {}
        }
        if guard.is_invalidated() {
            return;
        }
        if handle.tx.send(EngineMessage::Timer { id }).is_err() {
            return;
        }
        match interval {
            Some(every) => next += every,
            None => return,
        }
    }
}
