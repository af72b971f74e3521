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

//! Task ports: lock-free cross-thread message delivery into a task.
//!
//! A [`Port`] is the only sanctioned way for a foreign thread to talk to
//! a running task: messages enqueue on the engine's event channel and
//! surface as `on_port` events on the task's own thread. Each port keeps
//! at most `port_qlimit` undelivered messages in flight; sends over that
//! soft bound are rejected so a stalled task cannot be flooded.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::event::{PortId, PortMessage};

use super::EngineMessage;

/// Cloneable, `Send` handle delivering messages into a task.
#[derive(Clone)]
pub struct Port {
    id: PortId,
    tx: mpsc::UnboundedSender<EngineMessage>,
    /// undelivered messages of this port; the run loop decrements on
    /// dispatch
    pending: Arc<AtomicUsize>,
    qlimit: usize,
}

impl Port {
    pub(crate) fn new(
        id: PortId,
        tx: mpsc::UnboundedSender<EngineMessage>,
        qlimit: usize,
    ) -> Self {
        Port {
            id,
            tx,
            pending: Arc::new(AtomicUsize::new(0)),
            qlimit: qlimit.max(1),
        }
    }

    pub fn id(&self) -> PortId {
        self.id
    }

    /// Enqueue a message for the owning task. Fails when the task is no
    /// longer running its event loop, or when the port already holds
    /// `port_qlimit` undelivered messages.
    pub fn send(&self, message: PortMessage) -> Result<(), PortMessage> {
        if self.pending.load(Ordering::Acquire) >= self.qlimit {
            return Err(message);
        }
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.tx
            .send(EngineMessage::Port {
                id: self.id,
                message,
                pending: self.pending.clone(),
            })
            .map_err(|e| {
                self.pending.fetch_sub(1, Ordering::AcqRel);
                match e.0 {
                    EngineMessage::Port { message, .. } => message,
                    _ => unreachable!(),
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qlimit_rejects_overflow() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let port = Port::new(PortId(1), tx, 2);
        assert!(port.send(Box::new(1u32)).is_ok());
        assert!(port.send(Box::new(2u32)).is_ok());
        // third undelivered message exceeds the soft bound
        assert!(port.send(Box::new(3u32)).is_err());

        // dispatching one message frees one slot
        match rx.try_recv() {
            Ok(EngineMessage::Port { pending, .. }) => {
                pending.fetch_sub(1, Ordering::AcqRel);
            }
            _ => panic!("expected a port message"),
        }
        assert!(port.send(Box::new(4u32)).is_ok());
    }

    #[test]
    fn test_send_fails_when_channel_closed() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let port = Port::new(PortId(1), tx, 8);
        assert!(port.send(Box::new(())).is_err());
        // the failed send did not leak a pending slot
        assert_eq!(port.pending.load(Ordering::Acquire), 0);
    }
}
