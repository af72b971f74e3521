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

//! Tree propagation
//!
//! Hierarchical command execution through gateway nodes: a routes table
//! ([`topology`]) describes the hops, the parent side ([`propagation`])
//! splits targets per gateway and opens framed channels ([`codec`],
//! [`messages`]), the remote side ([`gateway`]) recurses with its own
//! engine and grooms results before forwarding them upstream.

pub mod codec;
pub mod gateway;
pub mod messages;
pub mod propagation;
pub mod topology;

pub use codec::{Frame, FrameCodec, FrameType, ProtocolError};
pub use propagation::TreeWorker;
pub use topology::{Router, RoutesTable, TopologyError};
