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

//! Gateway channel frame codec.
//!
//! Wire layout, bit-stable within a major release:
//!
//! ```text
//! magic:u16  version:u8  type:u8  key_len:u16  payload_len:u32  key  payload
//! ```
//!
//! All integers are big-endian. `key` is the destination node identifier
//! (a folded node set for aggregated frames). Message boundaries are
//! preserved end-to-end.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// First two bytes of every frame.
pub const FRAME_MAGIC: u16 = 0x4D53;
/// Protocol version; a bump is only allowed within a major release when
/// both ends negotiate it.
pub const FRAME_VERSION: u8 = 0x01;

/// Fixed header size in bytes.
const HEADER_LEN: usize = 2 + 1 + 1 + 2 + 4;
/// Upper bound on one frame's payload.
const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Frame type tags (wire values are stable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// control: shell request, write-eof, forwarded configuration
    Ctl = 0,
    /// stdin bytes for remote destinations
    In = 1,
    /// stdout bytes from remote destinations
    Out = 2,
    /// stderr bytes from remote destinations
    Err = 3,
    /// destination exit status
    Hup = 4,
    /// destinations that hit a timeout
    Timeout = 5,
    /// control acknowledgement
    Ack = 6,
    /// end of channel stream
    Eof = 7,
}

impl FrameType {
    fn from_wire(tag: u8) -> Option<FrameType> {
        Some(match tag {
            0 => FrameType::Ctl,
            1 => FrameType::In,
            2 => FrameType::Out,
            3 => FrameType::Err,
            4 => FrameType::Hup,
            5 => FrameType::Timeout,
            6 => FrameType::Ack,
            7 => FrameType::Eof,
            _ => return None,
        })
    }
}

/// One framed channel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub ftype: FrameType,
    pub key: String,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(ftype: FrameType, key: impl Into<String>, payload: Vec<u8>) -> Self {
        Frame {
            ftype,
            key: key.into(),
            payload,
        }
    }

    /// Encode into a standalone byte buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = BytesMut::new();
        FrameCodec.encode(self.clone(), &mut buf)?;
        Ok(buf.to_vec())
    }
}

/// Unrecoverable framing failures; the channel must be closed on any of
/// these.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("bad frame magic 0x{found:04x}")]
    BadMagic { found: u16 },

    #[error("unsupported frame version {found}")]
    BadVersion { found: u8 },

    #[error("unknown frame type {found}")]
    BadType { found: u8 },

    #[error("frame too large ({len} bytes)")]
    Oversized { len: usize },

    #[error("malformed frame payload: {reason}")]
    BadPayload { reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// `tokio_util` codec for [`Frame`].
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let key = frame.key.as_bytes();
        if key.len() > u16::MAX as usize {
            return Err(ProtocolError::Oversized { len: key.len() });
        }
        if frame.payload.len() > MAX_PAYLOAD {
            return Err(ProtocolError::Oversized {
                len: frame.payload.len(),
            });
        }
        dst.reserve(HEADER_LEN + key.len() + frame.payload.len());
        dst.put_u16(FRAME_MAGIC);
        dst.put_u8(FRAME_VERSION);
        dst.put_u8(frame.ftype as u8);
        dst.put_u16(key.len() as u16);
        dst.put_u32(frame.payload.len() as u32);
        dst.put_slice(key);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let magic = u16::from_be_bytes([src[0], src[1]]);
        if magic != FRAME_MAGIC {
            return Err(ProtocolError::BadMagic { found: magic });
        }
        let version = src[2];
        if version != FRAME_VERSION {
            return Err(ProtocolError::BadVersion { found: version });
        }
        let ftype =
            FrameType::from_wire(src[3]).ok_or(ProtocolError::BadType { found: src[3] })?;
        let key_len = u16::from_be_bytes([src[4], src[5]]) as usize;
        let payload_len = u32::from_be_bytes([src[6], src[7], src[8], src[9]]) as usize;
        if payload_len > MAX_PAYLOAD {
            return Err(ProtocolError::Oversized { len: payload_len });
        }
        let total = HEADER_LEN + key_len + payload_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let key_bytes = src.split_to(key_len);
        let key = String::from_utf8(key_bytes.to_vec()).map_err(|_| {
            ProtocolError::BadPayload {
                reason: "frame key is not valid UTF-8".to_string(),
            }
        })?;
        let payload = src.split_to(payload_len).to_vec();
        Ok(Some(Frame {
            ftype,
            key,
            payload,
        }))
    }
}
