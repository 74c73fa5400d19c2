//! Binary frame protocol for multiplexing dial-through streams over one
//! WebSocket.
//!
//! Frame layout (10-byte header + variable payload):
//! ```text
//! | stream_id (4B) | msg_type (1B) | flags (1B) | payload_len (4B) | payload (NB) |
//! ```
//!
//! Stream id 0 carries control frames. The side that opened the WebSocket
//! allocates odd stream ids, the accepting side even ones.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::types::ClusterKey;

pub const HEADER_SIZE: usize = 10;

/// Largest payload carried by a single `Data` frame.
pub const MAX_CHUNK_SIZE: usize = 32 * 1024;

/// Frame flags.
pub mod flags {
    pub const END_STREAM: u8 = 0x01;
}

/// Message types for the tunnel protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Connect = 0x01,
    ConnectOk = 0x02,
    Data = 0x03,
    StreamEnd = 0x05,
    StreamError = 0x06,
    /// Grants the peer more send window on a stream (u32 byte count).
    WindowUpdate = 0x07,
    Ping = 0x10,
    Pong = 0x11,
    GoAway = 0x12,
}

impl MsgType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(Self::Connect),
            0x02 => Some(Self::ConnectOk),
            0x03 => Some(Self::Data),
            0x05 => Some(Self::StreamEnd),
            0x06 => Some(Self::StreamError),
            0x07 => Some(Self::WindowUpdate),
            0x10 => Some(Self::Ping),
            0x11 => Some(Self::Pong),
            0x12 => Some(Self::GoAway),
            _ => None,
        }
    }
}

/// A single multiplexed frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub stream_id: u32,
    pub msg_type: MsgType,
    pub flags: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(stream_id: u32, msg_type: MsgType, flags: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            stream_id,
            msg_type,
            flags,
            payload: payload.into(),
        }
    }

    /// Control frame (stream_id = 0).
    pub fn control(msg_type: MsgType, payload: impl Into<Bytes>) -> Self {
        Self::new(0, msg_type, 0, payload)
    }

    pub fn data(stream_id: u32, payload: impl Into<Bytes>) -> Self {
        Self::new(stream_id, MsgType::Data, 0, payload)
    }

    pub fn end(stream_id: u32) -> Self {
        Self::new(stream_id, MsgType::StreamEnd, flags::END_STREAM, Bytes::new())
    }

    pub fn error(stream_id: u32, reason: impl std::fmt::Display) -> Self {
        Self::new(
            stream_id,
            MsgType::StreamError,
            0,
            Bytes::from(reason.to_string()),
        )
    }

    pub fn window_update(stream_id: u32, credit: u32) -> Self {
        Self::new(
            stream_id,
            MsgType::WindowUpdate,
            0,
            Bytes::copy_from_slice(&credit.to_be_bytes()),
        )
    }

    /// Byte credit carried by a `WindowUpdate` frame.
    pub fn credit(&self) -> Option<u32> {
        let raw: [u8; 4] = self.payload.as_ref().try_into().ok()?;
        Some(u32::from_be_bytes(raw))
    }

    pub fn is_end_stream(&self) -> bool {
        self.flags & flags::END_STREAM != 0
    }

    /// Encode into a binary buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u32(self.stream_id);
        buf.put_u8(self.msg_type as u8);
        buf.put_u8(self.flags);
        buf.put_u32(self.payload.len() as u32);
        buf.put(self.payload.clone());
        buf.freeze()
    }

    /// Decode from a binary buffer.
    pub fn decode(mut data: Bytes) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::TooShort {
                expected: HEADER_SIZE,
                actual: data.len(),
            });
        }
        let stream_id = data.get_u32();
        let msg_type_raw = data.get_u8();
        let frame_flags = data.get_u8();
        let payload_len = data.get_u32() as usize;

        if data.remaining() < payload_len {
            return Err(ProtocolError::Incomplete {
                expected: HEADER_SIZE + payload_len,
                actual: HEADER_SIZE + data.remaining(),
            });
        }

        let msg_type =
            MsgType::from_u8(msg_type_raw).ok_or(ProtocolError::UnknownMsgType(msg_type_raw))?;
        let payload = data.split_to(payload_len);

        Ok(Self {
            stream_id,
            msg_type,
            flags: frame_flags,
            payload,
        })
    }

    /// Reason text carried by a `StreamError` frame.
    pub fn reason(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame too short: expected {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },
    #[error("frame incomplete: expected {expected} bytes, got {actual}")]
    Incomplete { expected: usize, actual: usize },
    #[error("unknown message type: 0x{0:02x}")]
    UnknownMsgType(u8),
    #[error("invalid connect metadata: {0}")]
    InvalidConnect(#[from] serde_json::Error),
}

/// JSON payload for CONNECT frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectMeta {
    pub network: String,
    pub address: String,
    /// Forward the dial into the session registered under this key instead
    /// of dialing on the receiving side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub via: Option<ClusterKey>,
}

impl ConnectMeta {
    pub fn new(network: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            address: address.into(),
            via: None,
        }
    }

    pub fn via(cluster_key: ClusterKey, network: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            via: Some(cluster_key),
            ..Self::new(network, address)
        }
    }

    pub fn to_frame(&self, stream_id: u32) -> Result<Frame, ProtocolError> {
        let payload = serde_json::to_vec(self)?;
        Ok(Frame::new(stream_id, MsgType::Connect, 0, payload))
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(&frame.payload)?)
    }
}
