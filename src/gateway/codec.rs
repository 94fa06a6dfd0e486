//! Gateway wire protocol
//!
//! ```text
//! +----------------------------+------------------------+
//! | Length (4 bytes, BE)       | JSON payload (Frame)   |
//! +----------------------------+------------------------+
//! ```
//!
//! The same framing runs on both channels. On the main channel the peer
//! sends `call`, `register` and `release` and the gateway answers with
//! `reply`. On the callback channel the direction flips: the gateway sends
//! `call` and the peer answers.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Maximum payload size of a single frame (16 MiB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Reserved target id of the root entry point
pub const ENTRY_POINT_ID: &str = "entry_point";

/// A single protocol message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Invoke `method` on the object addressed by `target`
    Call {
        id: u64,
        target: String,
        method: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    /// Answer to the request with the same `id`
    Reply { id: u64, outcome: Outcome },
    /// Peer publishes one of its callback objects under `name`
    Register {
        id: u64,
        name: String,
        object_id: String,
    },
    /// Peer no longer needs a gateway object it was handed
    Release { id: u64, object_id: String },
}

impl Frame {
    pub fn id(&self) -> u64 {
        match self {
            Frame::Call { id, .. }
            | Frame::Reply { id, .. }
            | Frame::Register { id, .. }
            | Frame::Release { id, .. } => *id,
        }
    }

    pub fn ok(id: u64, value: Value) -> Self {
        Frame::Reply {
            id,
            outcome: Outcome::Ok(value),
        }
    }

    pub fn err(id: u64, message: impl Into<String>) -> Self {
        Frame::Reply {
            id,
            outcome: Outcome::Err(message.into()),
        }
    }
}

/// Result carried by a reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Ok(Value),
    Err(String),
}

impl Outcome {
    pub fn into_result(self) -> Result<Value, String> {
        match self {
            Outcome::Ok(v) => Ok(v),
            Outcome::Err(e) => Err(e),
        }
    }
}

/// Error type for frame encoding and decoding
#[derive(Debug)]
pub enum FrameError {
    /// Transport or length-prefix error
    Io(std::io::Error),
    /// Payload was not a valid frame
    Json(serde_json::Error),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Io(e) => write!(f, "Frame I/O error: {}", e),
            FrameError::Json(e) => write!(f, "Malformed frame: {}", e),
        }
    }
}

impl std::error::Error for FrameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FrameError::Io(e) => Some(e),
            FrameError::Json(e) => Some(e),
        }
    }
}

impl From<std::io::Error> for FrameError {
    fn from(e: std::io::Error) -> Self {
        FrameError::Io(e)
    }
}

impl From<serde_json::Error> for FrameError {
    fn from(e: serde_json::Error) -> Self {
        FrameError::Json(e)
    }
}

/// Length-prefixed JSON codec for [`Frame`]
#[derive(Debug)]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl FrameCodec {
    pub fn new() -> Self {
        FrameCodec {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .big_endian()
                .max_frame_length(MAX_FRAME_SIZE)
                .new_codec(),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        match self.inner.decode(src)? {
            Some(payload) => Ok(Some(serde_json::from_slice(&payload)?)),
            None => Ok(None),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        let payload = serde_json::to_vec(&frame)?;
        self.inner.encode(Bytes::from(payload), dst)?;
        Ok(())
    }
}
