//! Wire format shared with browser clients
//!
//! Two message kinds travel on the same connection:
//!
//! - frame messages (binary): a fixed 16-byte little-endian header followed
//!   directly by the JPEG payload
//! - control messages (text): JSON objects tagged by `type`, see [`status`]
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        frame_id (u32 LE)                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                                                               |
//! +               timestamp (f64 LE, seconds since epoch)         +
//! |                                                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                          fps (f32 LE)                         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         JPEG payload ...                      |
//! ```

pub mod status;

pub use status::{ControlMessage, StatusMessage};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::streaming::Frame;

/// Frame message header size in bytes
pub const FRAME_HEADER_SIZE: usize = 16;

#[derive(Error, Debug, PartialEq)]
pub enum WireError {
    #[error("frame message too short: {0} bytes, need at least {FRAME_HEADER_SIZE}")]
    Truncated(usize),

    #[error("invalid control message: {0}")]
    Control(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameHeader {
    /// Low 32 bits of the frame id
    pub frame_id: u32,
    /// Capture time, seconds since the Unix epoch
    pub timestamp: f64,
    /// Production rate at send time
    pub fps: f32,
}

impl FrameHeader {
    pub fn new(frame_id: u64, timestamp: f64, fps: f64) -> Self {
        Self {
            frame_id: frame_id as u32,
            timestamp,
            fps: fps as f32,
        }
    }

    pub fn write_to(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.frame_id);
        buf.put_f64_le(self.timestamp);
        buf.put_f32_le(self.fps);
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(WireError::Truncated(data.len()));
        }

        let mut buf = &data[..FRAME_HEADER_SIZE];
        Ok(Self {
            frame_id: buf.get_u32_le(),
            timestamp: buf.get_f64_le(),
            fps: buf.get_f32_le(),
        })
    }
}

/// Build the binary message for `frame`: header then payload, no delimiter
pub fn encode_frame_message(frame: &Frame, fps: f64) -> Bytes {
    let header = FrameHeader::new(frame.id, frame.timestamp_secs(), fps);

    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + frame.payload.len());
    header.write_to(&mut buf);
    buf.extend_from_slice(&frame.payload);
    buf.freeze()
}

/// Split a binary frame message into its header and payload
pub fn decode_frame_message(data: &[u8]) -> Result<(FrameHeader, &[u8]), WireError> {
    let header = FrameHeader::from_bytes(data)?;
    Ok((header, &data[FRAME_HEADER_SIZE..]))
}
