//! Length-prefixed frame codec.
//!
//! Every message on the wire is `u32 little-endian length || length bytes of
//! body`. The body is opaque at this layer.

use bytes::{BufMut, BytesMut};

use crate::error::FrameError;

/// Size of the length prefix.
pub const FRAME_HEADER_LEN: usize = 4;

/// Default cap on a single frame body.
pub const DEFAULT_MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

/// Prepend the length prefix to `body`.
///
/// The returned buffer is the complete wire message, `FRAME_HEADER_LEN +
/// body.len()` bytes.
pub fn encode_frame(body: &[u8], max_frame_bytes: u32) -> Result<BytesMut, FrameError> {
    if body.len() as u64 > max_frame_bytes as u64 {
        return Err(FrameError::TooLarge {
            len: body.len() as u32,
            max: max_frame_bytes,
        });
    }
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + body.len());
    buf.put_u32_le(body.len() as u32);
    buf.put_slice(body);
    Ok(buf)
}

/// Decode the 4-byte length prefix.
pub fn decode_header(header: [u8; FRAME_HEADER_LEN]) -> u32 {
    u32::from_le_bytes(header)
}
