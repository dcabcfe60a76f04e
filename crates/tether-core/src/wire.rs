//! Request and response body encoding.
//!
//! Bodies are fixed-layout little-endian. A request carries the fields the
//! peer needs to route and reply; a response echoes the sequence so the
//! originating call can be found. Payloads are opaque byte strings.
//!
//! ```text
//! request:  | seq u64 | code i32 | oneway u8 | created_at_ms i64 | payload_len u32 | payload |
//! response: | seq u64 | code i32 | payload_len u32 | payload |
//! ```
//!
//! Roles are fixed per direction: clients decode inbound bodies as responses,
//! servers decode them as requests.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::DecodeError;

/// An invocation of a numbered request code on the peer.
///
/// Immutable after creation.
#[derive(Debug, Clone)]
pub struct Request {
    /// Unique, monotonically increasing per client connection.
    pub sequence: u64,
    /// Selects a handler on the peer.
    pub code: i32,
    /// One-way requests expect no response and are never registered for one.
    pub oneway: bool,
    /// Wall-clock stamp, milliseconds since the Unix epoch. Informational.
    pub created_at_ms: i64,
    pub payload: Bytes,
}

impl Request {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(REQUEST_FIXED_LEN + self.payload.len());
        buf.put_u64_le(self.sequence);
        buf.put_i32_le(self.code);
        buf.put_u8(self.oneway as u8);
        buf.put_i64_le(self.created_at_ms);
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf
    }

    pub fn decode(mut body: Bytes) -> Result<Self, DecodeError> {
        if body.remaining() < REQUEST_FIXED_LEN {
            return Err(DecodeError::UnexpectedEof);
        }
        let sequence = body.get_u64_le();
        let code = body.get_i32_le();
        let oneway = body.get_u8() != 0;
        let created_at_ms = body.get_i64_le();
        let payload = take_payload(&mut body)?;
        if body.has_remaining() {
            return Err(DecodeError::TrailingBytes {
                remaining: body.remaining(),
            });
        }
        Ok(Self {
            sequence,
            code,
            oneway,
            created_at_ms,
            payload,
        })
    }
}

/// The peer's reply to a non-one-way [`Request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Echoes the request's sequence.
    pub sequence: u64,
    /// Application-defined status.
    pub code: i32,
    pub payload: Bytes,
}

impl Response {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(RESPONSE_FIXED_LEN + self.payload.len());
        buf.put_u64_le(self.sequence);
        buf.put_i32_le(self.code);
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf
    }

    pub fn decode(mut body: Bytes) -> Result<Self, DecodeError> {
        if body.remaining() < RESPONSE_FIXED_LEN {
            return Err(DecodeError::UnexpectedEof);
        }
        let sequence = body.get_u64_le();
        let code = body.get_i32_le();
        let payload = take_payload(&mut body)?;
        if body.has_remaining() {
            return Err(DecodeError::TrailingBytes {
                remaining: body.remaining(),
            });
        }
        Ok(Self {
            sequence,
            code,
            payload,
        })
    }
}

// Fixed field sizes including the payload length prefix.
const REQUEST_FIXED_LEN: usize = 8 + 4 + 1 + 8 + 4;
const RESPONSE_FIXED_LEN: usize = 8 + 4 + 4;

fn take_payload(body: &mut Bytes) -> Result<Bytes, DecodeError> {
    // The u32 length prefix was accounted for by the fixed-length check,
    // but the payload bytes themselves were not.
    let len = body.get_u32_le() as usize;
    if body.remaining() < len {
        return Err(DecodeError::UnexpectedEof);
    }
    Ok(body.split_to(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip() {
        let request = Request {
            sequence: 42,
            code: 7,
            oneway: true,
            created_at_ms: 1_700_000_000_000,
            payload: Bytes::from_static(b"hello"),
        };
        let decoded = Request::decode(request.encode().freeze()).unwrap();
        assert_eq!(decoded.sequence, 42);
        assert_eq!(decoded.code, 7);
        assert!(decoded.oneway);
        assert_eq!(decoded.created_at_ms, 1_700_000_000_000);
        assert_eq!(decoded.payload, Bytes::from_static(b"hello"));
    }

    #[test]
    fn response_round_trip() {
        let response = Response {
            sequence: u64::MAX,
            code: -3,
            payload: Bytes::new(),
        };
        let decoded = Response::decode(response.encode().freeze()).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn request_layout_is_stable() {
        let request = Request {
            sequence: 1,
            code: 2,
            oneway: false,
            created_at_ms: 3,
            payload: Bytes::from_static(&[0xAA]),
        };
        let body = request.encode();
        assert_eq!(body.len(), REQUEST_FIXED_LEN + 1);
        assert_eq!(&body[..8], &1u64.to_le_bytes());
        assert_eq!(&body[8..12], &2i32.to_le_bytes());
        assert_eq!(body[12], 0);
        assert_eq!(&body[13..21], &3i64.to_le_bytes());
        assert_eq!(&body[21..25], &1u32.to_le_bytes());
        assert_eq!(body[25], 0xAA);
    }

    #[test]
    fn truncated_body_is_rejected() {
        let body = Response {
            sequence: 9,
            code: 0,
            payload: Bytes::from_static(b"xyz"),
        }
        .encode()
        .freeze();
        for cut in 0..body.len() {
            let err = Response::decode(body.slice(..cut)).unwrap_err();
            assert_eq!(err, DecodeError::UnexpectedEof, "cut at {cut}");
        }
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut body = Request {
            sequence: 1,
            code: 1,
            oneway: false,
            created_at_ms: 0,
            payload: Bytes::new(),
        }
        .encode();
        body.put_u8(0xFF);
        let err = Request::decode(body.freeze()).unwrap_err();
        assert_eq!(err, DecodeError::TrailingBytes { remaining: 1 });
    }
}
