//! Error types for the framing, transport, and call layers.

use core::fmt;
use std::net::SocketAddr;
use std::time::Duration;

/// Receive-side framing violations.
///
/// A framing violation is unrecoverable for the connection that produced it:
/// the byte stream can no longer be trusted to contain frame boundaries, so
/// the connection is closed and the error reported through the receive-error
/// hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// The advertised body length exceeds the configured cap.
    TooLarge { len: u32, max: u32 },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooLarge { len, max } => {
                write!(f, "frame body {len} bytes exceeds max {max}")
            }
        }
    }
}

impl std::error::Error for FrameError {}

/// Malformed message bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// The body ended before all fixed fields or the payload were read.
    UnexpectedEof,
    /// The body carried bytes past the end of the payload.
    TrailingBytes { remaining: usize },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEof => write!(f, "message body ended unexpectedly"),
            Self::TrailingBytes { remaining } => {
                write!(f, "message body has {remaining} trailing bytes")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// Connection-level errors.
///
/// These close the affected connection and are reported to the event hook;
/// they never propagate past the connection that produced them.
#[derive(Debug)]
pub enum TransportError {
    /// The connection was closed, locally or by the peer.
    Closed,
    Io(std::io::Error),
    Frame(FrameError),
    Decode(DecodeError),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "connection closed"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Frame(e) => write!(f, "framing error: {e}"),
            Self::Decode(e) => write!(f, "decode error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Frame(e) => Some(e),
            Self::Decode(e) => Some(e),
            Self::Closed => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<FrameError> for TransportError {
    fn from(e: FrameError) -> Self {
        Self::Frame(e)
    }
}

impl From<DecodeError> for TransportError {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}

/// Per-call errors surfaced to invokers.
#[derive(Debug)]
pub enum CallError {
    /// Establishing the connection failed.
    Connect {
        endpoint: String,
        source: std::io::Error,
    },
    /// The send to the peer failed; the call never reached the wire intact.
    Send(TransportError),
    /// The deadline expired without a matching response arriving.
    Timeout {
        addr: SocketAddr,
        code: i32,
        seq: u64,
        timeout: Duration,
    },
    /// The sequence collided with an outstanding call. Signals counter
    /// corruption or wrap-around onto a still-pending sequence.
    DuplicateSequence(u64),
    /// The client was shut down before or while the call was outstanding.
    Closed,
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect { endpoint, source } => {
                write!(f, "failed to connect to {endpoint}: {source}")
            }
            Self::Send(e) => write!(f, "send failed: {e}"),
            Self::Timeout {
                addr,
                code,
                seq,
                timeout,
            } => write!(
                f,
                "request code {code} (seq {seq}) to {addr} timed out after {timeout:?}"
            ),
            Self::DuplicateSequence(seq) => {
                write!(f, "sequence {seq} already has a pending call")
            }
            Self::Closed => write!(f, "client is shut down"),
        }
    }
}

impl std::error::Error for CallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Connect { source, .. } => Some(source),
            Self::Send(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for CallError {
    fn from(e: TransportError) -> Self {
        Self::Send(e)
    }
}
