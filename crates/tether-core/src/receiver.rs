//! Receive-side framing: a per-connection state machine that turns a byte
//! stream delivered in arbitrary chunk sizes into an ordered sequence of
//! complete frame bodies.
//!
//! The state machine is a plain struct ([`FrameDecoder`]) so that framing is
//! testable without sockets; [`run_receiver`] drives it against an
//! [`AsyncRead`] until EOF or error.
//!
//! The decoder never assumes a header arrives whole: it accumulates the
//! 4-byte prefix across as many reads as the stream takes to deliver it, and
//! likewise accumulates body bytes until the advertised length is reached.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{FrameError, TransportError};
use crate::frame::{decode_header, FRAME_HEADER_LEN};

/// Framing state for one connection.
///
/// `expected == None` means the header is being read; `Some(n)` means `n`
/// body bytes are expected and `accumulated` holds the partial body.
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_bytes: u32,
    buffer_size: usize,
    header: [u8; FRAME_HEADER_LEN],
    header_filled: usize,
    expected: Option<usize>,
    accumulated: BytesMut,
}

impl FrameDecoder {
    pub fn new(buffer_size: usize, max_frame_bytes: u32) -> Self {
        Self {
            max_frame_bytes,
            buffer_size: buffer_size.max(FRAME_HEADER_LEN),
            header: [0; FRAME_HEADER_LEN],
            header_filled: 0,
            expected: None,
            accumulated: BytesMut::new(),
        }
    }

    /// Scratch-buffer size the read loop should allocate.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// How many bytes the next read should request: the rest of the header,
    /// or the rest of the body capped at the buffer size.
    pub fn budget(&self) -> usize {
        match self.expected {
            None => FRAME_HEADER_LEN - self.header_filled,
            Some(expected) => (expected - self.accumulated.len()).min(self.buffer_size),
        }
    }

    /// Consume one chunk, emitting every frame it completes, in order.
    pub fn feed(&mut self, mut chunk: &[u8]) -> Result<Vec<Bytes>, FrameError> {
        let mut frames = Vec::new();
        while !chunk.is_empty() {
            match self.expected {
                None => {
                    let take = (FRAME_HEADER_LEN - self.header_filled).min(chunk.len());
                    self.header[self.header_filled..self.header_filled + take]
                        .copy_from_slice(&chunk[..take]);
                    self.header_filled += take;
                    chunk = &chunk[take..];
                    if self.header_filled == FRAME_HEADER_LEN {
                        self.header_filled = 0;
                        let len = decode_header(self.header);
                        if len > self.max_frame_bytes {
                            return Err(FrameError::TooLarge {
                                len,
                                max: self.max_frame_bytes,
                            });
                        }
                        if len == 0 {
                            frames.push(Bytes::new());
                        } else {
                            self.expected = Some(len as usize);
                        }
                    }
                }
                Some(expected) => {
                    let take = (expected - self.accumulated.len()).min(chunk.len());
                    self.accumulated.extend_from_slice(&chunk[..take]);
                    chunk = &chunk[take..];
                    if self.accumulated.len() == expected {
                        frames.push(self.accumulated.split().freeze());
                        self.expected = None;
                    }
                }
            }
        }
        Ok(frames)
    }
}

/// Drive `decoder` against `read`, handing each complete frame to `on_frame`
/// in arrival order.
///
/// Returns `Ok(())` on clean EOF. An I/O error, a framing violation, or an
/// error from `on_frame` stops the loop and is returned; the caller owns
/// closing the connection and reporting the cause.
pub async fn run_receiver<R, F>(
    mut read: R,
    mut decoder: FrameDecoder,
    mut on_frame: F,
) -> Result<(), TransportError>
where
    R: AsyncRead + Unpin,
    F: FnMut(Bytes) -> Result<(), TransportError>,
{
    let mut scratch = vec![0u8; decoder.buffer_size()];
    loop {
        let budget = decoder.budget();
        let n = read.read(&mut scratch[..budget]).await?;
        if n == 0 {
            return Ok(());
        }
        for frame in decoder.feed(&scratch[..n])? {
            on_frame(frame)?;
        }
    }
}
