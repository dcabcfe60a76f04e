//! Connection write path.
//!
//! One socket carries both directions; reads are owned by the receive loop,
//! and all writes go through [`Conn`], which serializes them behind an async
//! mutex. The first write failure latches the connection closed; subsequent
//! sends fail fast with [`TransportError::Closed`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::TransportError;
use crate::frame::encode_frame;

pub struct Conn {
    writer: AsyncMutex<Box<dyn AsyncWrite + Unpin + Send + Sync>>,
    peer: SocketAddr,
    closed: AtomicBool,
    max_frame_bytes: u32,
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Conn {
    pub fn new<W>(writer: W, peer: SocketAddr, max_frame_bytes: u32) -> Self
    where
        W: AsyncWrite + Unpin + Send + Sync + 'static,
    {
        Self {
            writer: AsyncMutex::new(Box::new(writer)),
            peer,
            closed: AtomicBool::new(false),
            max_frame_bytes,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Latch the connection closed without touching the socket. Further
    /// sends fail fast.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Length-prefix `body` and write the whole message.
    pub async fn send(&self, body: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let frame = encode_frame(body, self.max_frame_bytes)?;
        let mut writer = self.writer.lock().await;
        let result = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = result {
            self.close();
            return Err(TransportError::Io(e));
        }
        Ok(())
    }

    /// Shut down the write side and latch closed.
    pub async fn shutdown(&self) {
        self.close();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!(peer = %self.peer, error = %e, "shutdown on write half failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn peer() -> SocketAddr {
        "127.0.0.1:5000".parse().unwrap()
    }

    #[tokio::test]
    async fn send_writes_one_length_prefixed_message() {
        let (local, mut remote) = tokio::io::duplex(64);
        let conn = Conn::new(local, peer(), 1024);
        conn.send(b"ping").await.unwrap();

        let mut got = [0u8; 8];
        remote.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, &[4, 0, 0, 0, b'p', b'i', b'n', b'g']);
    }

    #[tokio::test]
    async fn send_after_close_fails_fast() {
        let (local, _remote) = tokio::io::duplex(64);
        let conn = Conn::new(local, peer(), 1024);
        conn.close();
        assert!(matches!(
            conn.send(b"x").await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn oversized_body_is_rejected_before_writing() {
        let (local, mut remote) = tokio::io::duplex(64);
        let conn = Conn::new(local, peer(), 4);
        assert!(matches!(
            conn.send(b"too big").await,
            Err(TransportError::Frame(_))
        ));
        drop(conn);
        let mut rest = Vec::new();
        remote.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn write_error_latches_closed() {
        let (local, remote) = tokio::io::duplex(64);
        drop(remote);
        let conn = Conn::new(local, peer(), 1024);
        assert!(matches!(conn.send(b"x").await, Err(TransportError::Io(_))));
        assert!(conn.is_closed());
    }
}
