//! Client engine: correlated invocation over one framed TCP connection.
//!
//! ```text
//!                   ┌────────────────────────────────┐
//!                   │             Client             │
//!                   ├────────────────────────────────┤
//!                   │  conn:  serialized write half  │
//!                   │  calls: seq -> pending call    │
//!                   │  seq:   atomic allocator       │
//!                   └──────────┬─────────────────────┘
//!                              │
//!          ┌───────────────────┼──────────────────────┐
//!          │                   │                      │
//!    caller tasks        receive loop          timeout scanner
//!  (call/submit/notify) (route responses      (sweep overdue calls,
//!   register + send      by sequence to        complete with the
//!   on the shared wire)  the pending call)     no-response sentinel)
//! ```
//!
//! All three finishers go through the pending table's atomic take, so every
//! call is completed exactly once no matter how the races fall.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::oneshot;

use tether_core::{
    run_receiver, wall_clock_ms, CallError, ClientConfig, Conn, FrameDecoder, PendingCall,
    PendingTable, Request, Response, ScheduledTask, Scheduler, SendState, SequenceGen,
    TokioScheduler, TransportError,
};

/// A client-side connection to one remote peer.
///
/// Cheap to share behind an `Arc`; all invocation methods take `&self`.
/// Dropping the client (or calling [`Client::shutdown`]) stops the receive
/// loop and the scanner and fails every outstanding call, so no caller
/// blocks forever.
pub struct Client {
    inner: Arc<ClientInner>,
    recv_task: tokio::task::JoinHandle<()>,
    scanner: ScheduledTask,
}

struct ClientInner {
    conn: Conn,
    calls: PendingTable,
    seq: SequenceGen,
    closed: AtomicBool,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("peer", &self.inner.conn.peer())
            .field("outstanding", &self.inner.calls.len())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Connect using the default tokio-backed scheduler.
    pub async fn connect(config: ClientConfig) -> Result<Self, CallError> {
        Self::connect_with(config, Arc::new(TokioScheduler)).await
    }

    /// Connect with an explicit scheduler collaborator.
    pub async fn connect_with(
        config: ClientConfig,
        scheduler: Arc<dyn Scheduler>,
    ) -> Result<Self, CallError> {
        let endpoint = config.endpoint();
        let stream = TcpStream::connect(&endpoint)
            .await
            .map_err(|source| CallError::Connect {
                endpoint: endpoint.clone(),
                source,
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%endpoint, error = %e, "set_nodelay failed");
        }
        let peer = stream.peer_addr().map_err(|source| CallError::Connect {
            endpoint,
            source,
        })?;
        let (read, write) = stream.into_split();

        let inner = Arc::new(ClientInner {
            conn: Conn::new(write, peer, config.max_frame_bytes),
            calls: PendingTable::new(),
            seq: SequenceGen::new(),
            closed: AtomicBool::new(false),
        });

        let decoder = FrameDecoder::new(config.receive_buffer_size, config.max_frame_bytes);
        let recv_task = tokio::spawn(receive_loop(inner.clone(), read, decoder));

        let sweeper = inner.clone();
        let scanner = scheduler.schedule(
            Box::new(move || sweeper.sweep_expired()),
            config.scanner_initial_delay,
            config.scanner_period,
        );

        tracing::debug!(%peer, "client connected");
        Ok(Self {
            inner,
            recv_task,
            scanner,
        })
    }

    pub fn peer(&self) -> std::net::SocketAddr {
        self.inner.conn.peer()
    }

    /// Number of calls currently awaiting a response. Diagnostics.
    pub fn outstanding_calls(&self) -> usize {
        self.inner.calls.len()
    }

    /// Invoke `code` and wait for the correlated response, at most `timeout`.
    ///
    /// Exactly one of three outcomes: the response, [`CallError::Timeout`]
    /// when the peer never answered a successfully sent request, or
    /// [`CallError::Send`] when the request did not make it onto the wire.
    pub async fn call(
        &self,
        code: i32,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Response, CallError> {
        let reply = self.submit(code, payload, timeout).await?;
        let seq = reply.sequence();
        match tokio::time::timeout(timeout, reply.wait()).await {
            Ok(result) => result,
            // The scanner will reclaim the table entry.
            Err(_) => Err(CallError::Timeout {
                addr: self.inner.conn.peer(),
                code,
                seq,
                timeout,
            }),
        }
    }

    /// Invoke `code` without waiting: the returned [`PendingReply`] resolves
    /// to the same outcomes [`Client::call`] produces.
    pub async fn submit(
        &self,
        code: i32,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<PendingReply, CallError> {
        self.inner.start_call(code, payload, timeout).await
    }

    /// Fire-and-forget: no pending-call entry, no wait. A send failure
    /// surfaces immediately.
    pub async fn notify(&self, code: i32, payload: Bytes) -> Result<(), CallError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(CallError::Closed);
        }
        let request = Request {
            sequence: self.inner.seq.next(),
            code,
            oneway: true,
            created_at_ms: wall_clock_ms(),
            payload,
        };
        tracing::trace!(seq = request.sequence, code, "sending one-way request");
        self.inner
            .conn
            .send(&request.encode())
            .await
            .map_err(CallError::Send)
    }

    /// Stop the receive loop and the scanner, close the connection, and fail
    /// every outstanding call.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(peer = %self.inner.conn.peer(), "client shutting down");
        self.scanner.cancel();
        self.recv_task.abort();
        self.inner.conn.shutdown().await;
        self.inner.fail_outstanding();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::Release);
        self.recv_task.abort();
        self.inner.conn.close();
        self.inner.fail_outstanding();
    }
}

impl ClientInner {
    async fn start_call(
        &self,
        code: i32,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<PendingReply, CallError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CallError::Closed);
        }
        let seq = self.seq.next();
        let request = Request {
            sequence: seq,
            code,
            oneway: false,
            created_at_ms: wall_clock_ms(),
            payload,
        };
        let body = request.encode();

        let send_state = SendState::new();
        let (call, rx) = PendingCall::new(seq, code, timeout, send_state.clone());
        self.calls
            .insert(call)
            .map_err(|rejected| CallError::DuplicateSequence(rejected.seq))?;

        tracing::trace!(seq, code, ?timeout, "sending request");
        match self.conn.send(&body).await {
            Ok(()) => send_state.mark_succeeded(),
            Err(e) => {
                tracing::warn!(seq, code, error = %e, "send failed");
                send_state.mark_failed(e);
                // A concurrent response or sweep may have taken the entry
                // already; whoever removes it completes it.
                if let Some(call) = self.calls.remove(seq) {
                    call.complete(None);
                }
            }
        }

        Ok(PendingReply {
            rx,
            send_state,
            addr: self.conn.peer(),
            seq,
            code,
            timeout,
        })
    }

    fn on_frame(&self, frame: Bytes) -> Result<(), TransportError> {
        let response = Response::decode(frame).map_err(TransportError::Decode)?;
        match self.calls.remove(response.sequence) {
            Some(call) => {
                tracing::trace!(seq = response.sequence, code = response.code, "response routed");
                call.complete(Some(response));
            }
            None => {
                // Arrives when the scanner reclaimed the entry first.
                tracing::error!(
                    seq = response.sequence,
                    code = response.code,
                    "no pending call for response; dropping"
                );
            }
        }
        Ok(())
    }

    fn sweep_expired(&self) {
        let expired = self.calls.sweep(Instant::now());
        if expired.is_empty() {
            return;
        }
        tracing::debug!(count = expired.len(), "expiring overdue calls");
        for call in expired {
            call.complete(None);
        }
    }

    /// Complete every outstanding call with the no-response sentinel and a
    /// failed send state, so waiters surface a send-style error instead of
    /// hanging until their deadline.
    fn fail_outstanding(&self) {
        for call in self.calls.drain() {
            call.send_state.mark_failed(TransportError::Closed);
            call.complete(None);
        }
    }
}

async fn receive_loop(inner: Arc<ClientInner>, read: OwnedReadHalf, decoder: FrameDecoder) {
    let result = run_receiver(read, decoder, |frame| inner.on_frame(frame)).await;
    match result {
        Ok(()) => tracing::debug!(peer = %inner.conn.peer(), "peer closed connection"),
        Err(e) => tracing::warn!(peer = %inner.conn.peer(), error = %e, "receive loop error"),
    }
    inner.closed.store(true, Ordering::Release);
    inner.conn.close();
    inner.fail_outstanding();
}

/// The completion future of a [`Client::submit`] invocation.
#[derive(Debug)]
pub struct PendingReply {
    rx: oneshot::Receiver<Option<Response>>,
    send_state: SendState,
    addr: std::net::SocketAddr,
    seq: u64,
    code: i32,
    timeout: Duration,
}

impl PendingReply {
    pub fn sequence(&self) -> u64 {
        self.seq
    }

    /// Wait for the call to finish.
    ///
    /// Resolution is driven by the response path, the timeout scanner, or
    /// the send-failure path, whichever claims the call first.
    pub async fn wait(self) -> Result<Response, CallError> {
        match self.rx.await {
            Ok(Some(response)) => Ok(response),
            Ok(None) => match self.send_state.take_failure() {
                Some(cause) => Err(CallError::Send(cause)),
                None => Err(CallError::Timeout {
                    addr: self.addr,
                    code: self.code,
                    seq: self.seq,
                    timeout: self.timeout,
                }),
            },
            // Sender dropped without completing: the client was torn down.
            Err(_) => Err(CallError::Closed),
        }
    }
}
