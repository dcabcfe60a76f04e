//! Server engine: accept connections, dispatch requests by code, reply on
//! the originating connection.
//!
//! Each accepted connection gets its own receive loop, so a slow handler on
//! one connection never stalls receives on another; within a connection,
//! handlers are additionally spawned onto their own task. Handler panics are
//! caught and logged so the connection survives them.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpSocket, TcpStream};

use tether_core::{
    run_receiver, Conn, FrameDecoder, Request, Response, ScheduledTask, Scheduler, ServerConfig,
    TokioScheduler, TransportError,
};

/// Boxed future returned by request handlers. `None` means no reply is sent
/// and the caller times out.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Option<Response>> + Send>>;

/// A request handler, registered against a request code.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, ctx: RequestContext, request: Request) -> HandlerFuture;
}

/// Wrap an async closure as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(RequestContext, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<Response>> + Send + 'static,
{
    struct FnHandler<F>(F);

    impl<F, Fut> Handler for FnHandler<F>
    where
        F: Fn(RequestContext, Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<Response>> + Send + 'static,
    {
        fn handle(&self, ctx: RequestContext, request: Request) -> HandlerFuture {
            Box::pin((self.0)(ctx, request))
        }
    }

    Arc::new(FnHandler(f))
}

/// Handle through which a handler reaches the originating connection,
/// including for deferred replies from a spawned task.
#[derive(Debug, Clone)]
pub struct RequestContext {
    conn: Arc<Conn>,
}

impl RequestContext {
    /// Identity of the connection the request arrived on.
    pub fn peer(&self) -> SocketAddr {
        self.conn.peer()
    }

    /// Send a response on the originating connection.
    pub async fn send_response(&self, response: Response) -> Result<(), TransportError> {
        self.conn.send(&response.encode()).await
    }
}

/// Connection lifecycle notifications.
///
/// Every callback runs on a task of its own, never on the accept or receive
/// loops.
pub trait SocketEventListener: Send + Sync + 'static {
    fn on_accept(&self, peer: SocketAddr) {
        let _ = peer;
    }
    fn on_disconnect(&self, peer: SocketAddr) {
        let _ = peer;
    }
    fn on_receive_error(&self, peer: SocketAddr, error: TransportError) {
        let _ = (peer, error);
    }
}

/// A listening server: handler registry, connection map, liveness sweep.
pub struct Server {
    inner: Arc<ServerInner>,
    local_addr: SocketAddr,
    accept_task: tokio::task::JoinHandle<()>,
    liveness: ScheduledTask,
}

struct ServerInner {
    config: ServerConfig,
    handlers: RwLock<HashMap<i32, Arc<dyn Handler>>>,
    connections: Mutex<HashMap<String, Arc<ServerConn>>>,
    events: Option<Arc<dyn SocketEventListener>>,
    shutting_down: AtomicBool,
}

struct ServerConn {
    conn: Arc<Conn>,
    /// Set by the receive loop when it observes EOF or an error; the
    /// liveness sweep collects flagged entries.
    dead: AtomicBool,
    recv_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .field("connections", &self.inner.connections.lock().len())
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Bind and start accepting, with the default tokio-backed scheduler and
    /// no event listener.
    pub async fn bind(config: ServerConfig) -> std::io::Result<Self> {
        Self::bind_with(config, Arc::new(TokioScheduler), None).await
    }

    /// Bind with an explicit scheduler and an optional event listener.
    pub async fn bind_with(
        config: ServerConfig,
        scheduler: Arc<dyn Scheduler>,
        events: Option<Arc<dyn SocketEventListener>>,
    ) -> std::io::Result<Self> {
        let addr: SocketAddr = config.endpoint().parse().map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid listen address {}: {e}", config.endpoint()),
            )
        })?;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(config.listen_backlog)?;
        let local_addr = listener.local_addr()?;

        let liveness_period = config.liveness_period;
        let inner = Arc::new(ServerInner {
            config,
            handlers: RwLock::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
            events,
            shutting_down: AtomicBool::new(false),
        });

        let accept_task = tokio::spawn(accept_loop(inner.clone(), listener));

        let live_inner = inner.clone();
        let liveness = scheduler.schedule(
            Box::new(move || live_inner.collect_dead_connections()),
            liveness_period,
            liveness_period,
        );

        tracing::debug!(%local_addr, "server listening");
        Ok(Self {
            inner,
            local_addr,
            accept_task,
            liveness,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Register `handler` for `code`. Last registration wins.
    pub fn register(&self, code: i32, handler: Arc<dyn Handler>) {
        if self.inner.handlers.write().insert(code, handler).is_some() {
            tracing::debug!(code, "handler replaced");
        }
    }

    /// Register an async closure for `code`.
    pub fn register_fn<F, Fut>(&self, code: i32, f: F)
    where
        F: Fn(RequestContext, Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<Response>> + Send + 'static,
    {
        self.register(code, handler_fn(f));
    }

    /// Number of live connections. Diagnostics.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().len()
    }

    /// Stop accepting, stop every receive loop, and close all connections.
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(local_addr = %self.local_addr, "server shutting down");
        self.accept_task.abort();
        self.liveness.cancel();
        let connections: Vec<Arc<ServerConn>> =
            self.inner.connections.lock().drain().map(|(_, c)| c).collect();
        for entry in connections {
            if let Some(task) = entry.recv_task.lock().take() {
                task.abort();
            }
            entry.conn.shutdown().await;
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.inner.shutting_down.store(true, Ordering::Release);
        self.accept_task.abort();
        for (_, entry) in self.inner.connections.lock().drain() {
            if let Some(task) = entry.recv_task.lock().take() {
                task.abort();
            }
            entry.conn.close();
        }
    }
}

async fn accept_loop(inner: Arc<ServerInner>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => inner.clone().start_connection(stream, peer),
            Err(e) => {
                if inner.shutting_down.load(Ordering::Acquire) {
                    return;
                }
                // Transient accept failures (EMFILE and friends); keep going.
                tracing::warn!(error = %e, "accept failed");
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        }
    }
}

impl ServerInner {
    fn start_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%peer, error = %e, "set_nodelay failed");
        }
        let (read, write) = stream.into_split();
        let conn = Arc::new(Conn::new(write, peer, self.config.max_frame_bytes));
        let entry = Arc::new(ServerConn {
            conn: conn.clone(),
            dead: AtomicBool::new(false),
            recv_task: Mutex::new(None),
        });
        self.connections
            .lock()
            .insert(peer.to_string(), entry.clone());
        tracing::debug!(%peer, "connection accepted");
        self.notify(move |events| events.on_accept(peer));

        let inner = self;
        let task_entry = entry.clone();
        let task = tokio::spawn(async move {
            let decoder = FrameDecoder::new(
                inner.config.receive_buffer_size,
                inner.config.max_frame_bytes,
            );
            let result = run_receiver(read, decoder, |frame| inner.handle_frame(&conn, frame)).await;
            match result {
                Ok(()) => tracing::debug!(%peer, "peer closed connection"),
                Err(error) => {
                    tracing::warn!(%peer, %error, "receive error");
                    inner.notify(move |events| events.on_receive_error(peer, error));
                }
            }
            conn.close();
            task_entry.dead.store(true, Ordering::Release);
        });
        *entry.recv_task.lock() = Some(task);
    }

    fn handle_frame(&self, conn: &Arc<Conn>, frame: Bytes) -> Result<(), TransportError> {
        let request = Request::decode(frame).map_err(TransportError::Decode)?;
        let handler = self.handlers.read().get(&request.code).cloned();
        let Some(handler) = handler else {
            tracing::error!(
                code = request.code,
                seq = request.sequence,
                peer = %conn.peer(),
                "no handler for request code; dropping"
            );
            return Ok(());
        };

        let ctx = RequestContext { conn: conn.clone() };
        let conn = conn.clone();
        let oneway = request.oneway;
        let sequence = request.sequence;
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(handler.handle(ctx, request))
                .catch_unwind()
                .await;
            let response = match outcome {
                Ok(response) => response,
                Err(panic) => {
                    let message = if let Some(s) = panic.downcast_ref::<&str>() {
                        s.to_string()
                    } else if let Some(s) = panic.downcast_ref::<String>() {
                        s.clone()
                    } else {
                        "non-string panic".to_string()
                    };
                    tracing::error!(seq = sequence, panic = %message, "handler panicked");
                    None
                }
            };
            if oneway {
                // One-way requests never get a reply, whatever the handler
                // returned.
                return;
            }
            if let Some(response) = response {
                if let Err(error) = conn.send(&response.encode()).await {
                    tracing::warn!(seq = sequence, %error, "failed to send response");
                }
            }
        });
        Ok(())
    }

    /// Liveness sweep: drop map entries whose receive loop has observed the
    /// socket die, and tell the listener.
    fn collect_dead_connections(&self) {
        let dead: Vec<(String, Arc<ServerConn>)> = {
            let mut connections = self.connections.lock();
            let keys: Vec<String> = connections
                .iter()
                .filter(|(_, entry)| entry.dead.load(Ordering::Acquire) || entry.conn.is_closed())
                .map(|(endpoint, _)| endpoint.clone())
                .collect();
            keys.into_iter()
                .filter_map(|endpoint| {
                    connections
                        .remove(&endpoint)
                        .map(|entry| (endpoint, entry))
                })
                .collect()
        };
        for (endpoint, entry) in dead {
            tracing::debug!(%endpoint, "removing dead connection");
            let peer = entry.conn.peer();
            self.notify(move |events| events.on_disconnect(peer));
        }
    }

    fn notify<F>(&self, f: F)
    where
        F: FnOnce(&dyn SocketEventListener) + Send + 'static,
    {
        if let Some(events) = self.events.clone() {
            tokio::spawn(async move { f(events.as_ref()) });
        }
    }
}
