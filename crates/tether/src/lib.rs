//! tether: length-prefixed asynchronous TCP remoting.
//!
//! A symmetric client/server pair: a caller invokes a numbered request code
//! on a remote peer and receives a correlated response over a single framed
//! TCP connection.
//!
//! # Quick start
//!
//! ```ignore
//! use std::time::Duration;
//! use bytes::Bytes;
//! use tether::{Client, ClientConfig, Response, Server, ServerConfig};
//!
//! // Server: register a handler for code 1 and start listening.
//! let server = Server::bind(ServerConfig::default()).await?;
//! server.register_fn(1, |_ctx, request| async move {
//!     Some(Response {
//!         sequence: request.sequence,
//!         code: 0,
//!         payload: request.payload,
//!     })
//! });
//!
//! // Client: three invocation modes over one connection.
//! let client = Client::connect(ClientConfig::default()).await?;
//!
//! // Bounded wait.
//! let echoed = client.call(1, Bytes::from_static(b"hello"), Duration::from_secs(1)).await?;
//!
//! // Detached: resolve the reply later.
//! let reply = client.submit(1, Bytes::from_static(b"again"), Duration::from_secs(1)).await?;
//! let echoed = reply.wait().await?;
//!
//! // Fire-and-forget.
//! client.notify(2, Bytes::new()).await?;
//! ```
//!
//! # Lifecycle guarantees
//!
//! Every non-one-way invocation finishes in exactly one of three ways: the
//! correlated response, a timeout, or a send failure. The pending-call table
//! arbitrates the races between them; the timeout scanner unblocks callers
//! whose peer never answers; shutdown fails all outstanding calls so nothing
//! waits forever.

#![forbid(unsafe_code)]

mod client;
mod server;

pub use client::{Client, PendingReply};
pub use server::{
    handler_fn, Handler, HandlerFuture, RequestContext, Server, SocketEventListener,
};

// Core surface, re-exported so most users depend on this crate alone.
pub use tether_core::{
    CallError, ClientConfig, DecodeError, FrameError, Request, Response, ScheduledTask, Scheduler,
    ServerConfig, TokioScheduler, TransportError, DEFAULT_MAX_FRAME_BYTES,
};
