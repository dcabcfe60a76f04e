//! Echo server example.
//!
//! Registers a handler for code 1 that echoes the request payload, and a
//! one-way counter on code 2.
//!
//! Run the server: `cargo run --example echo_server -p tether`
//! Then run the client (see echo_client example).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tether::{Response, Server, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tether=debug".into()),
        )
        .init();

    let config = ServerConfig {
        port: 9000,
        ..Default::default()
    };
    let server = Server::bind(config).await?;
    println!("Echo server listening on {}", server.local_addr());

    server.register_fn(1, |_ctx, request| async move {
        println!("  echo({} bytes) from seq {}", request.payload.len(), request.sequence);
        Some(Response {
            sequence: request.sequence,
            code: 0,
            payload: request.payload,
        })
    });

    let pings = Arc::new(AtomicUsize::new(0));
    server.register_fn(2, move |_ctx, _request| {
        let pings = pings.clone();
        async move {
            let n = pings.fetch_add(1, Ordering::SeqCst) + 1;
            println!("  ping #{n}");
            None
        }
    });

    tokio::signal::ctrl_c().await?;
    server.shutdown().await;
    println!("Done!");
    Ok(())
}
