//! Echo client example.
//!
//! First start the server: `cargo run --example echo_server -p tether`
//! Then run the client: `cargo run --example echo_client -p tether`

use std::time::Duration;

use bytes::Bytes;
use tether::{Client, ClientConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ClientConfig {
        port: 9000,
        ..Default::default()
    };
    println!("Connecting to {}...", config.endpoint());
    let client = Client::connect(config).await?;
    println!("Connected!");

    println!("\nCalling echo with \"hello tether\"...");
    let response = client
        .call(1, Bytes::from_static(b"hello tether"), Duration::from_secs(1))
        .await?;
    println!("  Result: {:?}", String::from_utf8_lossy(&response.payload));

    println!("\nSending 3 one-way pings...");
    for _ in 0..3 {
        client.notify(2, Bytes::new()).await?;
    }

    println!("\nSubmitting a detached call...");
    let reply = client
        .submit(1, Bytes::from_static(b"detached"), Duration::from_secs(1))
        .await?;
    let response = reply.wait().await?;
    println!("  Result: {:?}", String::from_utf8_lossy(&response.payload));

    client.shutdown().await;
    println!("\nDone!");
    Ok(())
}
