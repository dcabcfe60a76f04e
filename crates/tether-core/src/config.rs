//! Client and server configuration.

use std::time::Duration;

use crate::frame::DEFAULT_MAX_FRAME_BYTES;

pub const DEFAULT_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_RECEIVE_BUFFER_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Peer host. An IP address or a resolvable name.
    pub address: String,
    pub port: u16,
    /// Scratch-buffer size for the receive loop. Clamped to at least the
    /// frame header size.
    pub receive_buffer_size: usize,
    /// How often the timeout scanner sweeps the pending-call table.
    pub scanner_period: Duration,
    /// Delay before the scanner's first sweep.
    pub scanner_initial_delay: Duration,
    /// Cap on a single frame body, both directions. Exceeding it closes the
    /// connection.
    pub max_frame_bytes: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
            scanner_period: Duration::from_millis(1000),
            scanner_initial_delay: Duration::from_millis(3000),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl ClientConfig {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Local IP address to bind.
    pub address: String,
    pub port: u16,
    pub listen_backlog: u32,
    /// Scratch-buffer size for each connection's receive loop.
    pub receive_buffer_size: usize,
    /// How often dead connections are collected from the connection map.
    pub liveness_period: Duration,
    /// Cap on a single frame body, both directions.
    pub max_frame_bytes: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            listen_backlog: 1024,
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
            liveness_period: Duration::from_millis(3000),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl ServerConfig {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}
