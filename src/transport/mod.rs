//! Transport layer consumed by the protocol engine
//!
//! Supports:
//! - Serial ports (RS-232, RS-485, USB-Serial)
//! - In-memory loopback for tests and simulation
//!
//! A transport delivers inbound bytes as [`TransportEvent`]s on a broadcast
//! channel. Within one transport, `Data` events preserve the order in which
//! bytes arrived on the link; dropping a receiver tears the subscription
//! down, which is how cancelled exchanges release their listeners.

mod mock;
mod serial;

pub use mock::{MockHandle, MockTransport};
pub use serial::{list_ports, SerialConfig, SerialFlowControl, SerialParity, SerialTransport};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::broadcast;

/// Events emitted on a transport's subscription channel
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A chunk of bytes received from the link
    Data(Bytes),
    /// The link closed normally
    Closed,
    /// The link failed; the message describes the underlying error
    Error(String),
}

/// Transport error types
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Port not found
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Not connected
    #[error("Not connected")]
    NotConnected,

    /// Send error
    #[error("Send error: {0}")]
    SendError(String),
}

/// Transport trait for all connection types
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to the target
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Disconnect from the target
    async fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Check if connected
    fn is_connected(&self) -> bool;

    /// Send data
    async fn send(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Subscribe to transport events
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    /// Get connection info string
    fn connection_info(&self) -> String;
}
