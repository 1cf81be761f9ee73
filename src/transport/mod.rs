//! Message transports
//!
//! The connection manager talks to the remote through [`Transport`] and opens
//! fresh transports through [`Connector`] on every (re)connect.
//!
//! - `websocket`: tokio-tungstenite client used in production
//! - `memory`: in-process loopback where a local peer plays the remote end

pub mod memory;
pub mod websocket;

use async_trait::async_trait;

use crate::error::Result;

pub use memory::{MemoryConnector, MemoryTransport, RemotePeer};
pub use websocket::{websocket_url, WebSocketConnector, WebSocketTransport};

/// Framed, bidirectional text-message channel
#[async_trait]
pub trait Transport: Send {
    /// Write one frame
    async fn send(&mut self, frame: String) -> Result<()>;

    /// Next inbound text frame; `None` once the peer has closed.
    ///
    /// Must be cancel safe: the manager polls it inside `select!`.
    async fn recv(&mut self) -> Option<Result<String>>;

    /// Best-effort close
    async fn close(&mut self);
}

/// Opens new transports to the remote endpoint
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self) -> Result<Box<dyn Transport>>;

    /// Endpoint description for logs
    fn endpoint(&self) -> String;
}
