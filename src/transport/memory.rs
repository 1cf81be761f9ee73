//! In-process loopback transport
//!
//! Every [`MemoryConnector::open`] hands a fresh [`RemotePeer`] to whoever
//! holds the peer receiver. The peer plays the remote service: it reads the
//! frames the client writes and pushes frames back.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{Connector, Transport};
use crate::error::{CoreError, Result};

/// Connector producing loopback transports
#[derive(Clone)]
pub struct MemoryConnector {
    peers: mpsc::UnboundedSender<RemotePeer>,
    refusing: Arc<AtomicBool>,
}

impl MemoryConnector {
    /// Create a connector and the stream of remote peers it will produce
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RemotePeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        (
            Self {
                peers,
                refusing: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    /// Make subsequent `open` calls fail as if the endpoint were down
    pub fn refuse_connections(&self, refuse: bool) {
        self.refusing.store(refuse, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self) -> Result<Box<dyn Transport>> {
        if self.refusing.load(Ordering::SeqCst) {
            return Err(CoreError::Transport("connection refused".to_string()));
        }

        let (to_client, client_inbound) = mpsc::unbounded_channel();
        let (client_outbound, from_client) = mpsc::unbounded_channel();

        self.peers
            .send(RemotePeer {
                to_client: Some(to_client),
                from_client,
            })
            .map_err(|_| CoreError::Transport("no remote listening".to_string()))?;

        Ok(Box::new(MemoryTransport {
            outbound: Some(client_outbound),
            inbound: client_inbound,
        }))
    }

    fn endpoint(&self) -> String {
        "memory://loopback".to_string()
    }
}

/// Client half of a loopback pair
pub struct MemoryTransport {
    outbound: Option<mpsc::UnboundedSender<String>>,
    inbound: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&mut self, frame: String) -> Result<()> {
        let tx = self.outbound.as_ref().ok_or(CoreError::ConnectionLost)?;
        tx.send(frame)
            .map_err(|_| CoreError::Transport("remote closed".to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.outbound = None;
        self.inbound.close();
    }
}

/// Remote half of a loopback pair
pub struct RemotePeer {
    to_client: Option<mpsc::UnboundedSender<String>>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl RemotePeer {
    /// Push a raw frame to the client; false once the client is gone
    pub fn send(&self, frame: impl Into<String>) -> bool {
        match &self.to_client {
            Some(tx) => tx.send(frame.into()).is_ok(),
            None => false,
        }
    }

    /// Push a JSON frame to the client
    pub fn send_json(&self, frame: &Value) -> bool {
        self.send(frame.to_string())
    }

    /// Next frame written by the client; `None` once it closed
    pub async fn recv(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    /// Next frame written by the client, parsed as JSON
    pub async fn recv_json(&mut self) -> Option<Value> {
        let frame = self.recv().await?;
        serde_json::from_str(&frame).ok()
    }

    /// Close the remote side; the client sees end of stream
    pub fn close(&mut self) {
        self.to_client = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_loopback_roundtrip() {
        let (connector, mut peers) = MemoryConnector::new();
        let mut transport = connector.open().await.unwrap();
        let mut peer = peers.recv().await.unwrap();

        transport.send(r#"{"id":1,"type":"ping"}"#.to_string()).await.unwrap();
        assert_eq!(peer.recv_json().await.unwrap(), json!({"id": 1, "type": "ping"}));

        assert!(peer.send_json(&json!({"id": 1, "type": "pong"})));
        let frame = transport.recv().await.unwrap().unwrap();
        assert!(frame.contains("pong"));

        peer.close();
        assert!(transport.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_refused_connections() {
        let (connector, _peers) = MemoryConnector::new();
        connector.refuse_connections(true);
        assert!(matches!(connector.open().await, Err(CoreError::Transport(_))));

        connector.refuse_connections(false);
        assert!(connector.open().await.is_ok());
    }

    #[tokio::test]
    async fn test_client_close_ends_remote_stream() {
        let (connector, mut peers) = MemoryConnector::new();
        let mut transport = connector.open().await.unwrap();
        let mut peer = peers.recv().await.unwrap();

        transport.close().await;
        assert!(peer.recv().await.is_none());
        assert!(transport.send("late".to_string()).await.is_err());
    }
}
