//! WebSocket transport (tokio-tungstenite)

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};
use url::Url;

use super::{Connector, Transport};
use crate::error::{CoreError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WEBSOCKET_PATH: &str = "/api/websocket";

/// Turn a Home Assistant base URL into its WebSocket endpoint.
///
/// `http://host:8123` becomes `ws://host:8123/api/websocket`; explicit
/// `ws://`/`wss://` URLs are used as given.
pub fn websocket_url(base_url: &str) -> Result<String> {
    let mut url = Url::parse(base_url.trim())
        .map_err(|e| CoreError::Config(format!("invalid URL '{}': {}", base_url, e)))?;

    let scheme = match url.scheme() {
        "ws" | "wss" => return Ok(url.to_string()),
        "http" => "ws",
        "https" => "wss",
        other => {
            return Err(CoreError::Config(format!(
                "unsupported URL scheme '{}'",
                other
            )))
        }
    };

    url.set_scheme(scheme)
        .map_err(|_| CoreError::Config(format!("cannot use scheme {} for {}", scheme, base_url)))?;
    let path = format!("{}{}", url.path().trim_end_matches('/'), WEBSOCKET_PATH);
    url.set_path(&path);
    Ok(url.to_string())
}

/// Connector dialing a fixed WebSocket endpoint
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            url: websocket_url(base_url)?,
        })
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self) -> Result<Box<dyn Transport>> {
        debug!("Opening WebSocket to {}", self.url);
        let (stream, response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| CoreError::Transport(format!("connect to {} failed: {}", self.url, e)))?;
        info!("WebSocket established ({})", response.status());
        Ok(Box::new(WebSocketTransport { stream }))
    }

    fn endpoint(&self) -> String {
        self.url.clone()
    }
}

/// One open WebSocket
pub struct WebSocketTransport {
    stream: WsStream,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, frame: String) -> Result<()> {
        self.stream
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| CoreError::Transport(format!("send failed: {}", e)))
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.as_str().to_owned())),
                Ok(Message::Binary(data)) => {
                    return Some(String::from_utf8(data.to_vec()).map_err(|e| {
                        CoreError::Protocol(format!("binary frame is not UTF-8: {}", e))
                    }))
                }
                Ok(Message::Ping(payload)) => {
                    if let Err(e) = self.stream.send(Message::Pong(payload)).await {
                        return Some(Err(CoreError::Transport(format!("pong failed: {}", e))));
                    }
                }
                Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
                Ok(Message::Close(frame)) => {
                    debug!("Remote closed WebSocket: {:?}", frame);
                    return None;
                }
                Err(e) => return Some(Err(CoreError::Transport(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!("WebSocket close failed: {}", e);
        }
    }
}
