//! Transport seam.
//!
//! The orchestrator needs a bidirectional, reliable, ordered, message-framed
//! channel; anything matching [`Transport`] works. Production uses a
//! WebSocket; tests drive the protocol over in-process channels.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use evolu_core::EvoluError;

/// One open framed channel to a peer.
#[async_trait]
pub trait Transport: Send {
    /// Send one frame (already padded and length-prefixed).
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), EvoluError>;

    /// Receive the next frame.
    async fn recv(&mut self) -> Result<Vec<u8>, EvoluError>;

    /// Close the channel; errors on close are not interesting.
    async fn close(&mut self);
}

/// Opens fresh transports; the orchestrator reconnects through this after
/// failures.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new channel.
    async fn connect(&self) -> Result<Box<dyn Transport>, EvoluError>;
}

/// WebSocket client transport.
pub struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WebSocketTransport {
    /// Dial a relay endpoint (`ws://` or `wss://`).
    pub async fn dial(url: &str) -> Result<Self, EvoluError> {
        let (stream, response) = connect_async(url)
            .await
            .map_err(|e| EvoluError::transport(e.to_string()))?;
        debug!(url, status = %response.status(), "websocket connected");
        Ok(Self { stream })
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), EvoluError> {
        self.stream
            .send(WsMessage::Binary(frame))
            .await
            .map_err(|e| EvoluError::transport(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Vec<u8>, EvoluError> {
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Binary(bytes))) => return Ok(bytes),
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => continue,
                Some(Ok(WsMessage::Close(_))) | None => {
                    return Err(EvoluError::transport("connection closed"))
                }
                Some(Ok(other)) => {
                    return Err(EvoluError::transport(format!(
                        "unexpected websocket message: {other:?}"
                    )))
                }
                Some(Err(e)) => return Err(EvoluError::transport(e.to_string())),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

/// Connector dialing a fixed URL.
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    /// Connector for a relay endpoint.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Connector for the configured relay.
    pub fn from_config(config: &evolu_core::Config) -> Self {
        Self::new(config.sync_url.clone())
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, EvoluError> {
        Ok(Box::new(WebSocketTransport::dial(&self.url).await?))
    }
}

/// In-process transport over tokio channels, for tests and local
/// peer-to-peer sync.
pub struct ChannelTransport {
    /// Outgoing frames.
    pub tx: tokio::sync::mpsc::Sender<Vec<u8>>,
    /// Incoming frames.
    pub rx: tokio::sync::mpsc::Receiver<Vec<u8>>,
}

impl ChannelTransport {
    /// A connected pair of endpoints.
    pub fn pair(buffer: usize) -> (Self, Self) {
        let (a_tx, b_rx) = tokio::sync::mpsc::channel(buffer);
        let (b_tx, a_rx) = tokio::sync::mpsc::channel(buffer);
        (
            Self { tx: a_tx, rx: a_rx },
            Self { tx: b_tx, rx: b_rx },
        )
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), EvoluError> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| EvoluError::transport("peer hung up"))
    }

    async fn recv(&mut self) -> Result<Vec<u8>, EvoluError> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| EvoluError::transport("peer hung up"))
    }

    async fn close(&mut self) {
        self.rx.close();
    }
}
