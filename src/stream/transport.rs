//! Transport seam for the stream connection.
//!
//! The connection state machine only sees [`Transport`] and [`Link`], so the
//! reconnect logic runs the same against a websocket or a scripted test double.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

/// Connection drop, timeout, or I/O failure on the stream
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("connect timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection lost: {0}")]
    Io(String),

    #[error("send failed: {0}")]
    Send(String),
}

/// One inbound data frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// Opens links to a stream endpoint
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Link>, TransportError>;
}

/// An established stream link
#[async_trait]
pub trait Link: Send {
    /// Next inbound data frame; `None` once the remote has closed.
    ///
    /// Must be cancel-safe: the connection polls it inside `select!`.
    async fn recv(&mut self) -> Option<Result<Frame, TransportError>>;

    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Best-effort graceful close
    async fn close(&mut self);
}

/// Websocket transport over `tokio-tungstenite`
#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransport;

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Link>, TransportError> {
        let (stream, response) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        debug!(url = %url, status = %response.status(), "Websocket handshake complete");
        Ok(Box::new(WsLink { stream }))
    }
}

struct WsLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Link for WsLink {
    async fn recv(&mut self) -> Option<Result<Frame, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(Frame::Text(text))),
                Ok(Message::Binary(bytes)) => return Some(Ok(Frame::Binary(bytes))),
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "Websocket closed by peer");
                    return None;
                }
                // Control frames are answered by tungstenite itself
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
                Err(e) => return Some(Err(TransportError::Io(e.to_string()))),
            }
        }
    }

    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!(error = %e, "Websocket close handshake failed");
        }
    }
}
