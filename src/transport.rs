//! Realtime transport seam.
//!
//! DESIGN
//! ======
//! The sync client never touches a socket directly. A [`Connector`] performs
//! the authenticated handshake and hands back a boxed [`Transport`] that
//! moves JSON text in both directions. Production wiring uses
//! [`WsConnector`] (tokio-tungstenite); tests inject in-memory fakes.

use std::fmt;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

/// Bearer token presented at the realtime handshake and on REST calls.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    #[must_use]
    pub fn bearer(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    #[must_use]
    pub fn token(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn authorization_value(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid realtime URL: {0}")]
    InvalidUrl(String),
    #[error("handshake rejected with HTTP {status}")]
    Rejected { status: u16 },
    #[error("websocket handshake failed: {0}")]
    Handshake(Box<tungstenite::Error>),
    #[error("websocket send failed: {0}")]
    Send(Box<tungstenite::Error>),
    #[error("websocket receive failed: {0}")]
    Recv(Box<tungstenite::Error>),
    #[error("transport closed")]
    Closed,
}

/// A live, authenticated, bidirectional text channel.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Next inbound text message. `None` once the peer has closed.
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;

    async fn close(&mut self);
}

/// Opens transports. One call per connection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, credential: &Credential) -> Result<Box<dyn Transport>, TransportError>;
}

// =============================================================================
// WEBSOCKET
// =============================================================================

/// Connects to the realtime endpoint over WebSocket, sending the credential
/// as an `Authorization: Bearer` header on the upgrade request.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, credential: &Credential) -> Result<Box<dyn Transport>, TransportError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|_| TransportError::InvalidUrl(self.url.clone()))?;
        let auth = HeaderValue::from_str(&credential.authorization_value())
            .map_err(|_| TransportError::InvalidUrl(self.url.clone()))?;
        request.headers_mut().insert(AUTHORIZATION, auth);

        let (stream, _) = connect_async(request).await.map_err(|error| match error {
            tungstenite::Error::Http(response) => TransportError::Rejected { status: response.status().as_u16() },
            other => TransportError::Handshake(Box::new(other)),
        })?;
        Ok(Box::new(WsTransport { stream }))
    }
}

struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::Send(Box::new(e)))
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => return None,
                Err(e) => return Some(Err(TransportError::Recv(Box::new(e)))),
            };
            match message {
                Message::Text(text) => return Some(Ok(text.as_str().to_owned())),
                Message::Close(_) => return None,
                // Ping replies are queued by tungstenite itself.
                Message::Binary(_) | Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

#[cfg(test)]
#[path = "transport_test.rs"]
mod tests;
