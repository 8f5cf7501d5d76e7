//! WebSocket Transport
//!
//! [`Transport`] adapter over `tokio-tungstenite`. TLS uses rustls with the
//! webpki root store; the process installs the ring crypto provider at
//! startup.

use async_trait::async_trait;
use futures::future;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::application::ports::{Frame, Link, Transport, TransportError};

/// Opens WebSocket links.
#[derive(Debug, Default, Clone)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    /// Create a new transport.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, url: &str) -> Result<Link, TransportError> {
        tracing::debug!(url = %redact_query(url), "Opening WebSocket");

        let (ws_stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Open(e.to_string()))?;

        let (write, read) = ws_stream.split();

        let sink = write
            .sink_map_err(|e| TransportError::Socket(e.to_string()))
            .with(|frame: Frame| future::ready(Ok::<_, TransportError>(to_message(frame))));

        let stream = read.filter_map(|msg| future::ready(from_message(msg)));

        Ok(Link {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Binary(bytes) => Message::Binary(bytes.into()),
        Frame::Ping(bytes) => Message::Ping(bytes.into()),
        Frame::Pong(bytes) => Message::Pong(bytes.into()),
    }
}

fn from_message(msg: Result<Message, WsError>) -> Option<Result<Frame, TransportError>> {
    match msg {
        Ok(Message::Text(text)) => Some(Ok(Frame::Text(text.to_string()))),
        Ok(Message::Binary(bytes)) => Some(Ok(Frame::Binary(bytes.to_vec()))),
        Ok(Message::Ping(bytes)) => Some(Ok(Frame::Ping(bytes.to_vec()))),
        Ok(Message::Pong(bytes)) => Some(Ok(Frame::Pong(bytes.to_vec()))),
        Ok(Message::Close(close)) => {
            tracing::info!(frame = ?close, "Server sent close frame");
            Some(Err(TransportError::Closed))
        }
        Ok(Message::Frame(_)) => None,
        Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Some(Err(TransportError::Closed)),
        Err(e) => Some(Err(TransportError::Socket(e.to_string()))),
    }
}

/// Strip the query string so tokens never reach the logs.
fn redact_query(url: &str) -> &str {
    url.split_once('?').map_or(url, |(base, _)| base)
}
