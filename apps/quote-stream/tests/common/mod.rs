//! Shared fixtures for the streaming integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc as link;
use futures::{SinkExt, StreamExt, future};
use parking_lot::Mutex;
use quote_stream::application::ports::{Link, Transport};
use quote_stream::{Frame, ProviderId, StreamSettings, TransportError};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// How long to wait for something that should happen.
pub const WAIT: Duration = Duration::from_secs(2);

/// How long to wait before concluding nothing more is coming.
pub const QUIET: Duration = Duration::from_millis(100);

/// Every frame a client wrote to one link, in order.
pub type SentLog = Arc<Mutex<Vec<Frame>>>;

/// Transport whose links are driven by the test.
///
/// Every `open` hands the server end of a fresh in-memory link to the
/// test through the receiver returned by [`ScriptedTransport::new`].
pub struct ScriptedTransport {
    servers: mpsc::UnboundedSender<ServerSide>,
    opens: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerSide>) {
        let (servers, accepted) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            servers,
            opens: AtomicUsize::new(0),
        });
        (transport, accepted)
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&self, url: &str) -> Result<Link, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);

        let (inbound_tx, inbound_rx) = link::unbounded();
        let (outbound_tx, outbound_rx) = link::unbounded();
        let sent = SentLog::default();

        self.servers
            .send(ServerSide {
                url: url.to_string(),
                inbound: inbound_tx,
                outbound: outbound_rx,
                sent: Arc::clone(&sent),
            })
            .map_err(|_| TransportError::Open("test dropped the server side".to_string()))?;

        // Frames are logged as the client writes them, before the test reads them
        let sink = outbound_tx
            .sink_map_err(|_| TransportError::Closed)
            .with(move |frame: Frame| {
                sent.lock().push(frame.clone());
                future::ready(Ok::<_, TransportError>(frame))
            });

        Ok(Link {
            sink: Box::pin(sink),
            stream: Box::pin(inbound_rx),
        })
    }
}

/// The provider's end of one link. Dropping it closes the link.
pub struct ServerSide {
    pub url: String,
    inbound: link::UnboundedSender<Result<Frame, TransportError>>,
    outbound: link::UnboundedReceiver<Frame>,
    sent: SentLog,
}

impl ServerSide {
    /// Deliver a frame to the client.
    pub fn push(&self, frame: Frame) {
        self.inbound.unbounded_send(Ok(frame)).unwrap();
    }

    /// Deliver a text frame to the client.
    pub fn push_text(&self, text: &str) {
        self.push(Frame::text(text));
    }

    /// Log of everything the client has written so far.
    pub fn sent_log(&self) -> SentLog {
        Arc::clone(&self.sent)
    }

    /// Next frame the client sent.
    pub async fn next_sent(&mut self) -> Frame {
        timeout(WAIT, self.outbound.next())
            .await
            .expect("client should send a frame")
            .expect("link closed")
    }

    /// Next frame the client sent, parsed as JSON.
    pub async fn next_json(&mut self) -> Value {
        let frame = self.next_sent().await;
        serde_json::from_str(frame.as_text().expect("text frame")).unwrap()
    }

    /// Every frame the client sends until it goes quiet.
    pub async fn drain(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(Some(frame)) = timeout(QUIET, self.outbound.next()).await {
            frames.push(frame);
        }
        frames
    }

    /// Like [`drain`](Self::drain), parsing text frames as JSON.
    pub async fn drain_json(&mut self) -> Vec<Value> {
        self.drain()
            .await
            .iter()
            .filter_map(Frame::as_text)
            .map(|text| serde_json::from_str(text).unwrap())
            .collect()
    }
}

/// Wait for the next accepted link.
pub async fn accept(servers: &mut mpsc::UnboundedReceiver<ServerSide>) -> ServerSide {
    timeout(WAIT, servers.recv())
        .await
        .expect("client should open a link")
        .expect("transport dropped")
}

/// Settings with fast reconnects and keepalive off.
pub fn fast_settings() -> StreamSettings {
    let mut settings = StreamSettings::default();
    for provider in ProviderId::all() {
        let provider = settings.provider_mut(*provider);
        provider.reconnect_base_delay = Duration::from_millis(10);
        provider.keepalive_interval = Duration::ZERO;
    }
    settings
}

/// How many logged frames are JSON text equal to `expected`.
pub fn count_json(log: &SentLog, expected: &Value) -> usize {
    log.lock()
        .iter()
        .filter_map(Frame::as_text)
        .filter(|text| serde_json::from_str::<Value>(text).ok().as_ref() == Some(expected))
        .count()
}

/// Encode one tag-length-value field.
pub fn tlv(tag: u8, value: &[u8]) -> Vec<u8> {
    let len = u16::try_from(value.len()).unwrap();
    let mut field = vec![tag];
    field.extend_from_slice(&len.to_le_bytes());
    field.extend_from_slice(value);
    field
}
