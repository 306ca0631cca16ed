//! Relay link transport.
//!
//! A relay link is the single connection a mesh keeps to its relay. Links are
//! created through a [`RelayConnector`] and report everything that happens to
//! them through a [`LinkSink`]: first `Open`, then any number of `Message`s,
//! and finally `Error` and/or `Close`.
//!
//! The WebSocket connector runs each link as one tokio task that owns both
//! halves of the socket, so inbound frames reach the sink in arrival order.

use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Something that happened on a relay link
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Link is connected
    Open,
    /// Text frame received
    Message(String),
    /// Link is gone
    Close,
    /// Transport fault
    Error(String),
}

/// Receiver of link events. Called from the link's I/O task; must not block.
pub type LinkSink = Arc<dyn Fn(LinkEvent) + Send + Sync>;

/// Handle to an established (or establishing) relay link.
pub trait RelayLink: Send + Sync {
    /// Queue a text frame. Returns `false` if the link is already gone.
    fn send(&self, text: String) -> bool;

    /// Close the link.
    fn close(&self);
}

/// Factory for relay links.
pub trait RelayConnector: Send + Sync {
    /// Start connecting to `endpoint`. Events are delivered to `sink`,
    /// possibly before this returns (an endpoint that cannot be parsed may
    /// report `Error` and `Close` right away).
    ///
    /// Must be called from within a tokio runtime.
    fn connect(&self, endpoint: &str, sink: LinkSink) -> Arc<dyn RelayLink>;
}

enum LinkCommand {
    Send(String),
    Close,
}

/// Relay links over WebSocket text frames.
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

impl WsConnector {
    /// Create a connector
    pub fn new() -> Self {
        Self
    }
}

impl RelayConnector for WsConnector {
    fn connect(&self, endpoint: &str, sink: LinkSink) -> Arc<dyn RelayLink> {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_ws_link(endpoint.to_string(), rx, sink));
        Arc::new(WsLink {
            tx,
            task: task.abort_handle(),
        })
    }
}

struct WsLink {
    tx: mpsc::UnboundedSender<LinkCommand>,
    task: AbortHandle,
}

impl RelayLink for WsLink {
    fn send(&self, text: String) -> bool {
        self.tx.send(LinkCommand::Send(text)).is_ok()
    }

    fn close(&self) {
        if self.tx.send(LinkCommand::Close).is_err() {
            self.task.abort();
        }
    }
}

async fn run_ws_link(
    endpoint: String,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
    sink: LinkSink,
) {
    let stream = match connect_async(endpoint.as_str()).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            warn!("Failed to connect to relay {}: {}", endpoint, e);
            sink(LinkEvent::Error(e.to_string()));
            sink(LinkEvent::Close);
            return;
        }
    };

    info!("Relay connection open: {}", endpoint);
    sink(LinkEvent::Open);

    let (mut write, mut read) = stream.split();
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(LinkCommand::Send(text)) => {
                    if let Err(e) = write.send(Message::Text(text)).await {
                        warn!("Relay write failed: {}", e);
                        sink(LinkEvent::Error(e.to_string()));
                        break;
                    }
                }
                Some(LinkCommand::Close) | None => {
                    debug!("Closing relay connection {}", endpoint);
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            },
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => sink(LinkEvent::Message(text)),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => sink(LinkEvent::Message(text)),
                    Err(_) => warn!("Dropping non-utf8 binary frame from relay"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Relay read failed: {}", e);
                    sink(LinkEvent::Error(e.to_string()));
                    break;
                }
            }
        }
    }

    info!("Relay connection closed: {}", endpoint);
    sink(LinkEvent::Close);
}
