//! In-process relay links.
//!
//! [`MemoryRelay`] implements [`RelayConnector`] against a [`RelayHub`]
//! directly, so several meshes in one process can talk without sockets.

use crate::hub::RelayHub;
use mesh_session::{LinkEvent, LinkSink, RelayConnector, RelayLink};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

enum LinkCommand {
    Send(String),
    Close,
}

/// Relay connector backed by an in-process hub.
#[derive(Debug, Clone, Default)]
pub struct MemoryRelay {
    hub: Arc<RelayHub>,
}

impl MemoryRelay {
    /// Connector for `hub`
    pub fn new(hub: Arc<RelayHub>) -> Self {
        Self { hub }
    }

    /// The hub links join
    pub fn hub(&self) -> &Arc<RelayHub> {
        &self.hub
    }
}

/// Room for an endpoint: the URL path when it parses, the raw string otherwise.
pub(crate) fn room_for_endpoint(endpoint: &str) -> String {
    match Url::parse(endpoint) {
        Ok(url) => RelayHub::room_for_path(url.path()),
        Err(_) => RelayHub::room_for_path(endpoint),
    }
}

impl RelayConnector for MemoryRelay {
    fn connect(&self, endpoint: &str, sink: LinkSink) -> Arc<dyn RelayLink> {
        let (tx, rx) = mpsc::unbounded_channel();
        let room = room_for_endpoint(endpoint);
        tokio::spawn(run_memory_link(self.hub.clone(), room, rx, sink));
        Arc::new(MemoryLink { tx })
    }
}

struct MemoryLink {
    tx: mpsc::UnboundedSender<LinkCommand>,
}

impl RelayLink for MemoryLink {
    fn send(&self, text: String) -> bool {
        self.tx.send(LinkCommand::Send(text)).is_ok()
    }

    fn close(&self) {
        let _ = self.tx.send(LinkCommand::Close);
    }
}

async fn run_memory_link(
    hub: Arc<RelayHub>,
    room: String,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
    sink: LinkSink,
) {
    sink(LinkEvent::Open);

    let (outbox, mut inbox) = mpsc::unbounded_channel();
    let id = hub.enter(&room, outbox);

    loop {
        tokio::select! {
            frame = inbox.recv() => match frame {
                Some(text) => sink(LinkEvent::Message(text)),
                None => break,
            },
            command = commands.recv() => match command {
                Some(LinkCommand::Send(text)) => hub.route(&room, &id, &text),
                Some(LinkCommand::Close) | None => break,
            }
        }
    }

    debug!("Memory link {} leaving room '{}'", id, room);
    hub.leave(&room, &id);
    sink(LinkEvent::Close);
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_wire::InboundEnvelope;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn recorder() -> (LinkSink, Arc<Mutex<Vec<LinkEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink_events = events.clone();
        let sink: LinkSink = Arc::new(move |event| sink_events.lock().push(event));
        (sink, events)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[test]
    fn test_room_for_endpoint() {
        assert_eq!(room_for_endpoint("ws://relay.example/room1"), "room1");
        assert_eq!(room_for_endpoint("lobby"), "lobby");
    }

    #[tokio::test]
    async fn test_links_exchange_frames() {
        let relay = MemoryRelay::default();
        let (sink_a, events_a) = recorder();
        let (sink_b, events_b) = recorder();

        let a = relay.connect("ws://relay/room", sink_a);
        settle().await;
        let b = relay.connect("ws://relay/room", sink_b);
        settle().await;
        assert_eq!(relay.hub().members("room"), 2);

        // b learned a's id from its connect message
        let connect = match &events_b.lock()[1] {
            LinkEvent::Message(text) => InboundEnvelope::decode(text).unwrap(),
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(connect.payload, r#"["connect",1]"#);

        assert!(b.send(r#"[[1], "[\"ping\"]"]"#.to_string()));
        settle().await;
        let last = events_a.lock().last().cloned();
        match last {
            Some(LinkEvent::Message(text)) => {
                let envelope = InboundEnvelope::decode(&text).unwrap();
                assert_eq!(envelope.from, 2.into());
                assert_eq!(envelope.payload, r#"["ping"]"#);
            }
            other => panic!("unexpected {:?}", other),
        }

        a.close();
        settle().await;
        assert_eq!(events_a.lock().last(), Some(&LinkEvent::Close));
        assert_eq!(relay.hub().members("room"), 1);
    }
}
