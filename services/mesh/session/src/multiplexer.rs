//! One relay connection shared by every relay channel of a mesh.
//!
//! The multiplexer owns the link, keys registered channels by the remote
//! peer id and mirrors the link state onto every registered channel. Inbound
//! envelopes are routed to the channel registered for the sender; relay
//! control messages arrive "from" the local peer and therefore land on the
//! local peer's own channel.

use crate::channel::{Channel, ChannelEvent, ChannelState, Incoming};
use crate::relay::RelayChannel;
use crate::transport::{LinkEvent, LinkSink, RelayConnector, RelayLink};
use mesh_wire::event::CONNECT;
use mesh_wire::{InboundEnvelope, NodeId, OutboundEnvelope};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

struct MuxInner {
    state: ChannelState,
    endpoint: Option<String>,
    channels: HashMap<Option<NodeId>, Arc<RelayChannel>>,
    link: Option<Arc<dyn RelayLink>>,
    // Bumped whenever a link is replaced so late events from an old link are ignored.
    generation: u64,
    // Events the connector reported before `connect` returned its link.
    pending: Option<Vec<LinkEvent>>,
}

/// Relay connection multiplexer. One per mesh.
pub struct Multiplexer {
    connector: Arc<dyn RelayConnector>,
    inner: Mutex<MuxInner>,
    me: Weak<Multiplexer>,
}

impl Multiplexer {
    /// Create a closed multiplexer that will connect through `connector`.
    pub fn new(connector: Arc<dyn RelayConnector>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            connector,
            inner: Mutex::new(MuxInner {
                state: ChannelState::Closed,
                endpoint: None,
                channels: HashMap::new(),
                link: None,
                generation: 0,
                pending: None,
            }),
            me: me.clone(),
        })
    }

    /// Set the relay endpoint used by the next [`open`](Self::open).
    pub fn set_endpoint(&self, endpoint: impl Into<String>) {
        self.inner.lock().endpoint = Some(endpoint.into());
    }

    /// Configured relay endpoint
    pub fn endpoint(&self) -> Option<String> {
        self.inner.lock().endpoint.clone()
    }

    /// Connection state
    pub fn state(&self) -> ChannelState {
        self.inner.lock().state
    }

    /// Whether a channel is registered under `id`
    pub fn is_registered(&self, id: &Option<NodeId>) -> bool {
        self.inner.lock().channels.contains_key(id)
    }

    /// Number of registered channels
    pub fn channel_count(&self) -> usize {
        self.inner.lock().channels.len()
    }

    /// Register `channel` under its remote id.
    ///
    /// The channel immediately takes the connection state; if the connection
    /// is already open it also receives an `open` event. Returns `false` when
    /// another channel already holds that id.
    pub fn register(&self, channel: &Arc<RelayChannel>) -> bool {
        let key = channel.remote().id();
        let state = {
            let mut inner = self.inner.lock();
            if inner.channels.contains_key(&key) {
                return false;
            }
            inner.channels.insert(key.clone(), channel.clone());
            inner.state
        };
        debug!("Registered relay channel for {:?} in state {:?}", key, state);

        channel.set_state(state);
        if state == ChannelState::Open {
            channel.emit(ChannelEvent::Open);
        }
        true
    }

    /// Remove `channel` and mark it closed.
    ///
    /// Unregistering the local peer's own channel tears down the connection
    /// for every other channel as well.
    pub fn unregister(&self, channel: &Arc<RelayChannel>) {
        {
            let mut inner = self.inner.lock();
            let key = inner
                .channels
                .iter()
                .find(|(_, c)| Arc::ptr_eq(c, channel))
                .map(|(k, _)| k.clone());
            if let Some(key) = key {
                inner.channels.remove(&key);
                debug!("Unregistered relay channel for {:?}", key);
            }
        }
        channel.set_state(ChannelState::Closed);

        if channel.remote().is_local() {
            self.shutdown();
        }
    }

    /// Connect the relay link. No-op unless the connection is closed.
    ///
    /// The connector runs without the lock held. Events it reports before
    /// returning are queued and replayed once the link is stored.
    pub fn open(&self) {
        let (endpoint, generation, channels) = {
            let mut inner = self.inner.lock();
            if inner.state != ChannelState::Closed {
                return;
            }
            let Some(endpoint) = inner.endpoint.clone() else {
                warn!("Multiplexer has no relay endpoint configured");
                return;
            };
            inner.state = ChannelState::Opening;
            inner.generation += 1;
            inner.pending = Some(Vec::new());
            let channels: Vec<Arc<RelayChannel>> = inner.channels.values().cloned().collect();
            (endpoint, inner.generation, channels)
        };
        info!("Opening relay connection to {}", endpoint);

        for channel in channels {
            channel.set_state(ChannelState::Opening);
        }

        let link = self.connector.connect(&endpoint, self.sink(generation));
        let queued = {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                None
            } else {
                inner.link = Some(link.clone());
                inner.pending.replace(Vec::new())
            }
        };
        match queued {
            Some(events) => self.drain(generation, events),
            None => {
                debug!("Relay connection to {} was shut down while connecting", endpoint);
                link.close();
            }
        }
    }

    // Replays queued events until none arrive in between.
    fn drain(&self, generation: u64, mut events: Vec<LinkEvent>) {
        loop {
            for event in events {
                if self.inner.lock().generation != generation {
                    return;
                }
                self.dispatch(event);
            }
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                return;
            }
            match inner.pending.as_mut() {
                Some(queue) if !queue.is_empty() => events = std::mem::take(queue),
                _ => {
                    inner.pending = None;
                    return;
                }
            }
        }
    }

    /// Tear down the connection and close every registered channel.
    pub fn shutdown(&self) {
        let (link, channels) = {
            let mut inner = self.inner.lock();
            let link = inner.link.take();
            if link.is_none() && inner.state == ChannelState::Closed {
                return;
            }
            inner.generation += 1;
            inner.state = ChannelState::Closed;
            inner.pending = None;
            let channels: Vec<Arc<RelayChannel>> = inner.channels.values().cloned().collect();
            (link, channels)
        };
        info!("Shutting down relay connection");

        if let Some(link) = link {
            link.close();
        }
        for channel in channels {
            channel.set_state(ChannelState::Closed);
            channel.emit(ChannelEvent::Close);
        }
    }

    /// Forget every registered channel, marking each closed.
    pub fn clear(&self) -> usize {
        let channels: Vec<Arc<RelayChannel>> =
            self.inner.lock().channels.drain().map(|(_, c)| c).collect();
        for channel in &channels {
            channel.set_state(ChannelState::Closed);
        }
        channels.len()
    }

    /// Send `message` to `target` over the relay.
    pub fn send(&self, target: &NodeId, message: &str) -> bool {
        let link = {
            let inner = self.inner.lock();
            if inner.state != ChannelState::Open {
                return false;
            }
            match &inner.link {
                Some(link) => link.clone(),
                None => return false,
            }
        };
        match OutboundEnvelope::to(target.clone(), message).encode() {
            Ok(text) => link.send(text),
            Err(e) => {
                warn!("Failed to encode relay envelope: {}", e);
                false
            }
        }
    }

    fn sink(&self, generation: u64) -> LinkSink {
        let me = self.me.clone();
        Arc::new(move |event| {
            if let Some(mux) = me.upgrade() {
                mux.handle_link_event(generation, event);
            }
        })
    }

    fn handle_link_event(&self, generation: u64, event: LinkEvent) {
        {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                debug!("Ignoring event from stale relay link: {:?}", event);
                return;
            }
            if let Some(queue) = inner.pending.as_mut() {
                queue.push(event);
                return;
            }
        }
        self.dispatch(event);
    }

    fn dispatch(&self, event: LinkEvent) {
        match event {
            LinkEvent::Open => self.on_open(),
            LinkEvent::Message(text) => self.on_message(&text),
            LinkEvent::Close => self.on_down(ChannelEvent::Close),
            LinkEvent::Error(e) => {
                warn!("Relay connection error: {}", e);
                self.on_down(ChannelEvent::Error(e));
            }
        }
    }

    fn on_open(&self) {
        let channels: Vec<Arc<RelayChannel>> = {
            let mut inner = self.inner.lock();
            inner.state = ChannelState::Open;
            inner.channels.values().cloned().collect()
        };
        info!("Relay connection open, {} channel(s) registered", channels.len());
        for channel in channels {
            channel.set_state(ChannelState::Open);
            channel.emit(ChannelEvent::Open);
        }
    }

    fn on_message(&self, text: &str) {
        let envelope = match InboundEnvelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping malformed relay frame: {}", e);
                return;
            }
        };

        let target = {
            let mut inner = self.inner.lock();
            if envelope.payload_kind().as_deref() == Some(CONNECT) {
                // The local peer learns its id from the relay handshake.
                if let Some(anonymous) = inner.channels.remove(&None) {
                    if anonymous.remote().is_local() {
                        anonymous.remote().assign_id(envelope.from.clone());
                    }
                    info!("Local peer assigned id {}", envelope.from);
                    inner.channels.insert(Some(envelope.from.clone()), anonymous);
                }
            }
            inner.channels.get(&Some(envelope.from.clone())).cloned()
        };

        match target {
            Some(channel) => channel.emit(ChannelEvent::Message(Incoming {
                from: Some(envelope.from),
                timestamp: envelope.timestamp,
                data: envelope.payload,
            })),
            None => warn!("No relay channel registered for {}, dropping frame", envelope.from),
        }
    }

    fn on_down(&self, event: ChannelEvent) {
        let channels: Vec<Arc<RelayChannel>> = {
            let mut inner = self.inner.lock();
            inner.state = ChannelState::Closed;
            inner.link = None;
            inner.channels.values().cloned().collect()
        };
        for channel in channels {
            channel.set_state(ChannelState::Closed);
            channel.emit(event.clone());
        }
    }
}
