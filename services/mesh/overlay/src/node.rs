//! A peer in the mesh, local ("self") or remote.
//!
//! A node owns the channels that reach its peer, runs the connection
//! handshake, tracks which event types the remote side is interested in and
//! turns local bind/unbind/trigger calls into wire messages.

use crate::error::MeshError;
use crate::event::{Event, EventHandler};
use crate::mesh::Mesh;
use mesh_session::{
    Channel, ChannelEvent, ChannelKind, ChannelState, DirectChannel, EventDispatcher, Handler,
    PeerIdentity, RelayChannel, Signaler, StateDrive,
};
use mesh_wire::event::{
    is_negotiation, is_protected, to_args, BIND, CLOSE, CONNECT, ENTER, ERROR, LEAVE,
    MESSAGE, OPEN, UNBIND,
};
use mesh_wire::{EventMessage, NodeId};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Connection lifecycle shared by Node, Peers and Mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NodeState {
    /// Not connected
    Disconnected = 1,
    /// Handshake in progress
    Connecting = 2,
    /// Ready; gated calls run immediately
    Connected = 3,
}

enum NodeCall {
    Bind(String, EventHandler),
    Unbind(String, Option<EventHandler>),
    Announce(String),
    Retract(String),
    Trigger(String, Vec<Value>),
}

const CHANNEL_EVENTS: [&str; 4] = [OPEN, MESSAGE, ERROR, CLOSE];

struct ChannelLink {
    channel: Arc<dyn Channel>,
    handler: Handler<ChannelEvent>,
}

/// Addressable peer within a mesh.
pub struct Node {
    identity: Arc<PeerIdentity>,
    mesh: Weak<Mesh>,
    events: EventDispatcher<Event>,
    drive: Mutex<StateDrive<NodeState, NodeCall>>,
    // highest priority last; the signaling channel is always last
    links: Mutex<Vec<ChannelLink>>,
    direct: Mutex<Option<Arc<DirectChannel>>>,
    announced: Mutex<HashSet<String>>,
    // None until the remote side announces anything
    remote_interest: Mutex<Option<HashSet<String>>>,
    me: Weak<Node>,
}

impl Node {
    pub(crate) fn new(mesh: Weak<Mesh>, identity: Arc<PeerIdentity>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            identity,
            mesh,
            events: EventDispatcher::new(),
            drive: Mutex::new(StateDrive::new(NodeState::Disconnected)),
            links: Mutex::new(Vec::new()),
            direct: Mutex::new(None),
            announced: Mutex::new(HashSet::new()),
            remote_interest: Mutex::new(None),
            me: me.clone(),
        })
    }

    /// Process-local unique handle
    pub fn uid(&self) -> u64 {
        self.identity.uid()
    }

    /// Relay-assigned id; `None` for the local node until the relay handshake
    pub fn id(&self) -> Option<NodeId> {
        self.identity.id()
    }

    /// Whether this node represents the local peer
    pub fn is_self(&self) -> bool {
        self.identity.is_local()
    }

    /// Whether the local side sends the direct transport offer
    pub fn initiator(&self) -> bool {
        self.identity.initiator()
    }

    /// Identity shared with this node's channels
    pub fn identity(&self) -> &Arc<PeerIdentity> {
        &self.identity
    }

    /// Connection state
    pub fn state(&self) -> NodeState {
        self.drive.lock().state()
    }

    /// States of this node's channels, highest priority last
    pub fn channel_states(&self) -> Vec<(ChannelKind, ChannelState)> {
        self.links
            .lock()
            .iter()
            .map(|l| (l.channel.kind(), l.channel.state()))
            .collect()
    }

    /// Whether the remote side wants events of `kind`.
    ///
    /// A peer that never announced anything is assumed to want everything.
    pub fn remote_binds_to(&self, kind: &str) -> bool {
        match &*self.remote_interest.lock() {
            None => true,
            Some(kinds) => kinds.contains(kind),
        }
    }

    /// Connect to the peer. No-op unless disconnected.
    pub fn connect(&self) {
        let released = {
            let mut drive = self.drive.lock();
            if drive.state() != NodeState::Disconnected {
                return;
            }
            drive.set_state(NodeState::Connecting)
        };
        self.replay(released);

        let (Some(mesh), Some(me)) = (self.mesh.upgrade(), self.me.upgrade()) else {
            return;
        };
        let local = mesh.self_node().identity().clone();
        let options = mesh.options();

        let signaling = RelayChannel::new(local.clone(), self.identity.clone(), mesh.multiplexer());
        let mut channels: Vec<Arc<dyn Channel>> = Vec::new();

        if !self.is_self() && options.use_webrtc {
            if let Some(connector) = mesh.peer_connector() {
                let signaler: Arc<dyn Signaler> = me.clone();
                let direct = DirectChannel::new(
                    local,
                    self.identity.clone(),
                    options.direct_config(),
                    connector,
                    Arc::downgrade(&signaler),
                );
                *self.direct.lock() = Some(direct.clone());
                channels.push(direct);
            }
        }
        channels.push(signaling.clone());

        let links: Vec<ChannelLink> = channels
            .into_iter()
            .map(|channel| {
                let node = self.me.clone();
                let handler = Handler::new(move |event: &ChannelEvent| {
                    if let Some(node) = node.upgrade() {
                        node.on_channel_event(event);
                    }
                });
                for kind in CHANNEL_EVENTS {
                    channel.events().bind(kind, handler.clone());
                }
                ChannelLink { channel, handler }
            })
            .collect();
        *self.links.lock() = links;

        let node = self.me.clone();
        signaling.events().bind(
            OPEN,
            Handler::new(move |_: &ChannelEvent| {
                if let Some(node) = node.upgrade() {
                    node.on_signaling_open();
                }
            }),
        );

        debug!("{} connecting", self);
        signaling.open();
    }

    /// Close every channel to the peer and return to `Disconnected`.
    pub fn disconnect(&self) {
        let links = std::mem::take(&mut *self.links.lock());
        for link in &links {
            for kind in CHANNEL_EVENTS {
                link.channel.events().unbind(kind, &link.handler);
            }
            link.channel.close();
        }
        *self.direct.lock() = None;
        self.announced.lock().clear();
        *self.remote_interest.lock() = None;

        let mut drive = self.drive.lock();
        let dropped = drive.clear();
        drive.set_state(NodeState::Disconnected);
        if !dropped.is_empty() {
            debug!("{} dropped {} queued call(s) on disconnect", self, dropped.len());
        }
    }

    /// Bind `handler` to events of `kind` from this node and announce the
    /// interest to the peer. Runs once the node is connected.
    pub fn bind(&self, kind: &str, handler: EventHandler) -> Result<(), MeshError> {
        check_unprotected(kind)?;
        self.submit(NodeCall::Bind(kind.to_string(), handler));
        Ok(())
    }

    /// Remove `handler` (or every handler when `None`) for `kind`, retracting
    /// the interest once nothing local listens for it any more.
    pub fn unbind(&self, kind: &str, handler: Option<EventHandler>) -> Result<(), MeshError> {
        check_unprotected(kind)?;
        self.submit(NodeCall::Unbind(kind.to_string(), handler));
        Ok(())
    }

    /// Send `kind` with `args` to the peer, or fan it out locally when this
    /// is the self node.
    ///
    /// Arrays and tuples are spread into separate arguments. Serialization
    /// fails immediately; delivery is gated on the node being connected.
    pub fn trigger<T: Serialize + ?Sized>(&self, kind: &str, args: &T) -> Result<(), MeshError> {
        check_unprotected(kind)?;
        let args = to_args(args)?;
        self.trigger_values(kind.to_string(), args);
        Ok(())
    }

    /// Bind a local handler for any type except negotiation types, without
    /// announcing it and without waiting for the connection.
    pub fn observe(&self, kind: &str, handler: EventHandler) -> Result<bool, MeshError> {
        if is_negotiation(kind) {
            return Err(MeshError::ProtectedEvent(kind.to_string()));
        }
        Ok(self.events.bind(kind, handler))
    }

    /// Remove a handler added with [`observe`](Self::observe).
    pub fn unobserve(&self, kind: &str, handler: &EventHandler) -> bool {
        self.events.unbind(kind, handler)
    }

    pub(crate) fn events(&self) -> &EventDispatcher<Event> {
        &self.events
    }

    pub(crate) fn trigger_values(&self, kind: String, args: Vec<Value>) {
        self.submit(NodeCall::Trigger(kind, args));
    }

    pub(crate) fn announce(&self, kind: &str) {
        self.submit(NodeCall::Announce(kind.to_string()));
    }

    pub(crate) fn retract(&self, kind: &str) {
        self.submit(NodeCall::Retract(kind.to_string()));
    }

    fn submit(&self, call: NodeCall) {
        let admitted = self.drive.lock().admit(NodeState::Connected, call);
        if let Some(call) = admitted {
            self.run(call);
        }
    }

    fn replay(&self, calls: Vec<NodeCall>) {
        for call in calls {
            self.run(call);
        }
    }

    fn set_state(&self, state: NodeState) {
        let released = self.drive.lock().set_state(state);
        self.replay(released);
    }

    fn run(&self, call: NodeCall) {
        match call {
            NodeCall::Bind(kind, handler) => {
                self.events.bind(&kind, handler);
                self.run(NodeCall::Announce(kind));
            }
            NodeCall::Unbind(kind, handler) => {
                match handler {
                    Some(handler) => {
                        self.events.unbind(&kind, &handler);
                    }
                    None => {
                        self.events.unbind_all(&kind);
                    }
                }
                self.run(NodeCall::Retract(kind));
            }
            NodeCall::Announce(kind) => {
                if self.is_self() || is_protected(&kind) {
                    return;
                }
                if self.announced.lock().insert(kind.clone()) {
                    self.send(EventMessage::new(BIND, vec![Value::String(kind)]));
                }
            }
            NodeCall::Retract(kind) => {
                if self.is_self() || is_protected(&kind) || self.locally_bound(&kind) {
                    return;
                }
                if self.announced.lock().remove(&kind) {
                    self.send(EventMessage::new(UNBIND, vec![Value::String(kind)]));
                }
            }
            NodeCall::Trigger(kind, args) => {
                if self.is_self() {
                    let Some(me) = self.me.upgrade() else {
                        return;
                    };
                    let event = Event::new(kind.as_str(), args, me);
                    self.events.trigger(&kind, &event);
                    if let Some(mesh) = self.mesh.upgrade() {
                        mesh.events().trigger(&kind, &event);
                    }
                } else if self.remote_binds_to(&kind) {
                    self.send(EventMessage::new(kind, args));
                } else {
                    debug!("{} not interested in '{}', dropping", self, kind);
                }
            }
        }
    }

    /// Whether anything local still listens for `kind` from this node.
    fn locally_bound(&self, kind: &str) -> bool {
        if self.events.is_bound(kind) {
            return true;
        }
        match self.mesh.upgrade() {
            Some(mesh) => mesh.events().is_bound(kind) || mesh.peers().events().is_bound(kind),
            None => false,
        }
    }

    /// Send `message` to the peer, bypassing interest filtering, after the
    /// configured artificial delay.
    fn send(&self, message: EventMessage) {
        let text = match message.encode() {
            Ok(text) => text,
            Err(e) => {
                warn!("{} failed to encode '{}': {}", self, message.kind, e);
                return;
            }
        };

        let delay = self
            .mesh
            .upgrade()
            .and_then(|mesh| mesh.send_delay())
            .filter(|d| !d.is_zero());
        let runtime = tokio::runtime::Handle::try_current().ok();

        match (delay, runtime) {
            (Some(delay), Some(runtime)) => {
                let node = self.me.clone();
                runtime.spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(node) = node.upgrade() {
                        node.send_now(&text);
                    }
                });
            }
            _ => {
                self.send_now(&text);
            }
        }
    }

    /// Send on the highest priority open channel that accepts the message.
    fn send_now(&self, text: &str) -> bool {
        let channels: Vec<Arc<dyn Channel>> =
            self.links.lock().iter().map(|l| l.channel.clone()).collect();
        for channel in channels.iter().rev() {
            if channel.state() == ChannelState::Open && channel.send(text) {
                return true;
            }
        }
        warn!("{} has no open send channel", self);
        false
    }

    fn on_signaling_open(&self) {
        if !self.is_self() {
            if let Some(mesh) = self.mesh.upgrade() {
                let mut kinds = mesh.events().bound_types();
                for kind in mesh.peers().events().bound_types() {
                    if !kinds.contains(&kind) {
                        kinds.push(kind);
                    }
                }
                for kind in kinds {
                    self.announce(&kind);
                }
            }
            // lets the direct channel start negotiating
            let channels: Vec<Arc<dyn Channel>> =
                self.links.lock().iter().map(|l| l.channel.clone()).collect();
            for channel in channels {
                channel.open();
            }
        }
        info!("{} connected", self);
        self.set_state(NodeState::Connected);
    }

    fn on_channel_event(&self, event: &ChannelEvent) {
        let Some(mesh) = self.mesh.upgrade() else {
            return;
        };
        let Some(event) = self.preprocess_incoming(&mesh, event) else {
            return;
        };

        self.events.trigger(&event.kind, &event);
        if !self.is_self() {
            mesh.peers().events().trigger(&event.kind, &event);
        }
        mesh.events().trigger(&event.kind, &event);
    }

    /// Turn a channel event into the event handed to handlers, applying
    /// topology and interest updates on the way. `None` when nothing should
    /// propagate.
    fn preprocess_incoming(&self, mesh: &Arc<Mesh>, event: &ChannelEvent) -> Option<Event> {
        let me = self.me.upgrade()?;
        let incoming = match event {
            ChannelEvent::Open => return Some(Event::new(OPEN, Vec::new(), me)),
            ChannelEvent::Close => return Some(Event::new(CLOSE, Vec::new(), me)),
            ChannelEvent::Error(e) => {
                return Some(Event::new(ERROR, vec![Value::String(e.clone())], me))
            }
            ChannelEvent::Message(incoming) => incoming,
        };

        let message = match EventMessage::decode(&incoming.data) {
            Ok(message) => message,
            Err(e) => {
                warn!("{} dropping malformed message: {}", self, e);
                return None;
            }
        };

        if is_negotiation(&message.kind) {
            let direct = self.direct.lock().clone();
            match direct {
                Some(direct) => {
                    let payload = message.args.first().cloned().unwrap_or(Value::Null);
                    direct.handle_signal(&message.kind, &payload);
                }
                None => debug!("{} has no direct channel for '{}'", self, message.kind),
            }
            return None;
        }

        let mut nodes = Vec::new();
        match message.kind.as_str() {
            CONNECT => {
                if !self.is_self() {
                    warn!("Expected '{}' only on the self node, got it on {}", CONNECT, self);
                }
                for id in message.ids() {
                    nodes.push(mesh.add_peer(id, true));
                }
                mesh.peers().set_state(NodeState::Connected);
                mesh.set_state(NodeState::Connected);
            }
            ENTER => {
                for id in message.ids() {
                    nodes.push(mesh.add_peer(id, false));
                }
            }
            LEAVE => {
                for id in message.ids() {
                    match mesh.peers().remove_by_id(&id) {
                        Some(node) => {
                            node.disconnect();
                            nodes.push(node);
                        }
                        None => warn!("Peer {} left but is not in peers", id),
                    }
                }
            }
            BIND => {
                if let Some(kind) = message.first_str() {
                    self.remote_interest
                        .lock()
                        .get_or_insert_with(HashSet::new)
                        .insert(kind.to_string());
                }
            }
            UNBIND => {
                if let Some(kind) = message.first_str() {
                    if let Some(kinds) = self.remote_interest.lock().as_mut() {
                        kinds.remove(kind);
                    }
                }
            }
            _ => {}
        }

        let mut event = Event::new(message.kind, message.args, me);
        event.nodes = nodes;
        event.timestamp = Some(incoming.timestamp);
        Some(event)
    }
}

impl Signaler for Node {
    fn signal(&self, kind: &str, payload: Value) {
        self.send(EventMessage::new(kind, vec![payload]));
    }
}

pub(crate) fn check_unprotected(kind: &str) -> Result<(), MeshError> {
    if is_protected(kind) {
        return Err(MeshError::ProtectedEvent(kind.to_string()));
    }
    Ok(())
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node@{}", self.uid())
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("uid", &self.uid())
            .field("id", &self.id())
            .field("is_self", &self.is_self())
            .field("state", &self.state())
            .finish()
    }
}

