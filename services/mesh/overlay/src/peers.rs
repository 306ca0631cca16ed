//! Ordered collection of remote nodes with broadcast bind/unbind/trigger.

use crate::error::MeshError;
use crate::event::{Event, EventHandler};
use crate::node::{check_unprotected, Node, NodeState};
use mesh_session::{EventDispatcher, StateDrive};
use mesh_wire::event::{is_negotiation, to_args};
use mesh_wire::NodeId;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

enum PeersCall {
    Bind(String, EventHandler),
    Unbind(String, Option<EventHandler>),
    Trigger(String, Vec<Value>),
}

/// Remote nodes of a mesh, in discovery order.
///
/// Handlers bound here receive events from every remote node. `bind`,
/// `unbind` and `trigger` wait until the mesh handshake completes.
pub struct Peers {
    nodes: RwLock<Vec<Arc<Node>>>,
    events: EventDispatcher<Event>,
    drive: Mutex<StateDrive<NodeState, PeersCall>>,
}

impl Default for Peers {
    fn default() -> Self {
        Self::new()
    }
}

impl Peers {
    /// Empty, disconnected collection
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(Vec::new()),
            events: EventDispatcher::new(),
            drive: Mutex::new(StateDrive::new(NodeState::Disconnected)),
        }
    }

    /// Connection state
    pub fn state(&self) -> NodeState {
        self.drive.lock().state()
    }

    /// Snapshot of the nodes
    pub fn list(&self) -> Vec<Arc<Node>> {
        self.nodes.read().clone()
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    /// Whether there are no nodes
    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    /// Node with relay id `id`
    pub fn get_by_id(&self, id: &NodeId) -> Option<Arc<Node>> {
        self.nodes
            .read()
            .iter()
            .find(|n| n.id().as_ref() == Some(id))
            .cloned()
    }

    /// Bind `handler` to `kind` from any peer and announce it to every peer.
    pub fn bind(&self, kind: &str, handler: EventHandler) -> Result<(), MeshError> {
        check_unprotected(kind)?;
        self.submit(PeersCall::Bind(kind.to_string(), handler));
        Ok(())
    }

    /// Remove `handler` (or all handlers when `None`) for `kind`.
    pub fn unbind(&self, kind: &str, handler: Option<EventHandler>) -> Result<(), MeshError> {
        check_unprotected(kind)?;
        self.submit(PeersCall::Unbind(kind.to_string(), handler));
        Ok(())
    }

    /// Trigger `kind` on every peer.
    pub fn trigger<T: Serialize + ?Sized>(&self, kind: &str, args: &T) -> Result<(), MeshError> {
        check_unprotected(kind)?;
        let args = to_args(args)?;
        self.trigger_values(kind.to_string(), args);
        Ok(())
    }

    /// Bind a local, unannounced handler; see [`Node::observe`].
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

    pub(crate) fn push(&self, node: Arc<Node>) {
        self.nodes.write().push(node);
    }

    pub(crate) fn remove_by_id(&self, id: &NodeId) -> Option<Arc<Node>> {
        let mut nodes = self.nodes.write();
        let index = nodes.iter().position(|n| n.id().as_ref() == Some(id))?;
        Some(nodes.remove(index))
    }

    pub(crate) fn clear(&self) -> Vec<Arc<Node>> {
        std::mem::take(&mut *self.nodes.write())
    }

    pub(crate) fn set_state(&self, state: NodeState) {
        let released = self.drive.lock().set_state(state);
        for call in released {
            self.run(call);
        }
    }

    /// Drop queued calls and return to `Disconnected`.
    pub(crate) fn reset(&self) {
        let mut drive = self.drive.lock();
        drive.clear();
        drive.set_state(NodeState::Disconnected);
    }

    pub(crate) fn trigger_values(&self, kind: String, args: Vec<Value>) {
        self.submit(PeersCall::Trigger(kind, args));
    }

    pub(crate) fn announce_bind(&self, kind: &str) {
        for node in self.list() {
            node.announce(kind);
        }
    }

    pub(crate) fn announce_unbind(&self, kind: &str) {
        for node in self.list() {
            node.retract(kind);
        }
    }

    fn submit(&self, call: PeersCall) {
        let admitted = self.drive.lock().admit(NodeState::Connected, call);
        if let Some(call) = admitted {
            self.run(call);
        }
    }

    fn run(&self, call: PeersCall) {
        match call {
            PeersCall::Bind(kind, handler) => {
                self.events.bind(&kind, handler);
                self.announce_bind(&kind);
            }
            PeersCall::Unbind(kind, handler) => {
                match handler {
                    Some(handler) => {
                        self.events.unbind(&kind, &handler);
                    }
                    None => {
                        self.events.unbind_all(&kind);
                    }
                }
                self.announce_unbind(&kind);
            }
            PeersCall::Trigger(kind, args) => {
                for node in self.list() {
                    node.trigger_values(kind.clone(), args.clone());
                }
            }
        }
    }
}

