//! Events delivered to application handlers.

use crate::node::Node;
use mesh_session::Handler;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Handler bound on a Mesh, Peers or Node
pub type EventHandler = Handler<Event>;

/// One event as seen by application handlers.
///
/// `node` is the node the event arrived through. Topology events
/// (`connect`, `enter`, `leave`) carry the affected peers in `nodes`.
#[derive(Clone)]
pub struct Event {
    /// Event type
    pub kind: String,
    /// Arguments after the type
    pub args: Vec<Value>,
    /// Originating node
    pub node: Arc<Node>,
    /// Peers affected by a topology event
    pub nodes: Vec<Arc<Node>>,
    /// Relay or receive time, in unix seconds, for events from the wire
    pub timestamp: Option<f64>,
}

impl Event {
    pub(crate) fn new(kind: impl Into<String>, args: Vec<Value>, node: Arc<Node>) -> Self {
        Self {
            kind: kind.into(),
            args,
            node,
            nodes: Vec::new(),
            timestamp: None,
        }
    }

    /// Argument at `index`
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    /// First argument as a string
    pub fn first_str(&self) -> Option<&str> {
        self.args.first().and_then(Value::as_str)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("kind", &self.kind)
            .field("args", &self.args)
            .field("node", &self.node.uid())
            .field("nodes", &self.nodes.iter().map(|n| n.uid()).collect::<Vec<_>>())
            .field("timestamp", &self.timestamp)
            .finish()
    }
}
