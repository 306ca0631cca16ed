//! Top-level mesh session.

use crate::discovery::{Discovery, HttpDiscovery};
use crate::error::MeshError;
use crate::event::{Event, EventHandler};
use crate::node::{check_unprotected, Node, NodeState};
use crate::options::MeshOptions;
use crate::peers::Peers;
use mesh_session::{
    EventDispatcher, Multiplexer, PeerConnector, PeerIdentity, RelayConnector, StateDrive,
    WsConnector,
};
use mesh_wire::event::{is_negotiation, to_args};
use mesh_wire::NodeId;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

static MESH_UID_SEED: AtomicU64 = AtomicU64::new(1);

enum MeshCall {
    Bind(String, EventHandler),
    Unbind(String, Option<EventHandler>),
    Trigger(String, Vec<Value>),
}

/// A named session of one local peer and any number of remote peers.
///
/// Application handlers bound on the mesh receive events from every node,
/// the local one included. `bind`, `unbind` and `trigger` wait until the
/// relay handshake completes.
pub struct Mesh {
    uid: u64,
    id: RwLock<Option<String>>,
    options: RwLock<MeshOptions>,
    self_node: RwLock<Arc<Node>>,
    peers: Peers,
    events: EventDispatcher<Event>,
    drive: Mutex<StateDrive<NodeState, MeshCall>>,
    mux: Arc<Multiplexer>,
    peer_connector: Option<Arc<dyn PeerConnector>>,
    discovery: RwLock<Option<Arc<dyn Discovery>>>,
    retry: Mutex<Option<AbortHandle>>,
    me: Weak<Mesh>,
}

/// Builder for [`Mesh`].
pub struct MeshBuilder {
    id: Option<String>,
    options: MeshOptions,
    relay: Option<Arc<dyn RelayConnector>>,
    peer_connector: Option<Arc<dyn PeerConnector>>,
    discovery: Option<Arc<dyn Discovery>>,
}

impl MeshBuilder {
    /// Mesh id to join; assigned from the relay url or discovery otherwise
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Relay link factory (WebSocket by default)
    pub fn relay(mut self, connector: Arc<dyn RelayConnector>) -> Self {
        self.relay = Some(connector);
        self
    }

    /// Direct transport factory; without one only relay channels are used
    pub fn peer_connector(mut self, connector: Arc<dyn PeerConnector>) -> Self {
        self.peer_connector = Some(connector);
        self
    }

    /// Discovery client for the `api` option
    pub fn discovery(mut self, discovery: Arc<dyn Discovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Build the mesh, connecting right away when `autoConnect` is set.
    ///
    /// Connecting needs a tokio runtime.
    pub fn build(self) -> Result<Arc<Mesh>, MeshError> {
        let auto_connect = self.options.auto_connect;
        let relay = self
            .relay
            .unwrap_or_else(|| Arc::new(WsConnector::new()) as Arc<dyn RelayConnector>);
        let mux = Multiplexer::new(relay);

        let mesh = Arc::new_cyclic(|me: &Weak<Mesh>| Mesh {
            uid: MESH_UID_SEED.fetch_add(1, Ordering::Relaxed),
            id: RwLock::new(self.id),
            options: RwLock::new(self.options),
            self_node: RwLock::new(Node::new(me.clone(), Arc::new(PeerIdentity::local()))),
            peers: Peers::new(),
            events: EventDispatcher::new(),
            drive: Mutex::new(StateDrive::new(NodeState::Disconnected)),
            mux,
            peer_connector: self.peer_connector,
            discovery: RwLock::new(self.discovery),
            retry: Mutex::new(None),
            me: me.clone(),
        });

        if auto_connect {
            mesh.connect()?;
        }
        Ok(mesh)
    }
}

impl Mesh {
    /// Start building a mesh with `options`
    pub fn builder(options: MeshOptions) -> MeshBuilder {
        MeshBuilder {
            id: None,
            options,
            relay: None,
            peer_connector: None,
            discovery: None,
        }
    }

    /// Process-local unique handle
    pub fn uid(&self) -> u64 {
        self.uid
    }

    /// Mesh id, once known
    pub fn id(&self) -> Option<String> {
        self.id.read().clone()
    }

    /// Snapshot of the options
    pub fn options(&self) -> MeshOptions {
        self.options.read().clone()
    }

    /// Merge a JSON object over the options.
    pub fn configure(&self, patch: &Value) -> Result<(), MeshError> {
        self.options.write().merge_json(patch)
    }

    /// The local node
    pub fn self_node(&self) -> Arc<Node> {
        self.self_node.read().clone()
    }

    /// Remote nodes
    pub fn peers(&self) -> &Peers {
        &self.peers
    }

    /// Connection state
    pub fn state(&self) -> NodeState {
        self.drive.lock().state()
    }

    /// The relay multiplexer shared by every node of this mesh
    pub fn multiplexer(&self) -> &Arc<Multiplexer> {
        &self.mux
    }

    /// Connect the local node and every known peer.
    ///
    /// With `ws` the relay url is used directly and its last path segment
    /// becomes the mesh id. With `channel` the configured relay connector is
    /// addressed by `name`. Otherwise `api` is asked for relay options in the
    /// background, retrying every `retryInterval` until it answers or the
    /// mesh is disconnected.
    pub fn connect(&self) -> Result<(), MeshError> {
        let options = self.options();

        if let Some(ws) = options.ws.as_deref() {
            if let Some(id) = last_segment(ws) {
                *self.id.write() = Some(id.to_string());
            }
            require_runtime()?;
            self.mux.set_endpoint(ws);
            self.connect_nodes();
            Ok(())
        } else if options.channel {
            let name = options.name.clone().ok_or_else(|| {
                MeshError::InvalidOptions("channel transport needs a name".to_string())
            })?;
            require_runtime()?;
            *self.id.write() = Some(name.clone());
            self.mux.set_endpoint(name);
            self.connect_nodes();
            Ok(())
        } else if let Some(api) = options.api.as_deref() {
            let discovery = self.discovery_for(api)?;
            let path = format!("{}/{}", api, self.id().unwrap_or_default());
            self.spawn_discovery(discovery, path, options.retry_interval)?;
            self.begin_connecting();
            Ok(())
        } else {
            Err(MeshError::InvalidOptions(
                "one of ws, channel or api is required".to_string(),
            ))
        }
    }

    /// Disconnect every node, close the relay connection and forget peers.
    ///
    /// The mesh can be connected again; bound event types are announced
    /// anew to the peers found then.
    pub fn disconnect(&self) {
        if let Some(retry) = self.retry.lock().take() {
            retry.abort();
        }

        let old_self = self.self_node();
        old_self.disconnect();
        let peers = self.peers.clear();
        for peer in &peers {
            peer.disconnect();
        }
        self.mux.shutdown();
        self.mux.clear();
        self.peers.reset();
        {
            let mut drive = self.drive.lock();
            drive.clear();
            drive.set_state(NodeState::Disconnected);
        }

        // The relay assigns the local id once per connection.
        *self.self_node.write() = Node::new(self.me.clone(), Arc::new(PeerIdentity::local()));
        info!("Mesh {:?} disconnected, dropped {} peer(s)", self.id(), peers.len());
    }

    /// Bind `handler` to `kind` from any node and announce it to every peer.
    pub fn bind(&self, kind: &str, handler: EventHandler) -> Result<(), MeshError> {
        check_unprotected(kind)?;
        self.submit(MeshCall::Bind(kind.to_string(), handler));
        Ok(())
    }

    /// Remove `handler` (or all handlers when `None`) for `kind`.
    pub fn unbind(&self, kind: &str, handler: Option<EventHandler>) -> Result<(), MeshError> {
        check_unprotected(kind)?;
        self.submit(MeshCall::Unbind(kind.to_string(), handler));
        Ok(())
    }

    /// Trigger `kind` locally and on every interested peer.
    pub fn trigger<T: Serialize + ?Sized>(&self, kind: &str, args: &T) -> Result<(), MeshError> {
        check_unprotected(kind)?;
        let args = to_args(args)?;
        self.submit(MeshCall::Trigger(kind.to_string(), args));
        Ok(())
    }

    /// Bind a local handler for control types such as `connect`, `enter`
    /// and `leave`, or any application type, without announcing it.
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

    pub(crate) fn peer_connector(&self) -> Option<Arc<dyn PeerConnector>> {
        self.peer_connector.clone()
    }

    pub(crate) fn send_delay(&self) -> Option<Duration> {
        self.options.read().delay.as_ref().map(|d| d.next())
    }

    pub(crate) fn set_state(&self, state: NodeState) {
        let released = self.drive.lock().set_state(state);
        for call in released {
            self.run(call);
        }
    }

    /// Add the peer `id`, connecting it when `autoPeerConnect` is set.
    pub(crate) fn add_peer(&self, id: NodeId, initiator: bool) -> Arc<Node> {
        if let Some(existing) = self.peers.get_by_id(&id) {
            return existing;
        }
        let node = Node::new(
            self.me.clone(),
            Arc::new(PeerIdentity::remote(id.clone(), initiator)),
        );
        self.peers.push(node.clone());
        debug!("Peer {} added as {}", id, node);
        if self.options.read().auto_peer_connect {
            node.connect();
        }
        node
    }

    fn connect_nodes(&self) {
        self.begin_connecting();
        self.self_node().connect();
        for peer in self.peers.list() {
            peer.connect();
        }
    }

    /// Move the mesh and its peers from `Disconnected` to `Connecting`.
    fn begin_connecting(&self) {
        if self.state() == NodeState::Disconnected {
            self.set_state(NodeState::Connecting);
        }
        if self.peers.state() == NodeState::Disconnected {
            self.peers.set_state(NodeState::Connecting);
        }
    }

    fn discovery_for(&self, api: &str) -> Result<Arc<dyn Discovery>, MeshError> {
        if let Some(discovery) = self.discovery.read().clone() {
            return Ok(discovery);
        }
        // an absolute api url is its own base
        let discovery: Arc<dyn Discovery> = Arc::new(HttpDiscovery::new(api).map_err(|_| {
            MeshError::InvalidOptions(format!(
                "api '{}' is relative and no discovery client is configured",
                api
            ))
        })?);
        *self.discovery.write() = Some(discovery.clone());
        Ok(discovery)
    }

    fn spawn_discovery(
        &self,
        discovery: Arc<dyn Discovery>,
        path: String,
        retry_interval: Duration,
    ) -> Result<(), MeshError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| MeshError::NoRuntime(e.to_string()))?;
        let weak = self.me.clone();

        // held across the spawn so a fast retry cannot be overwritten
        let mut retry = self.retry.lock();
        let task = runtime.spawn(async move {
            debug!("Discovery GET {}", path);
            let result = discovery.fetch(&path).await;
            let Some(mesh) = weak.upgrade() else {
                return;
            };

            match result.and_then(|options| mesh.apply_discovery(&options)) {
                Ok(()) => {
                    info!("Discovery at {} answered, connecting", path);
                    if let Err(e) = mesh.connect() {
                        warn!("Connecting after discovery failed: {}", e);
                    }
                }
                Err(e) => {
                    warn!(
                        "Error connecting to server ({}), retrying in {:?}",
                        e, retry_interval
                    );
                    drop(mesh);
                    tokio::time::sleep(retry_interval).await;
                    if let Some(mesh) = weak.upgrade() {
                        if let Err(e) = mesh.connect() {
                            warn!("Discovery retry failed: {}", e);
                        }
                    }
                }
            }
        });

        if let Some(previous) = retry.replace(task.abort_handle()) {
            previous.abort();
        }
        Ok(())
    }

    fn apply_discovery(&self, options: &Value) -> Result<(), MeshError> {
        self.configure(options)?;
        let merged = self.options.read();
        if merged.ws.is_none() && !merged.channel {
            return Err(MeshError::Discovery(format!(
                "response names no relay: {}",
                options
            )));
        }
        Ok(())
    }

    fn submit(&self, call: MeshCall) {
        let admitted = self.drive.lock().admit(NodeState::Connected, call);
        if let Some(call) = admitted {
            self.run(call);
        }
    }

    fn run(&self, call: MeshCall) {
        match call {
            MeshCall::Bind(kind, handler) => {
                self.events.bind(&kind, handler);
                self.peers.announce_bind(&kind);
            }
            MeshCall::Unbind(kind, handler) => {
                match handler {
                    Some(handler) => {
                        self.events.unbind(&kind, &handler);
                    }
                    None => {
                        self.events.unbind_all(&kind);
                    }
                }
                self.peers.announce_unbind(&kind);
            }
            MeshCall::Trigger(kind, args) => {
                self.self_node().trigger_values(kind.clone(), args.clone());
                self.peers.trigger_values(kind, args);
            }
        }
    }
}

/// Relay connectors spawn their link tasks on the current runtime.
fn require_runtime() -> Result<(), MeshError> {
    tokio::runtime::Handle::try_current()
        .map(|_| ())
        .map_err(|e| MeshError::NoRuntime(e.to_string()))
}

/// Last non-empty path segment of a relay url.
fn last_segment(url: &str) -> Option<&str> {
    url.rsplit('/').next().filter(|s| !s.is_empty())
}
