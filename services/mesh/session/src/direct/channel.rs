//! Direct channel: a peer-to-peer data channel negotiated over signaling.

use super::peer::{
    IceCandidate, IceServer, PeerConfig, PeerConnection, PeerConnector, PeerEvent,
    SessionDescription,
};
use super::sdp::{prefer_opus, set_bandwidth};
use crate::channel::{unix_timestamp, Channel, ChannelEvent, ChannelKind, ChannelState, Incoming};
use crate::dispatcher::EventDispatcher;
use crate::error::ChannelError;
use crate::identity::PeerIdentity;
use crate::reliability::{NetChannel, NetChannelConfig, PacketTransport};
use bytes::Bytes;
use mesh_wire::event::{RTC_ANSWER, RTC_ICE_CANDIDATE, RTC_OFFER};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Data channel label
pub const DATA_CHANNEL_LABEL: &str = "mesh";

/// Carries negotiation messages to the remote peer over another channel.
pub trait Signaler: Send + Sync {
    /// Send one negotiation message (`rtc_offer`, `rtc_answer` or
    /// `rtc_iceCandidate`) to the remote peer.
    fn signal(&self, kind: &str, payload: Value);
}

/// Direct channel settings
#[derive(Debug, Clone, Default)]
pub struct DirectConfig {
    /// ICE servers for the peer connection
    pub ice_servers: Vec<IceServer>,
    /// Bandwidth ceiling written into local descriptions, in kbps
    pub bandwidth: Option<u32>,
    /// Run a NetChannel over the data channel
    pub reliable: Option<NetChannelConfig>,
}

/// Channel over a peer-to-peer data channel.
///
/// The remote identity's `initiator` flag decides which side sends the
/// offer. Negotiation messages arrive through [`DirectChannel::handle_signal`]
/// and leave through the [`Signaler`].
pub struct DirectChannel {
    local: Arc<PeerIdentity>,
    remote: Arc<PeerIdentity>,
    config: DirectConfig,
    connector: Arc<dyn PeerConnector>,
    signaler: Weak<dyn Signaler>,
    state: Mutex<ChannelState>,
    peer: Mutex<Option<Arc<dyn PeerConnection>>>,
    net: Mutex<Option<NetChannel>>,
    events: EventDispatcher<ChannelEvent>,
    me: Weak<DirectChannel>,
}

impl DirectChannel {
    /// Create a closed channel from `local` to `remote`.
    pub fn new(
        local: Arc<PeerIdentity>,
        remote: Arc<PeerIdentity>,
        config: DirectConfig,
        connector: Arc<dyn PeerConnector>,
        signaler: Weak<dyn Signaler>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            local,
            remote,
            config,
            connector,
            signaler,
            state: Mutex::new(ChannelState::Closed),
            peer: Mutex::new(None),
            net: Mutex::new(None),
            events: EventDispatcher::new(),
            me: me.clone(),
        })
    }

    /// Apply a negotiation message from the remote peer.
    pub fn handle_signal(&self, kind: &str, payload: &Value) {
        if let Err(e) = self.apply_signal(kind, payload) {
            warn!("Negotiation '{}' with {} failed: {}", kind, self.remote, e);
            self.emit(ChannelEvent::Error(e.to_string()));
        }
    }

    fn apply_signal(&self, kind: &str, payload: &Value) -> Result<(), ChannelError> {
        match kind {
            RTC_OFFER => {
                let offer = parse::<SessionDescription>(payload)?;
                let peer = self.ensure_peer()?;
                peer.set_remote_description(&offer)?;
                let answer = self.rewrite(peer.create_answer()?);
                peer.set_local_description(&answer)?;
                self.signal(RTC_ANSWER, &answer)?;
            }
            RTC_ANSWER => {
                let answer = parse::<SessionDescription>(payload)?;
                self.current_peer()?.set_remote_description(&answer)?;
            }
            RTC_ICE_CANDIDATE => {
                let candidate = parse::<IceCandidate>(payload)?;
                self.current_peer()?.add_ice_candidate(&candidate)?;
            }
            other => debug!("Ignoring negotiation message '{}'", other),
        }
        Ok(())
    }

    fn rewrite(&self, desc: SessionDescription) -> SessionDescription {
        let mut sdp = prefer_opus(&desc.sdp);
        if let Some(kbps) = self.config.bandwidth {
            sdp = set_bandwidth(&sdp, kbps);
        }
        SessionDescription { kind: desc.kind, sdp }
    }

    fn signal<T: serde::Serialize>(&self, kind: &str, payload: &T) -> Result<(), ChannelError> {
        let value = serde_json::to_value(payload).map_err(mesh_wire::WireError::from)?;
        match self.signaler.upgrade() {
            Some(signaler) => signaler.signal(kind, value),
            None => debug!("Dropping '{}' for {}: signaler gone", kind, self.remote),
        }
        Ok(())
    }

    fn current_peer(&self) -> Result<Arc<dyn PeerConnection>, ChannelError> {
        self.peer
            .lock()
            .clone()
            .ok_or_else(|| ChannelError::Peer("no peer connection".to_string()))
    }

    fn ensure_peer(&self) -> Result<Arc<dyn PeerConnection>, ChannelError> {
        if let Some(peer) = self.peer.lock().clone() {
            return Ok(peer);
        }

        let weak = self.me.clone();
        let sink = Arc::new(move |event: PeerEvent| {
            if let Some(channel) = weak.upgrade() {
                channel.on_peer_event(event);
            }
        });
        let config = PeerConfig {
            ice_servers: self.config.ice_servers.clone(),
        };
        let peer = self.connector.create(&config, sink)?;
        *self.peer.lock() = Some(peer.clone());
        debug!("Peer connection to {} created", self.remote);
        Ok(peer)
    }

    fn on_peer_event(&self, event: PeerEvent) {
        // nothing arrives after a local close
        if self.peer.lock().is_none() {
            return;
        }
        match event {
            PeerEvent::IceCandidate(candidate) => {
                if let Err(e) = self.signal(RTC_ICE_CANDIDATE, &candidate) {
                    warn!("Failed to forward ICE candidate: {}", e);
                }
            }
            PeerEvent::DataOpen => {
                if let Some(config) = self.config.reliable.clone() {
                    let transport = Arc::new(DataTransport {
                        channel: self.me.clone(),
                    });
                    *self.net.lock() = Some(NetChannel::new(transport, config));
                }
                *self.state.lock() = ChannelState::Open;
                debug!("Direct channel to {} open", self.remote);
                self.emit(ChannelEvent::Open);
            }
            PeerEvent::DataMessage(data) => self.on_data(data),
            PeerEvent::DataClose => {
                *self.state.lock() = ChannelState::Closed;
                if let Some(net) = self.net.lock().take() {
                    net.close();
                }
                self.emit(ChannelEvent::Close);
            }
            PeerEvent::Error(message) => self.emit(ChannelEvent::Error(message)),
        }
    }

    fn on_data(&self, data: Bytes) {
        let net = self.net.lock().clone();
        let payloads = match net {
            Some(net) => match net.recv(data) {
                Ok(payloads) => payloads,
                Err(e) => {
                    warn!("Dropping packet from {}: {}", self.remote, e);
                    return;
                }
            },
            None => vec![data],
        };

        for payload in payloads {
            match String::from_utf8(payload.to_vec()) {
                Ok(text) => self.emit(ChannelEvent::Message(Incoming {
                    from: self.remote.id(),
                    timestamp: unix_timestamp(),
                    data: text,
                })),
                Err(_) => warn!("Dropping non-UTF-8 message from {}", self.remote),
            }
        }
    }

    fn raw_send(&self, data: Bytes) -> bool {
        match self.peer.lock().clone() {
            Some(peer) => peer.send(data),
            None => false,
        }
    }
}

/// Packet transport over the channel's own data channel.
struct DataTransport {
    channel: Weak<DirectChannel>,
}

impl PacketTransport for DataTransport {
    fn is_open(&self) -> bool {
        self.channel
            .upgrade()
            .is_some_and(|c| c.state() == ChannelState::Open)
    }

    fn transmit(&self, packet: Bytes) -> bool {
        self.channel
            .upgrade()
            .is_some_and(|c| c.raw_send(packet))
    }
}

fn parse<T: serde::de::DeserializeOwned>(payload: &Value) -> Result<T, ChannelError> {
    serde_json::from_value(payload.clone())
        .map_err(|e| ChannelError::Wire(mesh_wire::WireError::from(e)))
}

impl Channel for DirectChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Direct
    }

    fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    fn local(&self) -> &Arc<PeerIdentity> {
        &self.local
    }

    fn remote(&self) -> &Arc<PeerIdentity> {
        &self.remote
    }

    fn open(&self) {
        if self.local.uid() == self.remote.uid() || self.peer.lock().is_some() {
            return;
        }
        let result = self.ensure_peer().and_then(|peer| {
            *self.state.lock() = ChannelState::Opening;
            peer.create_data_channel(DATA_CHANNEL_LABEL, false)?;
            if self.remote.initiator() {
                let offer = self.rewrite(peer.create_offer()?);
                peer.set_local_description(&offer)?;
                self.signal(RTC_OFFER, &offer)?;
            }
            Ok(())
        });
        if let Err(e) = result {
            warn!("Opening direct channel to {} failed: {}", self.remote, e);
            self.emit(ChannelEvent::Error(e.to_string()));
        }
    }

    fn close(&self) {
        *self.state.lock() = ChannelState::Closed;
        let net = self.net.lock().take();
        if let Some(net) = net {
            net.close();
        }
        let peer = self.peer.lock().take();
        if let Some(peer) = peer {
            debug!("Closing direct channel to {}", self.remote);
            peer.close();
        }
    }

    fn send(&self, message: &str) -> bool {
        if self.state() != ChannelState::Open {
            return false;
        }
        let net = self.net.lock().clone();
        match net {
            Some(net) => net.send(message.as_bytes()).is_ok(),
            None => self.raw_send(Bytes::copy_from_slice(message.as_bytes())),
        }
    }

    fn events(&self) -> &EventDispatcher<ChannelEvent> {
        &self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::direct::loopback::LoopbackNetwork;
    use crate::dispatcher::Handler;
    use mesh_wire::NodeId;
    use std::time::Duration;

    /// Routes signals straight into the counterpart channel.
    #[derive(Default)]
    struct Crossover {
        target: Mutex<Option<Weak<DirectChannel>>>,
        sent: Mutex<Vec<(String, Value)>>,
    }

    impl Signaler for Crossover {
        fn signal(&self, kind: &str, payload: Value) {
            self.sent.lock().push((kind.to_string(), payload.clone()));
            let target = self.target.lock().clone();
            if let Some(channel) = target.and_then(|t| t.upgrade()) {
                channel.handle_signal(kind, &payload);
            }
        }
    }

    struct Pair {
        a: Arc<DirectChannel>,
        b: Arc<DirectChannel>,
        sig_a: Arc<Crossover>,
        _sig_b: Arc<Crossover>,
    }

    fn pair(network: &LoopbackNetwork, config: DirectConfig) -> Pair {
        let id_a = Arc::new(PeerIdentity::remote(NodeId::from(1u64), false));
        let id_b = Arc::new(PeerIdentity::remote(NodeId::from(2u64), false));
        let sig_a = Arc::new(Crossover::default());
        let sig_b = Arc::new(Crossover::default());
        let connector: Arc<dyn PeerConnector> = Arc::new(network.clone());

        // a offers to b, b answers a
        let remote_b = Arc::new(PeerIdentity::remote(NodeId::from(2u64), true));
        let sa: Arc<dyn Signaler> = sig_a.clone();
        let sb: Arc<dyn Signaler> = sig_b.clone();
        let a = DirectChannel::new(
            id_a.clone(),
            remote_b,
            config.clone(),
            connector.clone(),
            Arc::downgrade(&sa),
        );
        let b = DirectChannel::new(id_b, id_a, config, connector, Arc::downgrade(&sb));
        *sig_a.target.lock() = Some(Arc::downgrade(&b));
        *sig_b.target.lock() = Some(Arc::downgrade(&a));
        Pair {
            a,
            b,
            sig_a,
            _sig_b: sig_b,
        }
    }

    fn messages(channel: &DirectChannel) -> Arc<Mutex<Vec<String>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        channel.events().bind(
            "message",
            Handler::new(move |e: &ChannelEvent| {
                if let ChannelEvent::Message(m) = e {
                    sink.lock().push(m.data.clone());
                }
            }),
        );
        log
    }

    #[tokio::test]
    async fn test_negotiates_and_exchanges() {
        let network = LoopbackNetwork::new();
        let p = pair(
            &network,
            DirectConfig {
                bandwidth: Some(64),
                ..Default::default()
            },
        );
        let received = messages(&p.b);

        p.b.open();
        p.a.open();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(p.a.state(), ChannelState::Open);
        assert_eq!(p.b.state(), ChannelState::Open);

        let sent = p.sig_a.sent.lock().clone();
        let (kind, offer) = &sent[0];
        assert_eq!(kind, RTC_OFFER);
        let sdp = offer["sdp"].as_str().unwrap();
        assert!(sdp.contains("m=audio 9 RTP/SAVPF 111 103 0 126"));
        assert!(sdp.contains("b=AS:64"));
        assert!(sent.iter().any(|(k, _)| k == RTC_ICE_CANDIDATE));

        assert!(p.a.send(r#"["chat","hi"]"#));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(received.lock().as_slice(), [r#"["chat","hi"]"#.to_string()]);
    }

    #[tokio::test]
    async fn test_send_before_open_fails() {
        let network = LoopbackNetwork::new();
        let p = pair(&network, DirectConfig::default());
        assert!(!p.a.send("x"));
        p.a.open();
        assert_eq!(p.a.state(), ChannelState::Opening);
        assert!(!p.a.send("x"));
    }

    #[tokio::test]
    async fn test_self_channel_never_opens() {
        let network = LoopbackNetwork::new();
        let me = Arc::new(PeerIdentity::local());
        let sig: Arc<dyn Signaler> = Arc::new(Crossover::default());
        let channel = DirectChannel::new(
            me.clone(),
            me,
            DirectConfig::default(),
            Arc::new(network.clone()),
            Arc::downgrade(&sig),
        );
        channel.open();
        assert_eq!(channel.state(), ChannelState::Closed);
        assert_eq!(network.created(), 0);
    }

    #[tokio::test]
    async fn test_bad_signal_emits_error() {
        let network = LoopbackNetwork::new();
        let p = pair(&network, DirectConfig::default());
        let errors = Arc::new(Mutex::new(0));
        let count = errors.clone();
        p.b.events()
            .bind("error", Handler::new(move |_: &ChannelEvent| *count.lock() += 1));

        p.b.handle_signal(RTC_ANSWER, &serde_json::json!({"type": "answer", "sdp": "v=0"}));
        p.b.handle_signal(RTC_OFFER, &serde_json::json!("garbage"));
        assert_eq!(*errors.lock(), 2);
    }

    #[tokio::test]
    async fn test_close_is_silent_and_final() {
        let network = LoopbackNetwork::new();
        let p = pair(&network, DirectConfig::default());
        let closes = Arc::new(Mutex::new(0));
        let count = closes.clone();
        p.a.events()
            .bind("close", Handler::new(move |_: &ChannelEvent| *count.lock() += 1));

        p.b.open();
        p.a.open();
        tokio::time::sleep(Duration::from_millis(20)).await;
        p.a.close();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(p.a.state(), ChannelState::Closed);
        assert_eq!(p.b.state(), ChannelState::Closed);
        assert_eq!(*closes.lock(), 0);
        assert!(!p.a.send("x"));
    }

    #[tokio::test]
    async fn test_reliable_over_lossy_link() {
        let network = LoopbackNetwork::new();
        let p = pair(
            &network,
            DirectConfig {
                reliable: Some(NetChannelConfig {
                    resend_interval: Duration::from_millis(20),
                }),
                ..Default::default()
            },
        );
        let received = messages(&p.b);
        p.b.open();
        p.a.open();
        tokio::time::sleep(Duration::from_millis(20)).await;

        network.set_drop_every(Some(3));
        for i in 0..5 {
            assert!(p.a.send(&format!("[\"n\",{}]", i)));
        }
        tokio::time::sleep(Duration::from_millis(500)).await;

        let expected: Vec<String> = (0..5).map(|i| format!("[\"n\",{}]", i)).collect();
        assert_eq!(*received.lock(), expected);
    }
}
