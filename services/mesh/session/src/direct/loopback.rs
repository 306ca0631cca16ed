//! In-process direct transport.
//!
//! Connections created from the same [`LoopbackNetwork`] pair up through the
//! session id carried in their descriptions: once both ends hold a local and
//! a remote description referring to each other and both created their data
//! channel, the data channels open and bytes flow between them. Events are
//! delivered from a per-connection tokio task, so a runtime is required.

use super::peer::{
    IceCandidate, PeerConfig, PeerConnection, PeerConnector, PeerEvent, PeerSink, SdpKind,
    SessionDescription,
};
use crate::error::ChannelError;
use bytes::Bytes;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::debug;

static SESSION_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^o=- (\d+) ").expect("valid origin pattern"));

#[derive(Default)]
struct NetworkState {
    peers: HashMap<u64, Weak<LoopbackPeer>>,
    created: usize,
    drop_every: Option<usize>,
    sent: usize,
}

/// Factory for paired in-process peer connections.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl LoopbackNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every `n`th data message sent on the network (`None` disables loss).
    pub fn set_drop_every(&self, n: Option<usize>) {
        self.state.lock().drop_every = n;
    }

    /// Number of connections created so far
    pub fn created(&self) -> usize {
        self.state.lock().created
    }

    fn lookup(&self, session: u64) -> Option<Arc<LoopbackPeer>> {
        self.state.lock().peers.get(&session).and_then(Weak::upgrade)
    }

    fn should_drop(&self) -> bool {
        let mut state = self.state.lock();
        state.sent += 1;
        match state.drop_every {
            Some(n) if n > 0 => state.sent % n == 0,
            _ => false,
        }
    }
}

impl PeerConnector for LoopbackNetwork {
    fn create(
        &self,
        config: &PeerConfig,
        sink: PeerSink,
    ) -> Result<Arc<dyn PeerConnection>, ChannelError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<PeerEvent>();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                sink(event);
            }
        });

        let session = rand::random::<u32>() as u64;
        let peer = Arc::new(LoopbackPeer {
            network: self.clone(),
            session,
            events: tx,
            inner: Mutex::new(PeerState::default()),
        });
        {
            let mut state = self.state.lock();
            state.peers.insert(session, Arc::downgrade(&peer));
            state.created += 1;
        }
        debug!(
            "Loopback peer {} created with {} ice server(s)",
            session,
            config.ice_servers.len()
        );
        Ok(peer)
    }
}

#[derive(Default)]
struct PeerState {
    local: Option<SessionDescription>,
    remote_session: Option<u64>,
    data_channel: bool,
    open: bool,
    closed: bool,
    candidates: usize,
}

struct LoopbackPeer {
    network: LoopbackNetwork,
    session: u64,
    events: mpsc::UnboundedSender<PeerEvent>,
    inner: Mutex<PeerState>,
}

impl LoopbackPeer {
    fn describe(&self, kind: SdpKind) -> SessionDescription {
        let sdp = format!(
            "v=0\r\n\
o=- {session} 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 9 RTP/SAVPF 103 111 0 13 126\r\n\
b=AS:30\r\n\
a=rtpmap:103 ISAC/16000\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=rtpmap:0 PCMU/8000\r\n\
a=rtpmap:13 CN/8000\r\n\
a=rtpmap:126 telephone-event/8000\r\n\
m=application 9 DTLS/SCTP 5000\r\n\
a=sctpmap:5000 webrtc-datachannel 1024\r\n",
            session = self.session
        );
        SessionDescription { kind, sdp }
    }

    fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    fn counterpart(&self) -> Option<Arc<LoopbackPeer>> {
        let remote = self.inner.lock().remote_session?;
        self.network.lookup(remote)
    }

    fn negotiated(&self) -> bool {
        let inner = self.inner.lock();
        !inner.closed && inner.local.is_some() && inner.remote_session.is_some() && inner.data_channel
    }

    fn try_open(&self) {
        let Some(other) = self.counterpart() else {
            return;
        };
        if !self.negotiated() || !other.negotiated() {
            return;
        }
        if other.inner.lock().remote_session != Some(self.session) {
            return;
        }
        for peer in [self, other.as_ref()] {
            let mut inner = peer.inner.lock();
            if !inner.open {
                inner.open = true;
                drop(inner);
                peer.emit(PeerEvent::DataOpen);
            }
        }
    }
}

impl PeerConnection for LoopbackPeer {
    fn create_offer(&self) -> Result<SessionDescription, ChannelError> {
        Ok(self.describe(SdpKind::Offer))
    }

    fn create_answer(&self) -> Result<SessionDescription, ChannelError> {
        if self.inner.lock().remote_session.is_none() {
            return Err(ChannelError::Peer("no remote offer".to_string()));
        }
        Ok(self.describe(SdpKind::Answer))
    }

    fn set_local_description(&self, desc: &SessionDescription) -> Result<(), ChannelError> {
        self.inner.lock().local = Some(desc.clone());
        self.emit(PeerEvent::IceCandidate(IceCandidate {
            candidate: format!(
                "candidate:1 1 udp 2122260223 127.0.0.1 {} typ host",
                10000 + self.session % 50000
            ),
            sdp_mid: Some("audio".to_string()),
            sdp_m_line_index: Some(0),
        }));
        self.try_open();
        Ok(())
    }

    fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), ChannelError> {
        let session = SESSION_ID
            .captures(&desc.sdp)
            .and_then(|c| c[1].parse::<u64>().ok())
            .ok_or_else(|| ChannelError::Peer("description has no session id".to_string()))?;
        self.inner.lock().remote_session = Some(session);
        self.try_open();
        Ok(())
    }

    fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), ChannelError> {
        if candidate.candidate.is_empty() {
            return Err(ChannelError::Peer("empty candidate".to_string()));
        }
        self.inner.lock().candidates += 1;
        Ok(())
    }

    fn create_data_channel(&self, label: &str, reliable: bool) -> Result<(), ChannelError> {
        debug!("Loopback data channel '{}' (reliable: {})", label, reliable);
        self.inner.lock().data_channel = true;
        self.try_open();
        Ok(())
    }

    fn send(&self, data: Bytes) -> bool {
        if !self.inner.lock().open {
            return false;
        }
        let Some(other) = self.counterpart() else {
            return false;
        };
        if !self.network.should_drop() {
            other.emit(PeerEvent::DataMessage(data));
        }
        true
    }

    fn close(&self) {
        let was_open = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            std::mem::replace(&mut inner.open, false)
        };
        if was_open {
            if let Some(other) = self.counterpart() {
                let mut inner = other.inner.lock();
                if inner.open {
                    inner.open = false;
                    drop(inner);
                    other.emit(PeerEvent::DataClose);
                }
            }
        }
        self.network.state.lock().peers.remove(&self.session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn collector() -> (PeerSink, Arc<Mutex<Vec<PeerEvent>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink_log = log.clone();
        (Arc::new(move |e| sink_log.lock().push(e)), log)
    }

    #[tokio::test]
    async fn test_pair_opens_and_exchanges_data() {
        let network = LoopbackNetwork::new();
        let (sink_a, log_a) = collector();
        let (sink_b, log_b) = collector();
        let a = network.create(&PeerConfig::default(), sink_a).unwrap();
        let b = network.create(&PeerConfig::default(), sink_b).unwrap();
        a.create_data_channel("mesh", false).unwrap();
        b.create_data_channel("mesh", false).unwrap();

        let offer = a.create_offer().unwrap();
        a.set_local_description(&offer).unwrap();
        b.set_remote_description(&offer).unwrap();
        let answer = b.create_answer().unwrap();
        b.set_local_description(&answer).unwrap();
        a.set_remote_description(&answer).unwrap();

        assert!(a.send(Bytes::from_static(b"hello")));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(log_a.lock().contains(&PeerEvent::DataOpen));
        assert!(log_b.lock().contains(&PeerEvent::DataOpen));
        assert!(log_b
            .lock()
            .contains(&PeerEvent::DataMessage(Bytes::from_static(b"hello"))));

        a.close();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(log_b.lock().last(), Some(&PeerEvent::DataClose));
        assert!(!b.send(Bytes::from_static(b"late")));
    }

    #[tokio::test]
    async fn test_answer_requires_offer() {
        let network = LoopbackNetwork::new();
        let (sink, _log) = collector();
        let peer = network.create(&PeerConfig::default(), sink).unwrap();
        assert!(peer.create_answer().is_err());
    }
}
