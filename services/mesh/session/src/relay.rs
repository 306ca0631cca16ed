//! Relay channel: a logical per-peer channel over the shared relay link.

use crate::channel::{Channel, ChannelEvent, ChannelKind, ChannelState};
use crate::dispatcher::EventDispatcher;
use crate::identity::PeerIdentity;
use crate::multiplexer::Multiplexer;
use crate::state::StateDrive;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::debug;

enum RelayCall {
    Send(String),
    Close,
}

/// Channel multiplexed over the mesh's relay connection.
///
/// `send` and `close` require the channel to be open; earlier calls are
/// queued and replayed once it is.
pub struct RelayChannel {
    local: Arc<PeerIdentity>,
    remote: Arc<PeerIdentity>,
    mux: Weak<Multiplexer>,
    drive: Mutex<StateDrive<ChannelState, RelayCall>>,
    events: EventDispatcher<ChannelEvent>,
    me: Weak<RelayChannel>,
}

impl RelayChannel {
    /// Create a closed channel from `local` to `remote` over `mux`.
    pub fn new(
        local: Arc<PeerIdentity>,
        remote: Arc<PeerIdentity>,
        mux: &Arc<Multiplexer>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            local,
            remote,
            mux: Arc::downgrade(mux),
            drive: Mutex::new(StateDrive::new(ChannelState::Closed)),
            events: EventDispatcher::new(),
            me: me.clone(),
        })
    }

    /// Mirror the multiplexer's connection state and replay queued calls.
    pub(crate) fn set_state(&self, state: ChannelState) {
        let calls = self.drive.lock().set_state(state);
        for call in calls {
            self.run(call);
        }
    }

    fn run(&self, call: RelayCall) -> bool {
        match call {
            RelayCall::Send(message) => {
                if self.state() != ChannelState::Open {
                    return false;
                }
                let (Some(mux), Some(target)) = (self.mux.upgrade(), self.remote.id()) else {
                    return false;
                };
                mux.send(&target, &message)
            }
            RelayCall::Close => {
                // queued sends must not outlive the channel
                self.drive.lock().clear();
                if let (Some(mux), Some(me)) = (self.mux.upgrade(), self.me.upgrade()) {
                    debug!("Closing relay channel to {}", self.remote);
                    mux.unregister(&me);
                }
                true
            }
        }
    }
}

impl Channel for RelayChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Relay
    }

    fn state(&self) -> ChannelState {
        self.drive.lock().state()
    }

    fn local(&self) -> &Arc<PeerIdentity> {
        &self.local
    }

    fn remote(&self) -> &Arc<PeerIdentity> {
        &self.remote
    }

    fn open(&self) {
        let (Some(mux), Some(me)) = (self.mux.upgrade(), self.me.upgrade()) else {
            return;
        };
        mux.register(&me);
        mux.open();
    }

    fn close(&self) {
        let admitted = self.drive.lock().admit(ChannelState::Open, RelayCall::Close);
        if let Some(call) = admitted {
            self.run(call);
        }
    }

    fn send(&self, message: &str) -> bool {
        let admitted = self
            .drive
            .lock()
            .admit(ChannelState::Open, RelayCall::Send(message.to_string()));
        match admitted {
            Some(call) => self.run(call),
            None => false,
        }
    }

    fn events(&self) -> &EventDispatcher<ChannelEvent> {
        &self.events
    }
}
