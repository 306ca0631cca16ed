//! Peer identity shared between a node and the channels that reach it.

use mesh_wire::NodeId;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static UID_SEED: AtomicU64 = AtomicU64::new(1);

/// Identity of one peer as seen from this process.
///
/// `uid` is unique for the life of the process and never reused. `id` is the
/// relay-assigned identity; it may start unknown and is then assigned exactly
/// once (the local peer learns its id from the relay handshake).
pub struct PeerIdentity {
    uid: u64,
    id: RwLock<Option<NodeId>>,
    is_local: bool,
    initiator: bool,
}

impl PeerIdentity {
    /// Identity of the local peer, id not yet known.
    pub fn local() -> Self {
        Self::build(None, true, false)
    }

    /// Identity of a remote peer.
    pub fn remote(id: NodeId, initiator: bool) -> Self {
        Self::build(Some(id), false, initiator)
    }

    fn build(id: Option<NodeId>, is_local: bool, initiator: bool) -> Self {
        Self {
            uid: UID_SEED.fetch_add(1, Ordering::Relaxed),
            id: RwLock::new(id),
            is_local,
            initiator,
        }
    }

    /// Process-local unique handle
    pub fn uid(&self) -> u64 {
        self.uid
    }

    /// Relay-assigned id, if known
    pub fn id(&self) -> Option<NodeId> {
        self.id.read().clone()
    }

    /// Whether this is the local peer
    pub fn is_local(&self) -> bool {
        self.is_local
    }

    /// Whether the local side sends the direct transport offer to this peer
    pub fn initiator(&self) -> bool {
        self.initiator
    }

    /// Assign the relay id. Only succeeds while the id is still unknown.
    pub fn assign_id(&self, id: NodeId) -> bool {
        let mut slot = self.id.write();
        if slot.is_some() {
            return false;
        }
        *slot = Some(id);
        true
    }
}

impl fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerIdentity")
            .field("uid", &self.uid)
            .field("id", &self.id())
            .field("is_local", &self.is_local)
            .field("initiator", &self.initiator)
            .finish()
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node@{}", self.uid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uids_unique() {
        let a = PeerIdentity::local();
        let b = PeerIdentity::remote(NodeId::Num(1), true);
        assert_ne!(a.uid(), b.uid());
        assert!(a.is_local());
        assert!(b.initiator());
    }

    #[test]
    fn test_assign_once() {
        let me = PeerIdentity::local();
        assert_eq!(me.id(), None);
        assert!(me.assign_id(NodeId::Num(3)));
        assert!(!me.assign_id(NodeId::Num(4)));
        assert_eq!(me.id(), Some(NodeId::Num(3)));

        let peer = PeerIdentity::remote(NodeId::Num(9), false);
        assert!(!peer.assign_id(NodeId::Num(10)));
    }
}
