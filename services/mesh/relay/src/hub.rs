//! Room registry and message routing for the relay.
//!
//! Clients join a room named by their connection path and get an integer
//! id. Membership changes are announced as control messages "from" each
//! recipient's own id, so they land on the recipient's local channel:
//!
//! ```text
//! newcomer  <- [newId,    ts, "[\"connect\",1,2]"]
//! member 1  <- [1,        ts, "[\"enter\",3]"]
//! member 2  <- [2,        ts, "[\"leave\",3]"]
//! ```
//!
//! Client frames `[[targets], message]` are forwarded to each target in the
//! same room as `[senderId, ts, message]`.

use dashmap::DashMap;
use mesh_session::unix_timestamp;
use mesh_wire::event::{CONNECT, ENTER, LEAVE};
use mesh_wire::{EventMessage, InboundEnvelope, NodeId, OutboundEnvelope};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

type Outbox = UnboundedSender<String>;

/// Relay state shared by every client connection.
#[derive(Debug)]
pub struct RelayHub {
    rooms: DashMap<String, BTreeMap<u64, Outbox>>,
    next_id: AtomicU64,
}

impl Default for RelayHub {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayHub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Room name for a connection path; a random room when the path is empty.
    pub fn room_for_path(path: &str) -> String {
        let path = path.split(['?', '#']).next().unwrap_or_default();
        let room = path.trim_matches('/');
        if room.is_empty() {
            uuid::Uuid::new_v4().simple().to_string()
        } else {
            room.to_string()
        }
    }

    /// Number of members in `room`
    pub fn members(&self, room: &str) -> usize {
        self.rooms.get(room).map(|r| r.len()).unwrap_or(0)
    }

    /// Number of rooms with members
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Add a client to `room` and return its id.
    ///
    /// The client receives `connect` with the ids already present, and every
    /// member receives `enter` with the new id.
    pub fn enter(&self, room: &str, outbox: Outbox) -> NodeId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut members = self.rooms.entry(room.to_string()).or_default();

        let existing: Vec<NodeId> = members.keys().map(|m| NodeId::Num(*m)).collect();
        deliver(&outbox, id, &EventMessage::with_ids(CONNECT, &existing));

        let entered = EventMessage::with_ids(ENTER, &[NodeId::Num(id)]);
        for (member, member_outbox) in members.iter() {
            deliver(member_outbox, *member, &entered);
        }
        members.insert(id, outbox);
        info!("Client {} entered room '{}' ({} member(s))", id, room, members.len());
        NodeId::Num(id)
    }

    /// Remove a client from `room`, announcing `leave` to the rest.
    pub fn leave(&self, room: &str, id: &NodeId) {
        let &NodeId::Num(id) = id else {
            return;
        };
        let empty = {
            let Some(mut members) = self.rooms.get_mut(room) else {
                return;
            };
            if members.remove(&id).is_none() {
                return;
            }
            let left = EventMessage::with_ids(LEAVE, &[NodeId::Num(id)]);
            for (member, member_outbox) in members.iter() {
                deliver(member_outbox, *member, &left);
            }
            members.is_empty()
        };
        if empty {
            self.rooms.remove_if(room, |_, members| members.is_empty());
        }
        info!("Client {} left room '{}'", id, room);
    }

    /// Forward a client frame from `from` to its targets in `room`.
    pub fn route(&self, room: &str, from: &NodeId, text: &str) {
        let envelopes = match OutboundEnvelope::decode(text) {
            Ok(envelopes) => envelopes,
            Err(e) => {
                warn!("Dropping malformed frame from {}: {}", from, e);
                return;
            }
        };
        let Some(members) = self.rooms.get(room) else {
            return;
        };

        for envelope in envelopes {
            let inbound = InboundEnvelope::new(from.clone(), unix_timestamp(), envelope.message);
            let text = match inbound.encode() {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to encode relay frame: {}", e);
                    continue;
                }
            };
            for target in &envelope.targets {
                let outbox = match target {
                    NodeId::Num(n) => members.get(n),
                    NodeId::Str(s) => s.parse::<u64>().ok().and_then(|n| members.get(&n)),
                };
                match outbox {
                    Some(outbox) => {
                        let _ = outbox.send(text.clone());
                    }
                    None => debug!("Target {} not in room '{}'", target, room),
                }
            }
        }
    }
}

fn deliver(outbox: &Outbox, recipient: u64, message: &EventMessage) {
    let payload = match message.encode() {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Failed to encode control message: {}", e);
            return;
        }
    };
    match InboundEnvelope::new(NodeId::Num(recipient), unix_timestamp(), payload).encode() {
        Ok(text) => {
            let _ = outbox.send(text);
        }
        Err(e) => warn!("Failed to encode relay frame: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    fn drain(rx: &mut UnboundedReceiver<String>) -> Vec<(NodeId, String)> {
        let mut out = Vec::new();
        while let Ok(text) = rx.try_recv() {
            let envelope = InboundEnvelope::decode(&text).unwrap();
            out.push((envelope.from, envelope.payload));
        }
        out
    }

    #[test]
    fn test_room_for_path() {
        assert_eq!(RelayHub::room_for_path("/room1"), "room1");
        assert_eq!(RelayHub::room_for_path("/a/b/?x=1"), "a/b");
        let random = RelayHub::room_for_path("/");
        assert_eq!(random.len(), 32);
        assert_ne!(random, RelayHub::room_for_path(""));
    }

    #[test]
    fn test_membership_announcements() {
        let hub = RelayHub::new();
        let (tx1, mut rx1) = unbounded_channel();
        let (tx2, mut rx2) = unbounded_channel();

        let a = hub.enter("room", tx1);
        assert_eq!(drain(&mut rx1), vec![(a.clone(), r#"["connect"]"#.to_string())]);

        let b = hub.enter("room", tx2);
        assert_eq!(
            drain(&mut rx2),
            vec![(b.clone(), format!(r#"["connect",{}]"#, a))]
        );
        assert_eq!(drain(&mut rx1), vec![(a.clone(), format!(r#"["enter",{}]"#, b))]);

        hub.leave("room", &b);
        assert_eq!(drain(&mut rx1), vec![(a.clone(), format!(r#"["leave",{}]"#, b))]);
        assert_eq!(hub.members("room"), 1);

        hub.leave("room", &a);
        assert_eq!(hub.room_count(), 0);
    }

    #[test]
    fn test_route_within_room_only() {
        let hub = RelayHub::new();
        let (tx1, mut rx1) = unbounded_channel();
        let (tx2, mut rx2) = unbounded_channel();
        let (tx3, mut rx3) = unbounded_channel();
        let a = hub.enter("one", tx1);
        let b = hub.enter("one", tx2);
        let c = hub.enter("two", tx3);
        drain(&mut rx1);
        drain(&mut rx2);
        drain(&mut rx3);

        let frame = format!(r#"[[{}, {}], "[\"chat\",\"hi\"]"]"#, b, c);
        hub.route("one", &a, &frame);

        assert_eq!(drain(&mut rx2), vec![(a.clone(), r#"["chat","hi"]"#.to_string())]);
        assert!(drain(&mut rx3).is_empty());
        assert!(drain(&mut rx1).is_empty());
    }

    #[test]
    fn test_route_batch_and_garbage() {
        let hub = RelayHub::new();
        let (tx1, mut rx1) = unbounded_channel();
        let (tx2, mut rx2) = unbounded_channel();
        let a = hub.enter("r", tx1);
        let b = hub.enter("r", tx2);
        drain(&mut rx1);
        drain(&mut rx2);

        let frame = format!(r#"[[[{}], "[\"x\"]"], [[{}], "[\"y\"]"]]"#, b, a);
        hub.route("r", &a, &frame);
        assert_eq!(drain(&mut rx2), vec![(a.clone(), r#"["x"]"#.to_string())]);
        assert_eq!(drain(&mut rx1), vec![(a.clone(), r#"["y"]"#.to_string())]);

        hub.route("r", &a, "not json");
        assert!(drain(&mut rx1).is_empty() && drain(&mut rx2).is_empty());
    }
}
