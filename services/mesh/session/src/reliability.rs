//! NetChannel: acknowledged, retransmitted, deduplicated delivery over an
//! unreliable packet transport.
//!
//! Every outbound message becomes a sequenced record kept in a send buffer
//! until the peer acknowledges it. Each flush transmits one packet holding
//! the local cumulative ack and *all* unacknowledged records, and re-arms a
//! single resend timer. Received packets trim the send buffer by the peer's
//! ack and deliver records that directly follow the local ack, each exactly
//! once. Delivery is answered with a sequenced `ncACK` record; a packet that
//! brings nothing new but still carries records is answered with a bare ack
//! header, which ends the exchange.

use crate::error::ChannelError;
use bytes::Bytes;
use mesh_wire::{seq_after, Packet, Record, MAX_RECORD_PAYLOAD};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, trace};

/// Default resend interval
pub const DEFAULT_RESEND_INTERVAL: Duration = Duration::from_millis(500);

/// Unreliable packet transport underneath a NetChannel.
pub trait PacketTransport: Send + Sync {
    /// Whether packets can be transmitted now
    fn is_open(&self) -> bool;

    /// Transmit one packet. Delivery is not guaranteed.
    fn transmit(&self, packet: Bytes) -> bool;
}

/// NetChannel settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetChannelConfig {
    /// Delay before unacknowledged records are sent again
    pub resend_interval: Duration,
}

impl Default for NetChannelConfig {
    fn default() -> Self {
        Self {
            resend_interval: DEFAULT_RESEND_INTERVAL,
        }
    }
}

#[derive(Debug)]
struct NetState {
    /// Next sequence number to assign
    seq: u16,
    /// Highest sequence number received and delivered
    ack: u16,
    /// Unacknowledged records, ascending by seq
    buffer: VecDeque<Record>,
    /// Encoded size of the buffered records
    buffer_len: usize,
    closed: bool,
}

impl NetState {
    fn push(&mut self, payload: Bytes) {
        let record = Record {
            seq: self.seq,
            payload,
        };
        self.seq = self.seq.wrapping_add(1);
        self.buffer_len += record.encoded_len();
        self.buffer.push_back(record);
    }

    /// Drop buffered records covered by the peer's cumulative ack.
    fn shrink(&mut self, ack: u16) {
        while let Some(front) = self.buffer.front() {
            if seq_after(front.seq, ack) {
                break;
            }
            self.buffer_len -= front.encoded_len();
            self.buffer.pop_front();
        }
    }
}

struct NetInner {
    transport: Arc<dyn PacketTransport>,
    config: NetChannelConfig,
    state: Mutex<NetState>,
    timer: Mutex<Option<AbortHandle>>,
}

/// Reliability adapter over a [`PacketTransport`].
#[derive(Clone)]
pub struct NetChannel {
    inner: Arc<NetInner>,
}

impl NetChannel {
    /// Create a NetChannel over `transport`.
    pub fn new(transport: Arc<dyn PacketTransport>, config: NetChannelConfig) -> Self {
        Self {
            inner: Arc::new(NetInner {
                transport,
                config,
                state: Mutex::new(NetState {
                    seq: 1,
                    ack: 0,
                    buffer: VecDeque::new(),
                    buffer_len: 0,
                    closed: false,
                }),
                timer: Mutex::new(None),
            }),
        }
    }

    /// Queue `payload` for reliable delivery and flush.
    pub fn send(&self, payload: &[u8]) -> Result<(), ChannelError> {
        if payload.len() > MAX_RECORD_PAYLOAD {
            return Err(ChannelError::Oversize(payload.len()));
        }
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(ChannelError::Closed);
            }
            state.push(Bytes::copy_from_slice(payload));
        }
        self.flush();
        Ok(())
    }

    /// Process a received packet and return newly delivered payloads.
    pub fn recv(&self, data: Bytes) -> Result<Vec<Bytes>, ChannelError> {
        let packet = Packet::decode(data)?;
        let has_records = !packet.records.is_empty();

        let (delivered, bare_ack) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Ok(Vec::new());
            }
            state.shrink(packet.ack);

            let mut delivered = Vec::new();
            let mut advanced = false;
            for record in packet.records {
                if !seq_after(record.seq, state.ack) {
                    continue;
                }
                if record.seq != state.ack.wrapping_add(1) {
                    // gap: the missing record comes first in a resend
                    trace!("NetChannel gap: got {} after {}", record.seq, state.ack);
                    break;
                }
                state.ack = record.seq;
                advanced = true;
                if !record.is_ack() {
                    delivered.push(record.payload);
                }
            }

            if !delivered.is_empty() {
                state.push(Bytes::from_static(mesh_wire::ACK_SENTINEL));
            }
            let bare_ack = has_records && delivered.is_empty() && state.buffer.is_empty();
            if advanced || bare_ack {
                trace!("NetChannel ack now {}", state.ack);
            }
            (delivered, bare_ack.then_some(state.ack))
        };

        if let Some(ack) = bare_ack {
            if self.inner.transport.is_open() {
                self.inner.transport.transmit(Packet::ack_only(ack).encode());
            }
        }
        self.flush();
        Ok(delivered)
    }

    /// Transmit every unacknowledged record and re-arm the resend timer.
    pub fn flush(&self) {
        let packet = {
            let state = self.inner.state.lock();
            if state.closed || state.buffer.is_empty() {
                drop(state);
                self.cancel_timer();
                return;
            }
            Packet {
                ack: state.ack,
                records: state.buffer.iter().cloned().collect(),
            }
        };

        if self.inner.transport.is_open() {
            trace!(
                "NetChannel flush: {} record(s), ack {}",
                packet.records.len(),
                packet.ack
            );
            self.inner.transport.transmit(packet.encode());
        }
        self.arm_timer();
    }

    /// Stop the resend timer and refuse further traffic.
    pub fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            state.closed = true;
            state.buffer.clear();
            state.buffer_len = 0;
        }
        self.cancel_timer();
        debug!("NetChannel closed");
    }

    /// Highest sequence number delivered
    pub fn ack(&self) -> u16 {
        self.inner.state.lock().ack
    }

    /// Next sequence number to assign
    pub fn next_seq(&self) -> u16 {
        self.inner.state.lock().seq
    }

    /// Number of unacknowledged records
    pub fn buffered(&self) -> usize {
        self.inner.state.lock().buffer.len()
    }

    /// Encoded size of the unacknowledged records
    pub fn buffered_bytes(&self) -> usize {
        self.inner.state.lock().buffer_len
    }

    fn cancel_timer(&self) {
        if let Some(handle) = self.inner.timer.lock().take() {
            handle.abort();
        }
    }

    fn arm_timer(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            trace!("NetChannel has no runtime, resend timer disabled");
            return;
        };
        let weak: Weak<NetInner> = Arc::downgrade(&self.inner);
        let interval = self.inner.config.resend_interval;
        let task = runtime.spawn(async move {
            tokio::time::sleep(interval).await;
            if let Some(inner) = weak.upgrade() {
                NetChannel { inner }.flush();
            }
        });
        if let Some(previous) = self.inner.timer.lock().replace(task.abort_handle()) {
            previous.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Transport that stores transmitted packets for the test to deliver.
    #[derive(Default)]
    struct Wire {
        packets: Mutex<Vec<Bytes>>,
        closed: Mutex<bool>,
    }

    impl PacketTransport for Wire {
        fn is_open(&self) -> bool {
            !*self.closed.lock()
        }

        fn transmit(&self, packet: Bytes) -> bool {
            self.packets.lock().push(packet);
            true
        }
    }

    impl Wire {
        fn take(&self) -> Vec<Bytes> {
            std::mem::take(&mut *self.packets.lock())
        }
    }

    fn pair() -> (NetChannel, Arc<Wire>, NetChannel, Arc<Wire>) {
        let wa = Arc::new(Wire::default());
        let wb = Arc::new(Wire::default());
        let a = NetChannel::new(wa.clone(), NetChannelConfig::default());
        let b = NetChannel::new(wb.clone(), NetChannelConfig::default());
        (a, wa, b, wb)
    }

    /// Deliver everything in flight both ways until both wires are quiet.
    fn settle(a: &NetChannel, wa: &Wire, b: &NetChannel, wb: &Wire) -> (Vec<Bytes>, Vec<Bytes>) {
        let (mut to_a, mut to_b) = (Vec::new(), Vec::new());
        for _ in 0..16 {
            let from_a = wa.take();
            let from_b = wb.take();
            if from_a.is_empty() && from_b.is_empty() {
                break;
            }
            for p in from_a {
                to_b.extend(b.recv(p).unwrap());
            }
            for p in from_b {
                to_a.extend(a.recv(p).unwrap());
            }
        }
        (to_a, to_b)
    }

    #[test]
    fn test_send_rejects_oversized() {
        let (a, wa, _, _) = pair();
        assert!(matches!(a.send(&[0u8; 256]), Err(ChannelError::Oversize(256))));
        assert!(wa.take().is_empty());
        assert!(a.send(&[0u8; 255]).is_ok());
    }

    #[test]
    fn test_frame_layout() {
        let (a, wa, _, _) = pair();
        a.send(b"hi").unwrap();
        let packets = wa.take();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].as_ref(), &[0, 0, 0, 1, 2, b'h', b'i']);
        assert_eq!(a.buffered_bytes(), 5);
    }

    #[test]
    fn test_round_trip_and_ack_exchange_terminates() {
        let (a, wa, b, wb) = pair();
        a.send(b"one").unwrap();
        a.send(b"two").unwrap();

        let (to_a, to_b) = settle(&a, &wa, &b, &wb);
        assert!(to_a.is_empty());
        assert_eq!(to_b, vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]);
        assert_eq!(a.buffered(), 0);
        assert_eq!(b.buffered(), 0);
        assert_eq!(b.ack(), 2);
        assert!(wa.take().is_empty() && wb.take().is_empty());
    }

    #[test]
    fn test_duplicates_not_redelivered() {
        let (a, wa, b, _) = pair();
        a.send(b"x").unwrap();
        let packet = wa.take().remove(0);
        assert_eq!(b.recv(packet.clone()).unwrap(), vec![Bytes::from_static(b"x")]);
        assert!(b.recv(packet).unwrap().is_empty());
        assert_eq!(b.ack(), 1);
    }

    #[test]
    fn test_stale_packet_does_not_regress_ack() {
        let (a, wa, b, _) = pair();
        a.send(b"1").unwrap();
        let first = wa.take().remove(0);
        a.send(b"2").unwrap();
        let second = wa.take().remove(0);

        assert_eq!(b.recv(second).unwrap().len(), 2);
        assert!(b.recv(first).unwrap().is_empty());
        assert_eq!(b.ack(), 2);
    }

    #[test]
    fn test_closed_channel_is_inert() {
        let (a, wa, b, _) = pair();
        a.send(b"x").unwrap();
        let packet = wa.take().remove(0);
        b.close();
        assert!(b.recv(packet).unwrap().is_empty());
        a.close();
        assert!(matches!(a.send(b"y"), Err(ChannelError::Closed)));
        a.flush();
        assert!(wa.take().is_empty());
    }

    #[test]
    fn test_malformed_packet() {
        let (a, _, _, _) = pair();
        assert!(matches!(
            a.recv(Bytes::from_static(&[0])),
            Err(ChannelError::Wire(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resend_after_loss() {
        let (a, wa, b, _) = pair();
        let payload = vec![7u8; 100];
        a.send(&payload).unwrap();
        // first transmission is lost
        assert_eq!(wa.take().len(), 1);

        tokio::time::sleep(DEFAULT_RESEND_INTERVAL + Duration::from_millis(10)).await;
        let resent = wa.take();
        assert_eq!(resent.len(), 1);

        let mut delivered = Vec::new();
        for packet in resent.iter().chain(resent.iter()) {
            delivered.extend(b.recv(packet.clone()).unwrap());
        }
        assert_eq!(delivered, vec![Bytes::from(payload)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_resend() {
        let (a, wa, _, _) = pair();
        a.send(b"x").unwrap();
        wa.take();
        a.close();
        tokio::time::sleep(DEFAULT_RESEND_INTERVAL * 3).await;
        assert!(wa.take().is_empty());
    }

    #[derive(Debug, Clone)]
    enum Fault {
        Deliver,
        Drop,
        Duplicate,
        Reverse,
    }

    fn fault() -> impl Strategy<Value = Fault> {
        prop_oneof![
            4 => Just(Fault::Deliver),
            2 => Just(Fault::Drop),
            1 => Just(Fault::Duplicate),
            1 => Just(Fault::Reverse),
        ]
    }

    proptest! {
        #[test]
        fn every_payload_delivered_once(
            messages in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..20), 1..12),
            faults in proptest::collection::vec(fault(), 1..64),
        ) {
            let (a, wa, b, wb) = pair();
            // faults apply to the first rounds only, then the link heals
            let mut faults = faults.into_iter();
            let mut delivered: Vec<Bytes> = Vec::new();
            let mut last_ack = 0u16;

            for m in &messages {
                a.send(m).unwrap();
            }

            for _round in 0..200 {
                let mut from_a = wa.take();
                let from_b = wb.take();
                match faults.next().unwrap_or(Fault::Deliver) {
                    Fault::Drop => from_a.clear(),
                    Fault::Duplicate => {
                        let copy = from_a.clone();
                        from_a.extend(copy);
                    }
                    Fault::Reverse => from_a.reverse(),
                    Fault::Deliver => {}
                }
                for p in from_a {
                    delivered.extend(b.recv(p).unwrap());
                    prop_assert!(!seq_after(last_ack, b.ack()));
                    last_ack = b.ack();
                }
                if !matches!(faults.next(), Some(Fault::Drop)) {
                    for p in from_b {
                        a.recv(p).unwrap();
                    }
                }
                if a.buffered() == 0 {
                    break;
                }
                // stands in for the resend timer
                a.flush();
            }

            let expected: Vec<Bytes> = messages.iter().map(|m| Bytes::from(m.clone())).collect();
            prop_assert_eq!(delivered, expected);
        }
    }
}
