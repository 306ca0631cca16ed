//! NetChannel reliability packets.
//!
//! ```text
//! +-----------------+------------------------------------------+
//! | u16 ack (BE)    | highest sequence delivered by the sender |
//! +-----------------+------------------------------------------+
//! | u16 seq (BE)    | record 0                                 |
//! | u8  len         |                                          |
//! | len bytes       |                                          |
//! +-----------------+------------------------------------------+
//! | ...             | records 1..n                             |
//! +-----------------+------------------------------------------+
//! ```
//!
//! Sequence numbers wrap; ordering uses serial number arithmetic.

use crate::error::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Payload reserved for acknowledgement records
pub const ACK_SENTINEL: &[u8] = b"ncACK";

/// Largest payload a single record can carry
pub const MAX_RECORD_PAYLOAD: usize = u8::MAX as usize;

/// Size of the packet header (the ack field)
pub const PACKET_HEADER_SIZE: usize = 2;

/// Size of a record header (seq + len)
pub const RECORD_HEADER_SIZE: usize = 3;

/// `true` when `a` comes after `b` in wrapping sequence order.
pub fn seq_after(a: u16, b: u16) -> bool {
    let diff = a.wrapping_sub(b) as i16;
    diff > 0
}

/// One sequenced payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Sequence number
    pub seq: u16,
    /// Payload bytes (at most [`MAX_RECORD_PAYLOAD`])
    pub payload: Bytes,
}

impl Record {
    /// Create a record, rejecting oversized payloads.
    pub fn new(seq: u16, payload: Bytes) -> Result<Self, WireError> {
        if payload.len() > MAX_RECORD_PAYLOAD {
            return Err(WireError::Size(payload.len()));
        }
        Ok(Self { seq, payload })
    }

    /// Acknowledgement record
    pub fn ack(seq: u16) -> Self {
        Self {
            seq,
            payload: Bytes::from_static(ACK_SENTINEL),
        }
    }

    /// Whether this record only carries the ACK sentinel.
    pub fn is_ack(&self) -> bool {
        self.payload.as_ref() == ACK_SENTINEL
    }

    /// Bytes this record occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        RECORD_HEADER_SIZE + self.payload.len()
    }

    /// Append the record to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u16(self.seq);
        buf.put_u8(self.payload.len() as u8);
        buf.put_slice(&self.payload);
    }
}

/// One packet: cumulative ack plus zero or more records.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Packet {
    /// Cumulative acknowledgement
    pub ack: u16,
    /// Records, ascending by sequence
    pub records: Vec<Record>,
}

impl Packet {
    /// Ack-only packet
    pub fn ack_only(ack: u16) -> Self {
        Self {
            ack,
            records: Vec::new(),
        }
    }

    /// Encode to bytes
    pub fn encode(&self) -> Bytes {
        let len = PACKET_HEADER_SIZE + self.records.iter().map(Record::encoded_len).sum::<usize>();
        let mut buf = BytesMut::with_capacity(len);
        buf.put_u16(self.ack);
        for record in &self.records {
            record.encode_into(&mut buf);
        }
        buf.freeze()
    }

    /// Decode from bytes
    pub fn decode(mut data: Bytes) -> Result<Self, WireError> {
        if data.len() < PACKET_HEADER_SIZE {
            return Err(WireError::Incomplete);
        }
        let ack = data.get_u16();
        let mut records = Vec::new();
        while data.has_remaining() {
            if data.remaining() < RECORD_HEADER_SIZE {
                return Err(WireError::Incomplete);
            }
            let seq = data.get_u16();
            let len = data.get_u8() as usize;
            if data.remaining() < len {
                return Err(WireError::Incomplete);
            }
            let payload = data.split_to(len);
            records.push(Record { seq, payload });
        }
        Ok(Self { ack, records })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_layout() {
        let packet = Packet {
            ack: 0x0102,
            records: vec![Record::new(7, Bytes::from_static(b"hi")).unwrap(), Record::ack(8)],
        };
        let bytes = packet.encode();
        assert_eq!(
            bytes.as_ref(),
            &[0x01, 0x02, 0x00, 0x07, 0x02, b'h', b'i', 0x00, 0x08, 0x05, b'n', b'c', b'A', b'C', b'K']
        );
        let decoded = Packet::decode(bytes).unwrap();
        assert_eq!(decoded, packet);
        assert!(decoded.records[1].is_ack());
        assert!(!decoded.records[0].is_ack());
    }

    #[test]
    fn test_oversized_record() {
        assert!(Record::new(1, Bytes::from(vec![0u8; 255])).is_ok());
        assert!(matches!(
            Record::new(1, Bytes::from(vec![0u8; 256])),
            Err(WireError::Size(256))
        ));
    }

    #[test]
    fn test_truncated() {
        assert!(matches!(Packet::decode(Bytes::from_static(&[1])), Err(WireError::Incomplete)));
        assert!(matches!(
            Packet::decode(Bytes::from_static(&[0, 1, 0, 2])),
            Err(WireError::Incomplete)
        ));
        assert!(matches!(
            Packet::decode(Bytes::from_static(&[0, 1, 0, 2, 4, b'a'])),
            Err(WireError::Incomplete)
        ));
        assert_eq!(Packet::decode(Bytes::from_static(&[0, 9])).unwrap(), Packet::ack_only(9));
    }

    #[test]
    fn test_seq_after_wraps() {
        assert!(seq_after(2, 1));
        assert!(!seq_after(1, 1));
        assert!(!seq_after(1, 2));
        assert!(seq_after(0, u16::MAX));
        assert!(seq_after(3, 65530));
    }

    proptest! {
        #[test]
        fn decode_never_panics(data in proptest::collection::vec(any::<u8>(), 0..64)) {
            let _ = Packet::decode(Bytes::from(data));
        }
    }
}
