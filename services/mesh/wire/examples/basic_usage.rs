//! Basic usage example for the mesh wire formats.

use bytes::Bytes;
use mesh_wire::{EventMessage, InboundEnvelope, NodeId, OutboundEnvelope, Packet, Record};
use serde_json::json;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Mesh Wire Example ===\n");

    // 1. An application event addressed to two peers
    println!("1. Building an outbound relay frame...");
    let message = EventMessage::new("chat", vec![json!("hello mesh")]).encode()?;
    let frame = OutboundEnvelope::new(vec![NodeId::Num(2), NodeId::Num(3)], message).encode()?;
    println!("   {}", frame);

    // 2. What the relay forwards to each target
    println!("\n2. Decoding an inbound relay frame...");
    let inbound = InboundEnvelope::decode(r#"[1, 1371234567.5, "[\"chat\",\"hello mesh\"]"]"#)?;
    let event = EventMessage::decode(&inbound.payload)?;
    println!("   from {} at {}: {} {:?}", inbound.from, inbound.timestamp, event.kind, event.args);

    // 3. A NetChannel packet carrying one record
    println!("\n3. Encoding a NetChannel packet...");
    let packet = Packet {
        ack: 0,
        records: vec![Record::new(1, Bytes::from_static(b"ping"))?],
    };
    let bytes = packet.encode();
    println!("   {} bytes: {:02x?}", bytes.len(), bytes.as_ref());
    let decoded = Packet::decode(bytes)?;
    println!("   decoded {} record(s), ack {}", decoded.records.len(), decoded.ack);

    println!("\n=== Example completed successfully! ===");
    Ok(())
}
