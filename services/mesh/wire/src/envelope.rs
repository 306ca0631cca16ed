//! Relay envelopes.
//!
//! Clients send `[[targetId, ...], message]` (or a list of such pairs) to the
//! relay; the relay forwards `[senderId, timestamp, message]` to each target.
//! `message` is always the JSON text of an [`EventMessage`](crate::EventMessage).

use crate::error::WireError;
use crate::id::NodeId;
use serde_json::Value;
use tracing::trace;

/// Frame delivered by the relay to a client.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEnvelope {
    /// Sender id. Relay control messages carry the recipient's own id.
    pub from: NodeId,
    /// Relay clock, seconds since the unix epoch
    pub timestamp: f64,
    /// Event message JSON text
    pub payload: String,
}

impl InboundEnvelope {
    /// Create an envelope
    pub fn new(from: NodeId, timestamp: f64, payload: impl Into<String>) -> Self {
        Self {
            from,
            timestamp,
            payload: payload.into(),
        }
    }

    /// Encode as `[from, timestamp, payload]`.
    pub fn encode(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(&(
            &self.from,
            self.timestamp,
            &self.payload,
        ))?)
    }

    /// Decode `[from, timestamp, payload]`.
    pub fn decode(text: &str) -> Result<Self, WireError> {
        let (from, timestamp, payload): (Value, f64, Value) = serde_json::from_str(text)?;
        let from = NodeId::from_value(&from)
            .ok_or_else(|| WireError::Malformed(format!("invalid sender id: {}", from)))?;
        // Older relays embed the message array directly instead of its text.
        let payload = match payload {
            Value::String(text) => text,
            array @ Value::Array(_) => serde_json::to_string(&array)?,
            other => {
                return Err(WireError::Malformed(format!(
                    "invalid envelope payload: {}",
                    other
                )))
            }
        };
        Ok(Self {
            from,
            timestamp,
            payload,
        })
    }

    /// Parse the payload and peek at its event type.
    pub fn payload_kind(&self) -> Option<String> {
        let value: Value = serde_json::from_str(&self.payload).ok()?;
        value.get(0)?.as_str().map(str::to_string)
    }
}

/// Frame sent by a client to the relay.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEnvelope {
    /// Recipients
    pub targets: Vec<NodeId>,
    /// Event message JSON text
    pub message: String,
}

impl OutboundEnvelope {
    /// Create an envelope
    pub fn new(targets: Vec<NodeId>, message: impl Into<String>) -> Self {
        Self {
            targets,
            message: message.into(),
        }
    }

    /// Envelope addressed to a single peer.
    pub fn to(target: NodeId, message: impl Into<String>) -> Self {
        Self::new(vec![target], message)
    }

    /// Encode as `[[targets], message]`.
    pub fn encode(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(&(&self.targets, &self.message))?)
    }

    /// Encode several envelopes as one batched frame.
    pub fn encode_batch(envelopes: &[OutboundEnvelope]) -> Result<String, WireError> {
        let pairs: Vec<(&Vec<NodeId>, &String)> = envelopes
            .iter()
            .map(|e| (&e.targets, &e.message))
            .collect();
        Ok(serde_json::to_string(&pairs)?)
    }

    /// Decode a single or batched frame.
    pub fn decode(text: &str) -> Result<Vec<Self>, WireError> {
        let value: Value = serde_json::from_str(text)?;
        let items = value
            .as_array()
            .ok_or_else(|| WireError::Malformed("envelope is not an array".to_string()))?;

        // A batch starts with a pair whose own first element is the target list.
        let batched = items
            .first()
            .and_then(|first| first.get(0))
            .map(Value::is_array)
            .unwrap_or(false);

        if batched {
            trace!("decoding batch of {} envelopes", items.len());
            items.iter().map(Self::from_pair).collect()
        } else {
            Ok(vec![Self::from_pair(&value)?])
        }
    }

    fn from_pair(pair: &Value) -> Result<Self, WireError> {
        let (targets, message) = match pair.as_array().map(Vec::as_slice) {
            Some([targets, message]) => (targets, message),
            _ => {
                return Err(WireError::Malformed(format!(
                    "envelope is not a [targets, message] pair: {}",
                    pair
                )))
            }
        };
        let targets = targets
            .as_array()
            .ok_or_else(|| WireError::Malformed("targets is not an array".to_string()))?
            .iter()
            .map(|t| {
                NodeId::from_value(t)
                    .ok_or_else(|| WireError::Malformed(format!("invalid target id: {}", t)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let message = match message {
            Value::String(text) => text.clone(),
            other => serde_json::to_string(other)?,
        };
        Ok(Self { targets, message })
    }
}
