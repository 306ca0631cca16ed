//! Application event messages and the reserved event type tables.
//!
//! Every payload exchanged between nodes is a JSON array whose first element
//! is the event type and whose remaining elements are the arguments:
//!
//! ```text
//! ["chat", "hi", {"color": "red"}]
//! ["bind", "chat"]
//! ["rtc_offer", {"type": "offer", "sdp": "v=0..."}]
//! ```

use crate::error::WireError;
use crate::id::NodeId;
use serde::Serialize;
use serde_json::Value;

/// Channel opened
pub const OPEN: &str = "open";
/// Channel closed
pub const CLOSE: &str = "close";
/// Transport error
pub const ERROR: &str = "error";
/// Inbound data message (channel level only)
pub const MESSAGE: &str = "message";
/// Relay handshake: list of peers already in the mesh
pub const CONNECT: &str = "connect";
/// A peer joined the mesh
pub const ENTER: &str = "enter";
/// A peer left the mesh
pub const LEAVE: &str = "leave";
/// Remote peer declares interest in an event type
pub const BIND: &str = "bind";
/// Remote peer withdraws interest in an event type
pub const UNBIND: &str = "unbind";

/// Direct transport offer
pub const RTC_OFFER: &str = "rtc_offer";
/// Direct transport answer
pub const RTC_ANSWER: &str = "rtc_answer";
/// Direct transport ICE candidate
pub const RTC_ICE_CANDIDATE: &str = "rtc_iceCandidate";

/// Lifecycle and topology types. Never announced to peers and never
/// triggered by applications.
pub const CONTROL_EVENTS: [&str; 8] = [OPEN, CLOSE, ERROR, CONNECT, ENTER, LEAVE, BIND, UNBIND];

/// Negotiation types used internally by direct channels.
pub const NEGOTIATION_EVENTS: [&str; 3] = [RTC_OFFER, RTC_ANSWER, RTC_ICE_CANDIDATE];

/// Whether `kind` is a lifecycle/topology type.
pub fn is_control(kind: &str) -> bool {
    CONTROL_EVENTS.contains(&kind)
}

/// Whether `kind` is a direct transport negotiation type.
pub fn is_negotiation(kind: &str) -> bool {
    NEGOTIATION_EVENTS.contains(&kind)
}

/// Whether applications are barred from binding or triggering `kind`.
pub fn is_protected(kind: &str) -> bool {
    is_control(kind) || is_negotiation(kind)
}

/// Convert any serializable value into an argument list.
///
/// Arrays (including tuples) are spread into individual arguments, every
/// other value becomes a single argument and unit becomes no arguments.
pub fn to_args<T: Serialize + ?Sized>(args: &T) -> Result<Vec<Value>, WireError> {
    match serde_json::to_value(args)? {
        Value::Array(items) => Ok(items),
        Value::Null => Ok(Vec::new()),
        other => Ok(vec![other]),
    }
}

/// One `[type, ...args]` event message.
#[derive(Debug, Clone, PartialEq)]
pub struct EventMessage {
    /// Event type
    pub kind: String,
    /// Event arguments
    pub args: Vec<Value>,
}

impl EventMessage {
    /// Create a message
    pub fn new(kind: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            kind: kind.into(),
            args,
        }
    }

    /// Control message carrying peer ids (`connect`, `enter`, `leave`).
    pub fn with_ids(kind: &str, ids: &[NodeId]) -> Self {
        Self::new(kind, ids.iter().map(NodeId::to_value).collect())
    }

    /// Encode as a JSON array string.
    pub fn encode(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(&self.to_value())?)
    }

    /// Decode a JSON array string.
    pub fn decode(text: &str) -> Result<Self, WireError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    /// Build from an already parsed JSON array.
    pub fn from_value(value: Value) -> Result<Self, WireError> {
        let mut items = match value {
            Value::Array(items) => items,
            other => {
                return Err(WireError::Malformed(format!(
                    "event message is not an array: {}",
                    other
                )))
            }
        };
        if items.is_empty() {
            return Err(WireError::Malformed("empty event message".to_string()));
        }
        let kind = match items.remove(0) {
            Value::String(kind) => kind,
            other => {
                return Err(WireError::Malformed(format!(
                    "event type is not a string: {}",
                    other
                )))
            }
        };
        Ok(Self { kind, args: items })
    }

    /// The `[type, ...args]` JSON array.
    pub fn to_value(&self) -> Value {
        let mut items = Vec::with_capacity(self.args.len() + 1);
        items.push(Value::String(self.kind.clone()));
        items.extend(self.args.iter().cloned());
        Value::Array(items)
    }

    /// Arguments interpreted as peer ids, skipping anything that is not an id.
    pub fn ids(&self) -> Vec<NodeId> {
        self.args.iter().filter_map(NodeId::from_value).collect()
    }

    /// First argument as a string (the type carried by `bind`/`unbind`).
    pub fn first_str(&self) -> Option<&str> {
        self.args.first().and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_encode_decode() {
        let msg = EventMessage::new("chat", vec![json!("hi"), json!({"n": 1})]);
        let text = msg.encode().unwrap();
        assert_eq!(text, r#"["chat","hi",{"n":1}]"#);
        assert_eq!(EventMessage::decode(&text).unwrap(), msg);
    }

    #[test]
    fn test_decode_rejects_bad_shapes() {
        assert!(EventMessage::decode("{}").is_err());
        assert!(EventMessage::decode("[]").is_err());
        assert!(EventMessage::decode("[1, 2]").is_err());
        assert!(EventMessage::decode("not json").is_err());
    }

    #[test]
    fn test_control_ids() {
        let msg = EventMessage::with_ids(CONNECT, &[NodeId::Num(2), NodeId::Num(5)]);
        assert_eq!(msg.encode().unwrap(), r#"["connect",2,5]"#);
        assert_eq!(msg.ids(), vec![NodeId::Num(2), NodeId::Num(5)]);
    }

    #[test]
    fn test_protected_tables() {
        for kind in ["open", "close", "error", "connect", "enter", "leave", "bind", "unbind"] {
            assert!(is_control(kind));
            assert!(is_protected(kind));
        }
        for kind in ["rtc_offer", "rtc_answer", "rtc_iceCandidate"] {
            assert!(is_negotiation(kind));
            assert!(is_protected(kind));
        }
        assert!(!is_protected("chat"));
        assert!(!is_protected("message"));
    }

    #[test]
    fn test_to_args() {
        assert_eq!(to_args(&("hi", 2)).unwrap(), vec![json!("hi"), json!(2)]);
        assert_eq!(to_args("hi").unwrap(), vec![json!("hi")]);
        assert_eq!(to_args(&()).unwrap(), Vec::<Value>::new());

        let mut bad = HashMap::new();
        bad.insert((1, 2), "tuple keys are not valid json object keys");
        assert!(to_args(&bad).is_err());
    }
}
