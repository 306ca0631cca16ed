//! Peer identifiers as carried on the relay wire.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Relay-assigned peer identity.
///
/// The relay hands out integer ids, but the envelope format is plain JSON so
/// string ids are accepted as well and compared exactly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeId {
    /// Numeric id (what the relay assigns)
    Num(u64),
    /// Opaque string id
    Str(String),
}

impl NodeId {
    /// Parse an id from a JSON value, accepting non-negative integers and strings.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => n.as_u64().map(NodeId::Num),
            serde_json::Value::String(s) => Some(NodeId::Str(s.clone())),
            _ => None,
        }
    }

    /// JSON representation of this id.
    pub fn to_value(&self) -> serde_json::Value {
        match self {
            NodeId::Num(n) => serde_json::Value::from(*n),
            NodeId::Str(s) => serde_json::Value::from(s.as_str()),
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeId::Num(n) => write!(f, "{}", n),
            NodeId::Str(s) => f.write_str(s),
        }
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        NodeId::Num(id)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        NodeId::Str(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        NodeId::Str(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_untagged_serde() {
        let ids: Vec<NodeId> = serde_json::from_value(json!([3, "abc"])).unwrap();
        assert_eq!(ids, vec![NodeId::Num(3), NodeId::from("abc")]);
        assert_eq!(serde_json::to_string(&ids).unwrap(), r#"[3,"abc"]"#);
    }

    #[test]
    fn test_from_value_rejects_other_shapes() {
        assert_eq!(NodeId::from_value(&json!(7)), Some(NodeId::Num(7)));
        assert_eq!(NodeId::from_value(&json!(-1)), None);
        assert_eq!(NodeId::from_value(&json!(null)), None);
        assert_eq!(NodeId::from_value(&json!([1])), None);
    }
}
