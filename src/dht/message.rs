//! DHT message module
//!
//! Defines the RPC messages exchanged between nodes and their bencoded
//! datagram encoding.

use crate::dht::key::Key;
use crate::dht::listener::Listener;
use crate::dht::node::Node;
use crate::error::{DhtError, Result};
use serde::{Deserialize, Serialize};

/// Largest datagram a node will send or accept
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// RPC message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Ping,
    Pong,
    FindNode,
    Nodes,
    FindValue,
    Value,
    Store,
    Stored,
}

impl MessageKind {
    /// Wire name of this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
            MessageKind::FindNode => "find_node",
            MessageKind::Nodes => "nodes",
            MessageKind::FindValue => "find_value",
            MessageKind::Value => "value",
            MessageKind::Store => "store",
            MessageKind::Stored => "stored",
        }
    }

    /// Parse a wire name
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "ping" => MessageKind::Ping,
            "pong" => MessageKind::Pong,
            "find_node" => MessageKind::FindNode,
            "nodes" => MessageKind::Nodes,
            "find_value" => MessageKind::FindValue,
            "value" => MessageKind::Value,
            "store" => MessageKind::Store,
            "stored" => MessageKind::Stored,
            _ => return None,
        })
    }

    /// Whether this kind is a request (as opposed to a reply)
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            MessageKind::Ping | MessageKind::FindNode | MessageKind::FindValue | MessageKind::Store
        )
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific message content
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// Liveness check
    Ping,
    /// Reply to [`Body::Ping`]; the responder's identity is the message origin
    Pong,
    /// Ask for the peers closest to `target`
    FindNode { target: Key },
    /// Reply carrying the responder's closest known peers
    Nodes { nodes: Vec<Node> },
    /// Ask for the value under `key`, or the closest peers if absent
    FindValue { key: Key },
    /// Reply carrying a stored value
    Value { key: Key, value: String },
    /// Ask the receiver to store a value
    Store { key: Key, value: String },
    /// Acknowledgement of [`Body::Store`]
    Stored { key: Key },
}

impl Body {
    /// The kind of this body
    pub fn kind(&self) -> MessageKind {
        match self {
            Body::Ping => MessageKind::Ping,
            Body::Pong => MessageKind::Pong,
            Body::FindNode { .. } => MessageKind::FindNode,
            Body::Nodes { .. } => MessageKind::Nodes,
            Body::FindValue { .. } => MessageKind::FindValue,
            Body::Value { .. } => MessageKind::Value,
            Body::Store { .. } => MessageKind::Store,
            Body::Stored { .. } => MessageKind::Stored,
        }
    }
}

/// A complete RPC message: correlation id, sender and content.
///
/// A reply reuses the `seq` of the request it answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Correlation id
    pub seq: u32,
    /// Sender identity and endpoints
    pub origin: Node,
    /// Kind-specific content
    pub body: Body,
}

/// Flat on-the-wire form. Every field is always present so the encoding
/// needs nothing beyond bencode strings, integers and lists.
#[derive(Debug, Default, Serialize, Deserialize)]
struct WireMessage {
    kind: String,
    seq: u32,
    origin: WireNode,
    #[serde(default)]
    target: String,
    #[serde(default)]
    key: String,
    #[serde(default)]
    value: String,
    #[serde(default)]
    nodes: Vec<WireNode>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WireNode {
    id: String,
    listeners: Vec<String>,
}

impl WireNode {
    fn from_node(node: &Node) -> Self {
        Self {
            id: node.id.to_hex(),
            listeners: node.listeners.iter().map(Listener::to_url).collect(),
        }
    }

    fn into_node(self) -> Result<Node> {
        let id = parse_key(&self.id, "node id")?;
        let listeners = self
            .listeners
            .iter()
            .map(|url| Listener::from_wire(url))
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(|e| DhtError::protocol_error_with_source("Invalid listener in DHT message", e.to_string()))?;
        Ok(Node::new(id, listeners))
    }
}

fn parse_key(hex_str: &str, field: &str) -> Result<Key> {
    Key::from_hex(hex_str).ok_or_else(|| DhtError::protocol_error(format!("Invalid {} in DHT message: {:?}", field, hex_str)))
}

impl Message {
    /// Create a new message
    pub fn new(seq: u32, origin: Node, body: Body) -> Self {
        Self { seq, origin, body }
    }

    /// The kind of this message
    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    /// Build the reply to this message, reusing its correlation id
    pub fn reply(&self, origin: Node, body: Body) -> Message {
        Message::new(self.seq, origin, body)
    }

    /// Serialize DHT message to bytes
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut wire = WireMessage {
            kind: self.kind().as_str().to_string(),
            seq: self.seq,
            origin: WireNode::from_node(&self.origin),
            ..Default::default()
        };

        match &self.body {
            Body::Ping | Body::Pong => {}
            Body::FindNode { target } => wire.target = target.to_hex(),
            Body::Nodes { nodes } => wire.nodes = nodes.iter().map(WireNode::from_node).collect(),
            Body::FindValue { key } | Body::Stored { key } => wire.key = key.to_hex(),
            Body::Value { key, value } | Body::Store { key, value } => {
                wire.key = key.to_hex();
                wire.value = value.clone();
            }
        }

        let bytes = serde_bencode::ser::to_bytes(&wire)
            .map_err(|e| DhtError::protocol_error_with_source("Failed to serialize DHT message", e.to_string()))?;
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(DhtError::protocol_error(format!(
                "DHT message of {} bytes exceeds the datagram limit of {} bytes",
                bytes.len(),
                MAX_DATAGRAM_SIZE
            )));
        }
        Ok(bytes)
    }

    /// Deserialize DHT message from bytes
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let wire: WireMessage = serde_bencode::de::from_bytes(data)?;

        let kind = MessageKind::parse(&wire.kind)
            .ok_or_else(|| DhtError::protocol_error(format!("Unknown DHT message kind: {:?}", wire.kind)))?;
        let origin = wire.origin.into_node()?;

        let body = match kind {
            MessageKind::Ping => Body::Ping,
            MessageKind::Pong => Body::Pong,
            MessageKind::FindNode => Body::FindNode {
                target: parse_key(&wire.target, "target")?,
            },
            MessageKind::Nodes => Body::Nodes {
                nodes: wire
                    .nodes
                    .into_iter()
                    .map(WireNode::into_node)
                    .collect::<Result<Vec<_>>>()?,
            },
            MessageKind::FindValue => Body::FindValue {
                key: parse_key(&wire.key, "key")?,
            },
            MessageKind::Value => Body::Value {
                key: parse_key(&wire.key, "key")?,
                value: wire.value,
            },
            MessageKind::Store => Body::Store {
                key: parse_key(&wire.key, "key")?,
                value: wire.value,
            },
            MessageKind::Stored => Body::Stored {
                key: parse_key(&wire.key, "key")?,
            },
        };

        Ok(Message::new(wire.seq, origin, body))
    }
}

/// Helper function to generate a random correlation id
pub fn generate_seq() -> u32 {
    use rand::Rng;
    rand::thread_rng().gen()
}
