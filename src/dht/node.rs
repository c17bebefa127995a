//! DHT node module
//!
//! Represents a peer in the DHT network.

use crate::dht::key::Key;
use crate::dht::listener::Listener;
use std::fmt;
use std::net::SocketAddr;

/// A peer: an identifier plus the endpoints it advertises.
///
/// Equality and hashing use the identifier only, so the same peer seen
/// through different endpoints is still one routing-table entry.
#[derive(Debug, Clone)]
pub struct Node {
    /// Node identifier
    pub id: Key,
    /// Advertised endpoints
    pub listeners: Vec<Listener>,
}

impl Node {
    /// Create a new node
    pub fn new(id: Key, listeners: Vec<Listener>) -> Self {
        Self { id, listeners }
    }

    /// Create a node reachable on a single UDP address
    pub fn udp(id: Key, addr: SocketAddr) -> Self {
        Self::new(id, vec![Listener::Udp(addr)])
    }

    /// First advertised UDP address, used as the RPC destination
    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.listeners.iter().find_map(Listener::udp_addr)
    }

    /// XOR distance from this node to a key
    pub fn distance_to(&self, key: &Key) -> Key {
        self.id.distance(key)
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Node {}

impl std::hash::Hash for Node {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@", self.id)?;
        let urls: Vec<String> = self.listeners.iter().map(Listener::to_url).collect();
        f.write_str(&urls.join(","))
    }
}

impl std::str::FromStr for Node {
    type Err = anyhow::Error;

    /// Parse `<hex id>@<url>[,<url>...]`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, urls) = s
            .split_once('@')
            .ok_or_else(|| anyhow::anyhow!("Expected <id>@<listener url>, got: {}", s))?;
        let id: Key = id.parse()?;
        let listeners = Listener::parse_list(urls)?;
        if listeners.is_empty() {
            return Err(anyhow::anyhow!("Node {} has no listeners", id));
        }
        Ok(Node::new(id, listeners))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_new() {
        let id = Key::new([1u8; 20]);
        let addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        let node = Node::udp(id, addr);
        assert_eq!(node.id, id);
        assert_eq!(node.udp_addr(), Some(addr));
    }

    #[test]
    fn test_udp_addr_skips_tcp() {
        let node = Node::new(
            Key::random(),
            vec![
                Listener::Tcp("127.0.0.1:7000".parse().unwrap()),
                Listener::Udp("127.0.0.1:7001".parse().unwrap()),
            ],
        );
        assert_eq!(node.udp_addr(), Some("127.0.0.1:7001".parse().unwrap()));

        let tcp_only = Node::new(Key::random(), vec![Listener::Tcp("127.0.0.1:7000".parse().unwrap())]);
        assert!(tcp_only.udp_addr().is_none());
    }

    #[test]
    fn test_equality_by_id() {
        let id = Key::new([7u8; 20]);
        let a = Node::udp(id, "127.0.0.1:1000".parse().unwrap());
        let b = Node::udp(id, "127.0.0.1:2000".parse().unwrap());
        assert_eq!(a, b);

        let mut set = std::collections::HashSet::new();
        set.insert(a);
        assert!(!set.insert(b));
    }

    #[test]
    fn test_node_distance_to() {
        let node = Node::udp(Key::new([0xFFu8; 20]), "127.0.0.1:6881".parse().unwrap());
        assert_eq!(node.distance_to(&Key::zero()), Key::new([0xFFu8; 20]));
    }

    #[test]
    fn test_parse_display_roundtrip() {
        let text = format!("{}@udp://127.0.0.1:9000", "ab".repeat(20));
        let node: Node = text.parse().unwrap();
        assert_eq!(node.id, Key::new([0xABu8; 20]));
        assert_eq!(node.to_string(), text);
    }

    #[test]
    fn test_parse_rejects_missing_parts() {
        assert!("udp://127.0.0.1:9000".parse::<Node>().is_err());
        assert!(format!("{}@", "ab".repeat(20)).parse::<Node>().is_err());
        assert!("1234@udp://127.0.0.1:9000".parse::<Node>().is_err());
    }
}
