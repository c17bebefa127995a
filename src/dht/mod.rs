//! DHT (Distributed Hash Table) module
//!
//! Implements a Kademlia node: XOR-metric routing, UDP RPCs and iterative
//! lookups over a pluggable key-value store.

pub mod key;
pub mod listener;
pub mod node;
pub mod routing;
pub mod message;
pub mod events;
pub mod client;
pub mod server;
pub mod lookup;
pub mod maintenance;
pub mod dht;

// Re-exports for convenience
pub use key::{Key, ID_BITS, ID_BYTES};
pub use listener::Listener;
pub use node::Node;
pub use routing::{EvictionPolicy, KBucket, RoutingTable, TouchOutcome, DEFAULT_K};
pub use message::{Body, Message, MessageKind};
pub use events::{Event, EventBus, EventListener};
pub use client::{KademliaClient, ValueReply, ValueSource, DEFAULT_RPC_TIMEOUT};
pub use server::KademliaServer;
pub use lookup::{find_closest_nodes, lookup_nodes, lookup_value, DEFAULT_MAX_LOOKUP_DEPTH};
pub use maintenance::Maintenance;
pub use dht::Kademlia;
