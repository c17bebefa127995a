//! kademlia-dht
//!
//! A Kademlia distributed hash table node with iterative lookups, bucket
//! refresh and key republishing over UDP.

pub mod dht;
pub mod storage;
pub mod cli;
pub mod error;

pub use error::DhtError;

pub use dht::{
    Kademlia, Key, Node, Listener, KBucket, RoutingTable, EvictionPolicy, TouchOutcome,
    Event, EventBus, EventListener, Message, MessageKind, Body,
    KademliaClient, KademliaServer, Maintenance, ValueReply, ValueSource,
    find_closest_nodes, lookup_nodes, lookup_value,
    DEFAULT_K, DEFAULT_MAX_LOOKUP_DEPTH, DEFAULT_RPC_TIMEOUT, ID_BITS, ID_BYTES,
};
pub use storage::{Storage, StoredValue, InMemoryStorage};
pub use cli::{CliArgs, Configuration};
