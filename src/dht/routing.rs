//! DHT routing table module
//!
//! Implements the Kademlia routing table: one k-bucket per XOR-distance
//! bit-length from the local node, each behind its own lock.

use crate::dht::key::{Key, ID_BITS};
use crate::dht::node::Node;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Default Kademlia bucket size
pub const DEFAULT_K: usize = 20;

/// What to do with a new peer whose bucket is already full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Keep the existing members and drop the newcomer
    DropNew,
    /// Ping the least-recently-seen member and replace it if it does not answer
    #[default]
    PingAndReplace,
}

/// Result of touching a peer in the routing table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TouchOutcome {
    /// The peer was new and has been added
    Inserted,
    /// The peer was already known and moved to the most-recently-seen position
    Refreshed,
    /// The peer was not added (it is the local node, or its bucket is full)
    Ignored,
    /// The bucket is full; the caller should probe `oldest` and then call
    /// [`RoutingTable::resolve_probe`]
    Full { oldest: Node },
}

/// A bucket in the routing table
#[derive(Debug, Clone)]
pub struct KBucket {
    /// Nodes in this bucket, least-recently-seen first
    nodes: Vec<Node>,
    /// Maximum number of nodes
    capacity: usize,
    /// When this bucket was last modified
    last_changed: Instant,
    /// Whether a liveness probe for the oldest member is in flight
    probing: bool,
}

impl KBucket {
    /// Create a new KBucket holding at most `capacity` nodes
    pub fn new(capacity: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(capacity),
            capacity,
            last_changed: Instant::now(),
            probing: false,
        }
    }

    /// Add a node to the bucket, or move it to the most-recently-seen position
    fn touch(&mut self, node: Node, policy: EvictionPolicy) -> TouchOutcome {
        if let Some(pos) = self.nodes.iter().position(|n| n.id == node.id) {
            self.nodes.remove(pos);
            self.nodes.push(node);
            self.last_changed = Instant::now();
            return TouchOutcome::Refreshed;
        }

        if self.nodes.len() < self.capacity {
            self.nodes.push(node);
            self.last_changed = Instant::now();
            return TouchOutcome::Inserted;
        }

        match (policy, self.nodes.first()) {
            (EvictionPolicy::PingAndReplace, Some(oldest)) if !self.probing => {
                self.probing = true;
                TouchOutcome::Full { oldest: oldest.clone() }
            }
            _ => TouchOutcome::Ignored,
        }
    }

    /// Remove a node from the bucket
    fn remove_node(&mut self, id: &Key) -> Option<Node> {
        let pos = self.nodes.iter().position(|n| n.id == *id)?;
        self.last_changed = Instant::now();
        Some(self.nodes.remove(pos))
    }

    /// Find a node by ID
    pub fn find_node(&self, id: &Key) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == *id)
    }

    /// Nodes in recency order, least-recently-seen first
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Get the number of nodes in the bucket
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if the bucket is empty
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Check if the bucket is full
    pub fn is_full(&self) -> bool {
        self.nodes.len() >= self.capacity
    }

    /// When this bucket last changed
    pub fn last_changed(&self) -> Instant {
        self.last_changed
    }
}

/// Kademlia routing table
///
/// Bucket `n` (1..=160) holds peers whose XOR distance from the local ID has
/// bit-length `n`. The local node itself never enters the table.
#[derive(Debug)]
pub struct RoutingTable {
    /// Our node ID
    local_id: Key,
    /// Bucket size
    k: usize,
    /// Buckets for bit-lengths 1..=160, stored at index `n - 1`
    buckets: Vec<Mutex<KBucket>>,
}

impl RoutingTable {
    /// Create a new routing table
    pub fn new(local_id: Key, k: usize) -> Self {
        let buckets = (0..ID_BITS).map(|_| Mutex::new(KBucket::new(k))).collect();
        Self { local_id, k, buckets }
    }

    /// Our node ID
    pub fn local_id(&self) -> Key {
        self.local_id
    }

    /// Bucket size
    pub fn k(&self) -> usize {
        self.k
    }

    /// Bit-length of the distance from the local ID, or `None` for the local ID itself
    pub fn bucket_for(&self, id: &Key) -> Option<usize> {
        match self.local_id.distance(id).bit_length() {
            0 => None,
            n => Some(n),
        }
    }

    /// Add a node, or mark it as most recently seen
    pub fn add_or_touch(&self, node: Node, policy: EvictionPolicy) -> TouchOutcome {
        let Some(n) = self.bucket_for(&node.id) else {
            return TouchOutcome::Ignored;
        };
        self.buckets[n - 1].lock().touch(node, policy)
    }

    /// Finish a liveness probe started by a [`TouchOutcome::Full`].
    ///
    /// If `oldest` answered it is refreshed and `candidate` is dropped.
    /// Otherwise `oldest` is evicted, `candidate` takes its place and the
    /// evicted node is returned.
    pub fn resolve_probe(&self, oldest: &Key, alive: bool, candidate: Node) -> Option<Node> {
        let n = self.bucket_for(oldest)?;
        let mut bucket = self.buckets[n - 1].lock();
        bucket.probing = false;

        if alive {
            if let Some(node) = bucket.remove_node(oldest) {
                bucket.nodes.push(node);
            }
            return None;
        }

        let evicted = bucket.remove_node(oldest);
        if bucket.find_node(&candidate.id).is_none()
            && !bucket.is_full()
            && self.bucket_for(&candidate.id) == Some(n)
        {
            bucket.nodes.push(candidate);
        }
        evicted
    }

    /// Peers ordered by ascending XOR distance to `key`, truncated to `limit`
    pub fn closest_to(&self, key: &Key, limit: Option<usize>) -> Vec<Node> {
        let mut all_nodes = self.nodes();
        all_nodes.sort_by(|a, b| key.cmp_distance(&a.id, &b.id));
        if let Some(limit) = limit {
            all_nodes.truncate(limit);
        }
        all_nodes
    }

    /// Remove a node from the routing table
    pub fn remove(&self, id: &Key) -> Option<Node> {
        let n = self.bucket_for(id)?;
        self.buckets[n - 1].lock().remove_node(id)
    }

    /// Find a node by ID
    pub fn find_node(&self, id: &Key) -> Option<Node> {
        let n = self.bucket_for(id)?;
        self.buckets[n - 1].lock().find_node(id).cloned()
    }

    /// Check whether a node is in the table
    pub fn contains(&self, id: &Key) -> bool {
        self.find_node(id).is_some()
    }

    /// Snapshot of bucket `n` (1..=160)
    pub fn bucket(&self, n: usize) -> Option<KBucket> {
        if n == 0 || n > ID_BITS {
            return None;
        }
        Some(self.buckets[n - 1].lock().clone())
    }

    /// Snapshot of every bucket, paired with its bit-length
    pub fn buckets(&self) -> Vec<(usize, KBucket)> {
        self.buckets
            .iter()
            .enumerate()
            .map(|(i, b)| (i + 1, b.lock().clone()))
            .collect()
    }

    /// Get all nodes in the routing table
    pub fn nodes(&self) -> Vec<Node> {
        self.buckets
            .iter()
            .flat_map(|b| b.lock().nodes.clone())
            .collect()
    }

    /// Get the number of nodes in the routing table
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().len()).sum()
    }

    /// Check whether the table knows no peers
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
