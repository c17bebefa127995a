//! Iterative lookups
//!
//! Both lookups expand a frontier of peers through the replies they get.
//! Each lookup's state lives in an `Arc` shared by the continuations of its
//! in-flight queries; when the last continuation runs or is dropped on
//! timeout, the state drops and the lookup completes.
//!
//! Every peer is queried at most once per lookup and recursion stops after
//! `max_depth` rounds.

use crate::dht::client::{Continuation, KademliaClient, ValueReply};
use crate::dht::events::Event;
use crate::dht::key::Key;
use crate::dht::node::Node;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Default cap on lookup rounds
pub const DEFAULT_MAX_LOOKUP_DEPTH: usize = 8;

/// Pick the peers worth querying next: not ourselves, not seen before,
/// closest first, at most `limit` of them.
fn select_unseen(seen: &Mutex<HashSet<Key>>, local: &Key, target: &Key, mut candidates: Vec<Node>, limit: usize) -> Vec<Node> {
    candidates.sort_by(|a, b| target.cmp_distance(&a.id, &b.id));
    let mut seen = seen.lock();
    candidates
        .into_iter()
        .filter(|node| node.id != *local && seen.insert(node.id))
        .take(limit)
        .collect()
}

struct NodeLookup {
    client: Arc<KademliaClient>,
    target: Key,
    max_depth: usize,
    seen: Mutex<HashSet<Key>>,
    responded: Mutex<Vec<Node>>,
    on_complete: Mutex<Option<Continuation<Vec<Node>>>>,
}

impl NodeLookup {
    fn query(self: &Arc<Self>, candidates: Vec<Node>, depth: usize) {
        let local = self.client.local().id;
        let k = self.client.routing().k();
        let batch = select_unseen(&self.seen, &local, &self.target, candidates, k);
        trace!("Node lookup for {} round {}: querying {} peers", self.target, depth, batch.len());

        for node in batch {
            let lookup = self.clone();
            let responder = node.clone();
            self.client.send_find_node(&node, self.target, move |nodes| {
                lookup.responded.lock().push(responder);
                for discovered in &nodes {
                    lookup.client.touch(discovered.clone());
                }
                if depth < lookup.max_depth {
                    lookup.query(nodes, depth + 1);
                }
            });
        }
    }
}

impl Drop for NodeLookup {
    fn drop(&mut self) {
        let mut closest = std::mem::take(self.responded.get_mut());
        closest.sort_by(|a, b| self.target.cmp_distance(&a.id, &b.id));
        closest.dedup_by(|a, b| a.id == b.id);
        closest.truncate(self.client.routing().k());

        debug!("Node lookup for {} finished with {} responders", self.target, closest.len());
        self.client.events().emit(Event::NodeLookupCompleted {
            target: self.target,
            closest: closest.len(),
        });
        if let Some(on_complete) = self.on_complete.get_mut().take() {
            on_complete(closest);
        }
    }
}

/// Start an iterative node lookup for `target` from `seeds`.
///
/// Returned peers are merged into the routing table as they arrive.
/// `on_complete` receives the up to k closest peers that answered, once the
/// last in-flight query has resolved. With no usable seeds it runs at once
/// with an empty list.
pub fn lookup_nodes(
    client: &Arc<KademliaClient>,
    target: Key,
    seeds: Vec<Node>,
    max_depth: usize,
    on_complete: impl FnOnce(Vec<Node>) + Send + 'static,
) {
    let lookup = Arc::new(NodeLookup {
        client: client.clone(),
        target,
        max_depth: max_depth.max(1),
        seen: Mutex::new(HashSet::new()),
        responded: Mutex::new(Vec::new()),
        on_complete: Mutex::new(Some(Box::new(on_complete))),
    });
    lookup.query(seeds, 1);
}

/// Awaitable form of [`lookup_nodes`]
pub async fn find_closest_nodes(client: &Arc<KademliaClient>, target: Key, seeds: Vec<Node>, max_depth: usize) -> Vec<Node> {
    let (tx, rx) = oneshot::channel();
    lookup_nodes(client, target, seeds, max_depth, move |closest| {
        let _ = tx.send(closest);
    });
    rx.await.unwrap_or_default()
}

struct ValueLookup {
    client: Arc<KademliaClient>,
    key: Key,
    max_depth: usize,
    seen: Mutex<HashSet<Key>>,
    found: AtomicBool,
    on_value: Mutex<Option<Continuation<ValueReply>>>,
}

impl ValueLookup {
    fn query(self: &Arc<Self>, candidates: Vec<Node>, depth: usize) {
        if self.found.load(Ordering::Acquire) {
            return;
        }
        let local = self.client.local().id;
        let k = self.client.routing().k();
        let batch = select_unseen(&self.seen, &local, &self.key, candidates, k);
        trace!("Value lookup for {} round {}: querying {} peers", self.key, depth, batch.len());

        for node in batch {
            let on_nodes = self.clone();
            let on_value = self.clone();
            self.client.send_find_value(
                &node,
                self.key,
                move |nodes| {
                    for discovered in &nodes {
                        on_nodes.client.touch(discovered.clone());
                    }
                    if depth < on_nodes.max_depth {
                        on_nodes.query(nodes, depth + 1);
                    }
                },
                move |reply| on_value.deliver(reply),
            );
        }
    }

    fn deliver(&self, reply: ValueReply) {
        if self.found.swap(true, Ordering::AcqRel) {
            trace!("Discarding late value for {} from {:?}", self.key, reply.source);
            return;
        }
        debug!("Value for {} found via {:?}", self.key, reply.source);
        let on_value = self.on_value.lock().take();
        if let Some(on_value) = on_value {
            on_value(reply);
        }
    }
}

impl Drop for ValueLookup {
    fn drop(&mut self) {
        let found = *self.found.get_mut();
        debug!("Value lookup for {} finished, found: {}", self.key, found);
        self.client.events().emit(Event::ValueLookupCompleted { key: self.key, found });
    }
}

/// Start an iterative value lookup for `key` from `seeds`.
///
/// `on_value` runs at most once, with the first value any peer returns.
/// It never runs if no peer holds the key.
pub fn lookup_value(
    client: &Arc<KademliaClient>,
    key: Key,
    seeds: Vec<Node>,
    max_depth: usize,
    on_value: impl FnOnce(ValueReply) + Send + 'static,
) {
    let lookup = Arc::new(ValueLookup {
        client: client.clone(),
        key,
        max_depth: max_depth.max(1),
        seen: Mutex::new(HashSet::new()),
        found: AtomicBool::new(false),
        on_value: Mutex::new(Some(Box::new(on_value))),
    });
    lookup.query(seeds, 1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::client::ValueSource;
    use crate::dht::events::EventBus;
    use crate::dht::message::{Body, Message, MAX_DATAGRAM_SIZE};
    use crate::dht::routing::{EvictionPolicy, RoutingTable};
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::net::UdpSocket;

    async fn client(timeout: Duration) -> Arc<KademliaClient> {
        let id = Key::random();
        KademliaClient::bind(
            "127.0.0.1:0".parse().unwrap(),
            Node::udp(id, "127.0.0.1:1".parse().unwrap()),
            Arc::new(RoutingTable::new(id, 20)),
            Arc::new(EventBus::new()),
            timeout,
            EvictionPolicy::DropNew,
        )
        .await
        .unwrap()
    }

    /// A scripted peer answering every request with the same body
    async fn scripted_peer(answer: impl Fn(&Node) -> Option<Body> + Send + 'static) -> (Node, Arc<AtomicUsize>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let node = Node::udp(Key::random(), socket.local_addr().unwrap());
        let requests = Arc::new(AtomicUsize::new(0));
        let counter = requests.clone();
        let me = node.clone();
        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                let Ok((len, from)) = socket.recv_from(&mut buffer).await else {
                    break;
                };
                let Ok(request) = Message::deserialize(&buffer[..len]) else {
                    continue;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                if let Some(body) = answer(&me) {
                    let bytes = request.reply(me.clone(), body).serialize().unwrap();
                    let _ = socket.send_to(&bytes, from).await;
                }
            }
        });
        (node, requests)
    }

    fn dead_node() -> Node {
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        Node::udp(Key::random(), addr)
    }

    #[tokio::test]
    async fn test_no_seeds_completes_immediately() {
        let client = client(Duration::from_secs(1)).await;
        let closest = tokio::time::timeout(
            Duration::from_millis(100),
            find_closest_nodes(&client, Key::random(), vec![], DEFAULT_MAX_LOOKUP_DEPTH),
        )
        .await
        .unwrap();
        assert!(closest.is_empty());
    }

    #[tokio::test]
    async fn test_node_lookup_follows_referrals() {
        let client = client(Duration::from_millis(300)).await;
        let (far, far_requests) = scripted_peer(|_| Some(Body::Nodes { nodes: vec![] })).await;
        let referral = far.clone();
        let (near, _) = scripted_peer(move |_| Some(Body::Nodes { nodes: vec![referral.clone()] })).await;

        let closest = find_closest_nodes(&client, Key::random(), vec![near.clone()], DEFAULT_MAX_LOOKUP_DEPTH).await;

        assert_eq!(closest.len(), 2);
        assert!(closest.contains(&near));
        assert!(closest.contains(&far));
        assert!(client.routing().contains(&near.id));
        assert!(client.routing().contains(&far.id));
        assert_eq!(far_requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_node_lookup_queries_each_peer_once() {
        let client = client(Duration::from_millis(300)).await;
        // Both peers point at each other and at themselves
        let (a, a_requests) = scripted_peer(|me| Some(Body::Nodes { nodes: vec![me.clone()] })).await;
        let referral = a.clone();
        let (b, b_requests) = scripted_peer(move |me| Some(Body::Nodes { nodes: vec![me.clone(), referral.clone()] })).await;

        let closest = find_closest_nodes(&client, Key::random(), vec![a.clone(), b.clone(), b.clone()], DEFAULT_MAX_LOOKUP_DEPTH).await;

        assert_eq!(closest.len(), 2);
        assert_eq!(a_requests.load(Ordering::SeqCst), 1);
        assert_eq!(b_requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_node_lookup_respects_depth_cap() {
        let client = client(Duration::from_millis(300)).await;
        let (third, third_requests) = scripted_peer(|_| Some(Body::Nodes { nodes: vec![] })).await;
        let referral = third.clone();
        let (second, second_requests) = scripted_peer(move |_| Some(Body::Nodes { nodes: vec![referral.clone()] })).await;
        let referral = second.clone();
        let (first, _) = scripted_peer(move |_| Some(Body::Nodes { nodes: vec![referral.clone()] })).await;

        let closest = find_closest_nodes(&client, Key::random(), vec![first], 2).await;

        assert_eq!(closest.len(), 2);
        assert_eq!(second_requests.load(Ordering::SeqCst), 1);
        assert_eq!(third_requests.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_node_lookup_completes_after_timeouts() {
        let client = client(Duration::from_millis(100)).await;
        let completed = Arc::new(AtomicUsize::new(0));
        let counter = completed.clone();
        client.events().add("test", move |event| {
            if let Event::NodeLookupCompleted { closest: 0, .. } = event {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let closest = tokio::time::timeout(
            Duration::from_secs(2),
            find_closest_nodes(&client, Key::random(), vec![dead_node(), dead_node()], DEFAULT_MAX_LOOKUP_DEPTH),
        )
        .await
        .unwrap();
        assert!(closest.is_empty());
        assert_eq!(completed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_value_lookup_first_value_wins() {
        let client = client(Duration::from_millis(300)).await;
        let key = Key::from_name("k");
        let (a, _) = scripted_peer(move |_| Some(Body::Value { key, value: "a".to_string() })).await;
        let (b, _) = scripted_peer(move |_| Some(Body::Value { key, value: "b".to_string() })).await;

        let deliveries = Arc::new(Mutex::new(Vec::new()));
        let sink = deliveries.clone();
        lookup_value(&client, key, vec![a, b], DEFAULT_MAX_LOOKUP_DEPTH, move |reply| {
            sink.lock().push(reply);
        });

        tokio::time::sleep(Duration::from_millis(500)).await;
        let deliveries = deliveries.lock();
        assert_eq!(deliveries.len(), 1);
        assert!(deliveries[0].value == "a" || deliveries[0].value == "b");
        assert!(matches!(deliveries[0].source, ValueSource::Remote(_)));
    }

    #[tokio::test]
    async fn test_value_lookup_follows_referrals() {
        let client = client(Duration::from_millis(300)).await;
        let key = Key::from_name("k");
        let (holder, _) = scripted_peer(move |_| Some(Body::Value { key, value: "v".to_string() })).await;
        let referral = holder.clone();
        let (router, _) = scripted_peer(move |_| Some(Body::Nodes { nodes: vec![referral.clone()] })).await;

        let (tx, rx) = oneshot::channel();
        lookup_value(&client, key, vec![router], DEFAULT_MAX_LOOKUP_DEPTH, move |reply| {
            let _ = tx.send(reply);
        });

        let reply = tokio::time::timeout(Duration::from_secs(2), rx).await.unwrap().unwrap();
        assert_eq!(reply.value, "v");
        assert_eq!(reply.source, ValueSource::Remote(holder.clone()));
        assert!(client.routing().contains(&holder.id));
    }

    #[tokio::test]
    async fn test_value_lookup_without_value_drops_continuation() {
        let client = client(Duration::from_millis(100)).await;
        let (empty, _) = scripted_peer(|_| Some(Body::Nodes { nodes: vec![] })).await;

        let (tx, rx) = oneshot::channel::<ValueReply>();
        lookup_value(&client, Key::random(), vec![empty, dead_node()], DEFAULT_MAX_LOOKUP_DEPTH, move |reply| {
            let _ = tx.send(reply);
        });

        assert!(tokio::time::timeout(Duration::from_secs(2), rx).await.unwrap().is_err());
    }
}
