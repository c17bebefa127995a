//! DHT client module
//!
//! Sends RPC requests over UDP, correlates replies with pending requests and
//! hands decoded replies to caller-supplied continuations.
//!
//! Delivery is at most once: a continuation runs when the matching reply
//! arrives and is dropped without being called when the request times out.
//! Continuations run on the client's receive task, not on the caller's stack.

use crate::dht::events::{Event, EventBus};
use crate::dht::key::Key;
use crate::dht::message::{generate_seq, Body, Message, MessageKind, MAX_DATAGRAM_SIZE};
use crate::dht::node::Node;
use crate::dht::routing::{EvictionPolicy, RoutingTable, TouchOutcome};
use crate::error::{DhtError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Default per-request timeout
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(3);

/// A callback invoked at most once with a reply
pub type Continuation<T> = Box<dyn FnOnce(T) + Send + 'static>;

/// Where a value came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueSource {
    /// Served from local storage without a network hop
    Local,
    /// Returned by a peer
    Remote(Node),
}

/// The terminal result of a value lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueReply {
    pub source: ValueSource,
    pub key: Key,
    pub value: String,
}

enum ReplyHandler {
    Pong(Continuation<Node>),
    Nodes(Continuation<Vec<Node>>),
    Value {
        on_nodes: Continuation<Vec<Node>>,
        on_value: Continuation<ValueReply>,
    },
    Stored,
}

/// An outstanding request awaiting its reply
struct PendingRequest {
    target: Node,
    kind: MessageKind,
    issued_at: Instant,
    handler: ReplyHandler,
}

impl PendingRequest {
    fn complete(self, origin: Node, body: Body) {
        let kind = self.kind;
        match (self.handler, body) {
            (ReplyHandler::Pong(on_pong), Body::Pong) => on_pong(origin),
            (ReplyHandler::Nodes(on_nodes), Body::Nodes { nodes }) => on_nodes(nodes),
            (ReplyHandler::Value { on_nodes, .. }, Body::Nodes { nodes }) => on_nodes(nodes),
            (ReplyHandler::Value { on_value, .. }, Body::Value { key, value }) => on_value(ValueReply {
                source: ValueSource::Remote(origin),
                key,
                value,
            }),
            (ReplyHandler::Stored, Body::Stored { .. }) => {}
            (_, body) => {
                warn!("Discarding {} reply from {} to a {} request", body.kind(), origin.id, kind);
            }
        }
    }
}

/// Liveness probe of the least-recently-seen member of a full bucket.
///
/// Rides inside the probe's pong continuation: a pong marks it alive, and
/// dropping it (reply or timeout) settles the bucket.
struct EvictionProbe {
    routing: Arc<RoutingTable>,
    events: Arc<EventBus>,
    oldest: Node,
    candidate: Option<Node>,
    alive: bool,
}

impl EvictionProbe {
    /// Record the pong; the bucket settles as `self` drops
    fn mark_alive(mut self) {
        self.alive = true;
    }
}

impl Drop for EvictionProbe {
    fn drop(&mut self) {
        let Some(candidate) = self.candidate.take() else {
            return;
        };
        let evicted = self.routing.resolve_probe(&self.oldest.id, self.alive, candidate.clone());
        if let Some(node) = evicted {
            debug!("Evicted unresponsive node {}", node.id);
            self.events.emit(Event::PeerEvicted { node });
            if self.routing.contains(&candidate.id) {
                self.events.emit(Event::PeerDiscovered { node: candidate });
            }
        }
    }
}

/// UDP RPC client
pub struct KademliaClient {
    /// Socket used for outbound requests and their replies
    socket: Arc<UdpSocket>,
    /// Identity advertised in every request
    local: Node,
    /// Shared routing table, touched on every successful exchange
    routing: Arc<RoutingTable>,
    /// Event sink
    events: Arc<EventBus>,
    /// Outstanding requests by correlation id
    pending: Mutex<HashMap<u32, PendingRequest>>,
    /// Per-request timeout
    rpc_timeout: Duration,
    /// Policy for full buckets
    eviction: EvictionPolicy,
    /// Receive loop task
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl KademliaClient {
    /// Bind the client socket and start its receive loop
    pub async fn bind(
        bind_addr: SocketAddr,
        local: Node,
        routing: Arc<RoutingTable>,
        events: Arc<EventBus>,
        rpc_timeout: Duration,
        eviction: EvictionPolicy,
    ) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(bind_addr).await.map_err(|e| {
            DhtError::network_error_full("Failed to bind client socket", bind_addr.to_string(), e.to_string())
        })?;
        let socket = Arc::new(socket);
        if let Ok(addr) = socket.local_addr() {
            info!("DHT client bound to {}", addr);
        }

        let client = Arc::new(Self {
            socket: socket.clone(),
            local,
            routing,
            events,
            pending: Mutex::new(HashMap::new()),
            rpc_timeout,
            eviction,
            receiver: Mutex::new(None),
        });

        let handle = tokio::spawn(Self::receive_loop(socket, Arc::downgrade(&client)));
        *client.receiver.lock() = Some(handle);
        Ok(client)
    }

    /// Our advertised identity
    pub fn local(&self) -> &Node {
        &self.local
    }

    /// The shared routing table
    pub fn routing(&self) -> &Arc<RoutingTable> {
        &self.routing
    }

    /// The event sink
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Address of the client socket
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Number of requests still awaiting a reply
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Send PING; `on_pong` receives the responder's identity
    pub fn send_ping(self: &Arc<Self>, node: &Node, on_pong: impl FnOnce(Node) + Send + 'static) {
        self.send_request(node, Body::Ping, ReplyHandler::Pong(Box::new(on_pong)));
    }

    /// Send FIND_NODE; `on_nodes` receives the responder's closest peers to `target`
    pub fn send_find_node(
        self: &Arc<Self>,
        node: &Node,
        target: Key,
        on_nodes: impl FnOnce(Vec<Node>) + Send + 'static,
    ) {
        self.send_request(node, Body::FindNode { target }, ReplyHandler::Nodes(Box::new(on_nodes)));
    }

    /// Send FIND_VALUE; exactly one of the continuations runs if a reply arrives
    pub fn send_find_value(
        self: &Arc<Self>,
        node: &Node,
        key: Key,
        on_nodes: impl FnOnce(Vec<Node>) + Send + 'static,
        on_value: impl FnOnce(ValueReply) + Send + 'static,
    ) {
        let handler = ReplyHandler::Value {
            on_nodes: Box::new(on_nodes),
            on_value: Box::new(on_value),
        };
        self.send_request(node, Body::FindValue { key }, handler);
    }

    /// Send STORE without waiting for the acknowledgement
    pub fn send_store(self: &Arc<Self>, node: &Node, key: Key, value: String) {
        self.send_request(node, Body::Store { key, value }, ReplyHandler::Stored);
    }

    /// Record a successful exchange with (or the discovery of) `node`
    pub fn touch(self: &Arc<Self>, node: Node) {
        match self.routing.add_or_touch(node.clone(), self.eviction) {
            TouchOutcome::Inserted => {
                debug!("Added node {} to routing table", node.id);
                self.events.emit(Event::PeerDiscovered { node });
            }
            TouchOutcome::Full { oldest } => {
                debug!("Bucket full, probing {} before admitting {}", oldest.id, node.id);
                let probe = EvictionProbe {
                    routing: self.routing.clone(),
                    events: self.events.clone(),
                    oldest: oldest.clone(),
                    candidate: Some(node),
                    alive: false,
                };
                self.send_ping(&oldest, move |_| probe.mark_alive());
            }
            TouchOutcome::Refreshed | TouchOutcome::Ignored => {}
        }
    }

    /// Stop the receive loop and abandon every pending request
    pub fn close(&self) {
        if let Some(handle) = self.receiver.lock().take() {
            handle.abort();
        }
        let abandoned: Vec<PendingRequest> = self.pending.lock().drain().map(|(_, p)| p).collect();
        if !abandoned.is_empty() {
            debug!("Abandoning {} pending requests", abandoned.len());
        }
    }

    fn send_request(self: &Arc<Self>, node: &Node, body: Body, handler: ReplyHandler) {
        let Some(addr) = node.udp_addr() else {
            debug!("Node {} advertises no UDP listener, skipping {}", node.id, body.kind());
            return;
        };
        let kind = body.kind();

        let seq = {
            let mut pending = self.pending.lock();
            let seq = loop {
                let seq = generate_seq();
                if !pending.contains_key(&seq) {
                    break seq;
                }
            };
            pending.insert(
                seq,
                PendingRequest {
                    target: node.clone(),
                    kind,
                    issued_at: Instant::now(),
                    handler,
                },
            );
            seq
        };

        let bytes = match Message::new(seq, self.local.clone(), body).serialize() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to serialize {} request: {}", kind, e);
                let abandoned = self.pending.lock().remove(&seq);
                drop(abandoned);
                return;
            }
        };

        // A failed send is treated like a lost datagram and left to the timer
        match self.socket.try_send_to(&bytes, addr) {
            Ok(_) => debug!("Sent {} (seq {}) to {} at {}", kind, seq, node.id, addr),
            Err(e) => debug!("Failed to send {} to {}: {}", kind, addr, e),
        }

        self.schedule_timeout(seq);
    }

    fn schedule_timeout(self: &Arc<Self>, seq: u32) {
        let client = Arc::downgrade(self);
        let timeout = self.rpc_timeout;
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(timeout).await;
                    if let Some(client) = client.upgrade() {
                        client.expire(seq);
                    }
                });
            }
            Err(_) => self.expire(seq),
        }
    }

    fn expire(&self, seq: u32) {
        let request = self.pending.lock().remove(&seq);
        if let Some(request) = request {
            debug!(
                "{} request (seq {}) to {} timed out after {:?}",
                request.kind,
                seq,
                request.target.id,
                request.issued_at.elapsed()
            );
        }
    }

    async fn receive_loop(socket: Arc<UdpSocket>, client: Weak<Self>) {
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (len, from) = match socket.recv_from(&mut buffer).await {
                Ok(received) => received,
                Err(e) => {
                    warn!("Error receiving reply: {}", e);
                    continue;
                }
            };
            let Some(this) = client.upgrade() else {
                break;
            };
            this.handle_datagram(&buffer[..len], from);
        }
    }

    fn handle_datagram(self: &Arc<Self>, data: &[u8], from: SocketAddr) {
        trace!("Received {} bytes from {}", data.len(), from);
        let message = match Message::deserialize(data) {
            Ok(message) => message,
            Err(e) => {
                debug!("Dropping malformed datagram from {}: {}", from, e);
                return;
            }
        };

        if message.kind().is_request() {
            debug!("Ignoring {} request sent to client socket by {}", message.kind(), from);
            return;
        }

        let request = self.pending.lock().remove(&message.seq);
        let Some(request) = request else {
            trace!("No pending request for seq {} from {}, dropping late reply", message.seq, from);
            return;
        };

        debug!(
            "Received {} (seq {}) from {} after {:?}",
            message.kind(),
            message.seq,
            message.origin.id,
            request.issued_at.elapsed()
        );
        self.touch(message.origin.clone());
        request.complete(message.origin, message.body);
    }
}

impl Drop for KademliaClient {
    fn drop(&mut self) {
        if let Some(handle) = self.receiver.get_mut().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for KademliaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KademliaClient")
            .field("local", &self.local.id)
            .field("pending", &self.pending_count())
            .finish()
    }
}
