//! DHT server module
//!
//! Answers inbound requests on one UDP listener.

use crate::dht::client::KademliaClient;
use crate::dht::events::Event;
use crate::dht::message::{Body, Message, MAX_DATAGRAM_SIZE};
use crate::error::{DhtError, Result};
use crate::storage::Storage;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Request handler bound to a single listener endpoint
pub struct KademliaServer {
    socket: UdpSocket,
    /// Shared client; inbound contact is recorded through it so that full
    /// buckets are probed the same way as for outbound exchanges
    client: Arc<KademliaClient>,
    storage: Arc<dyn Storage>,
}

/// Bind a listener socket. Failure is fatal to the caller.
pub async fn bind_listener(addr: SocketAddr) -> Result<UdpSocket> {
    let socket = UdpSocket::bind(addr).await.map_err(|e| {
        error!("Failed to bind DHT listener to {}: {}", addr, e);
        DhtError::network_error_full("Failed to bind DHT listener", addr.to_string(), e.to_string())
    })?;
    if let Ok(local) = socket.local_addr() {
        info!("DHT server listening on udp://{}", local);
    }
    Ok(socket)
}

impl KademliaServer {
    /// Bind a listener and create its server
    pub async fn bind(addr: SocketAddr, client: Arc<KademliaClient>, storage: Arc<dyn Storage>) -> Result<Self> {
        let socket = bind_listener(addr).await?;
        Ok(Self::from_socket(socket, client, storage))
    }

    /// Serve requests on an already bound socket
    pub fn from_socket(socket: UdpSocket, client: Arc<KademliaClient>, storage: Arc<dyn Storage>) -> Self {
        Self { socket, client, storage }
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Run the receive loop on a background task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            match self.socket.recv_from(&mut buffer).await {
                Ok((len, from)) => self.handle_datagram(&buffer[..len], from).await,
                Err(e) => warn!("Error receiving request: {}", e),
            }
        }
    }

    async fn handle_datagram(&self, data: &[u8], from: SocketAddr) {
        trace!("Handling {} bytes from {}", data.len(), from);
        let request = match Message::deserialize(data) {
            Ok(message) => message,
            Err(e) => {
                debug!("Dropping malformed datagram from {}: {}", from, e);
                return;
            }
        };

        if !request.kind().is_request() {
            debug!("Ignoring stray {} from {}", request.kind(), from);
            return;
        }

        debug!("Received {} (seq {}) from {} at {}", request.kind(), request.seq, request.origin.id, from);
        self.client.touch(request.origin.clone());
        self.client.events().emit(Event::MessageReceived {
            kind: request.kind(),
            origin: request.origin.clone(),
        });

        let body = self.respond(&request).await;
        let reply = request.reply(self.client.local().clone(), body);
        let bytes = match reply.serialize() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to serialize {} reply to {}: {}", reply.kind(), from, e);
                return;
            }
        };
        if let Err(e) = self.socket.send_to(&bytes, from).await {
            debug!("Failed to send {} reply to {}: {}", reply.kind(), from, e);
        }
    }

    async fn respond(&self, request: &Message) -> Body {
        let routing = self.client.routing();
        match &request.body {
            Body::FindNode { target } => Body::Nodes {
                nodes: routing.closest_to(target, Some(routing.k())),
            },
            Body::FindValue { key } => match self.storage.get(key).await {
                Ok(Some(stored)) => Body::Value {
                    key: *key,
                    value: stored.content,
                },
                Ok(None) => Body::Nodes {
                    nodes: routing.closest_to(key, Some(routing.k())),
                },
                Err(e) => {
                    warn!("Storage lookup for {} failed, answering with nodes: {}", key, e);
                    Body::Nodes {
                        nodes: routing.closest_to(key, Some(routing.k())),
                    }
                }
            },
            Body::Store { key, value } => {
                match self.storage.put(*key, value.clone()).await {
                    Ok(()) => {
                        debug!("Stored {} on behalf of {}", key, request.origin.id);
                        self.client.events().emit(Event::ValueStored {
                            key: *key,
                            origin: request.origin.clone(),
                        });
                    }
                    Err(e) => warn!("Failed to store {} for {}: {}", key, request.origin.id, e),
                }
                Body::Stored { key: *key }
            }
            _ => Body::Pong,
        }
    }
}

impl std::fmt::Debug for KademliaServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KademliaServer")
            .field("local_addr", &self.socket.local_addr().ok())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::events::EventBus;
    use crate::dht::key::Key;
    use crate::dht::message::MessageKind;
    use crate::dht::node::Node;
    use crate::dht::routing::{EvictionPolicy, RoutingTable};
    use crate::storage::InMemoryStorage;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct Harness {
        client: Arc<KademliaClient>,
        storage: Arc<InMemoryStorage>,
        addr: SocketAddr,
        _task: JoinHandle<()>,
    }

    async fn harness(id: Key) -> Harness {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let local = Node::udp(id, addr);
        let client = KademliaClient::bind(
            "127.0.0.1:0".parse().unwrap(),
            local,
            Arc::new(RoutingTable::new(id, 20)),
            Arc::new(EventBus::new()),
            Duration::from_secs(2),
            EvictionPolicy::DropNew,
        )
        .await
        .unwrap();
        let storage = Arc::new(InMemoryStorage::new());
        let server = KademliaServer::from_socket(listener, client.clone(), storage.clone());
        Harness {
            client,
            storage,
            addr,
            _task: server.spawn(),
        }
    }

    /// Send a raw request from a throwaway socket and wait for the reply
    async fn exchange(to: SocketAddr, origin: &Node, body: Body) -> Message {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let bytes = Message::new(42, origin.clone(), body).serialize().unwrap();
        socket.send_to(&bytes, to).await.unwrap();
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buffer))
            .await
            .unwrap()
            .unwrap();
        Message::deserialize(&buffer[..len]).unwrap()
    }

    fn requester() -> Node {
        Node::udp(Key::random(), "127.0.0.1:9".parse().unwrap())
    }

    #[tokio::test]
    async fn test_ping_replies_pong_and_touches_sender() {
        let h = harness(Key::random()).await;
        let origin = requester();
        let reply = exchange(h.addr, &origin, Body::Ping).await;
        assert_eq!(reply.seq, 42);
        assert_eq!(reply.body, Body::Pong);
        assert_eq!(reply.origin.id, h.client.local().id);
        assert!(h.client.routing().contains(&origin.id));
    }

    #[tokio::test]
    async fn test_find_node_returns_closest_known() {
        let h = harness(Key::random()).await;
        for _ in 0..5 {
            h.client.touch(Node::udp(Key::random(), "127.0.0.1:9".parse().unwrap()));
        }
        let target = Key::random();
        let reply = exchange(h.addr, &requester(), Body::FindNode { target }).await;
        let Body::Nodes { nodes } = reply.body else {
            panic!("expected nodes reply");
        };
        // The five seeded peers plus the requester
        assert_eq!(nodes.len(), 6);
        assert!(nodes.iter().all(|n| n.id != h.client.local().id));
        assert!(nodes.windows(2).all(|w| target.cmp_distance(&w[0].id, &w[1].id).is_le()));
    }

    #[tokio::test]
    async fn test_store_then_find_value() {
        let h = harness(Key::random()).await;
        let stored = Arc::new(Mutex::new(Vec::new()));
        let sink = stored.clone();
        h.client.events().add("test", move |event| {
            if let Event::ValueStored { key, .. } = event {
                sink.lock().push(*key);
            }
        });

        let key = Key::from_name("k");
        let reply = exchange(h.addr, &requester(), Body::Store { key, value: "v".to_string() }).await;
        assert_eq!(reply.body, Body::Stored { key });
        assert_eq!(h.storage.get(&key).await.unwrap().unwrap().content, "v");
        assert_eq!(stored.lock().as_slice(), &[key]);

        let reply = exchange(h.addr, &requester(), Body::FindValue { key }).await;
        assert_eq!(reply.body, Body::Value { key, value: "v".to_string() });
    }

    #[tokio::test]
    async fn test_find_value_miss_returns_nodes() {
        let h = harness(Key::random()).await;
        let reply = exchange(h.addr, &requester(), Body::FindValue { key: Key::random() }).await;
        assert_eq!(reply.kind(), MessageKind::Nodes);
    }

    #[tokio::test]
    async fn test_malformed_datagram_is_dropped() {
        let h = harness(Key::random()).await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.send_to(b"not bencode", h.addr).await.unwrap();

        let reply = exchange(h.addr, &requester(), Body::Ping).await;
        assert_eq!(reply.body, Body::Pong);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_network_error() {
        let h = harness(Key::random()).await;
        let result = KademliaServer::bind(h.addr, h.client.clone(), h.storage.clone()).await;
        assert!(matches!(result, Err(DhtError::NetworkError { .. })));
    }
}
