//! DHT main module
//!
//! The `Kademlia` node: owns the servers, the RPC client, storage and the
//! maintenance timers, and exposes the application-facing operations.

use crate::cli::config::Configuration;
use crate::dht::client::{KademliaClient, ValueReply, ValueSource};
use crate::dht::events::Event;
use crate::dht::key::Key;
use crate::dht::listener::Listener;
use crate::dht::lookup::{find_closest_nodes, lookup_value};
use crate::dht::maintenance::Maintenance;
use crate::dht::node::Node;
use crate::dht::routing::RoutingTable;
use crate::dht::server::{bind_listener, KademliaServer};
use crate::error::{DhtError, Result};
use crate::storage::Storage;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// A running DHT node
pub struct Kademlia {
    config: Configuration,
    client: Arc<KademliaClient>,
    storage: Arc<dyn Storage>,
    maintenance: Maintenance,
    /// Bound server addresses, in listener order
    listen_addrs: Vec<SocketAddr>,
    servers: Mutex<Vec<JoinHandle<()>>>,
    maintenance_task: Mutex<Option<JoinHandle<()>>>,
}

impl Kademlia {
    /// Bind every UDP listener and start serving requests
    pub async fn new(config: Configuration, storage: Arc<dyn Storage>) -> Result<Self> {
        config.validate()?;

        let mut sockets = Vec::new();
        for addr in config.udp_listen_addrs() {
            sockets.push(bind_listener(addr).await?);
        }
        let listen_addrs = sockets
            .iter()
            .map(|socket| socket.local_addr())
            .collect::<std::io::Result<Vec<_>>>()
            .map_err(|e| {
                error!("Failed to get listener address: {}", e);
                DhtError::network_error_full("Failed to get listener address", "unknown", e.to_string())
            })?;

        let advertised = if config.advertised_listeners.is_empty() {
            let mut advertised: Vec<Listener> = listen_addrs.iter().copied().map(Listener::Udp).collect();
            advertised.extend(config.listeners.iter().filter(|l| l.udp_addr().is_none()).copied());
            advertised
        } else {
            config.advertised_listeners.clone()
        };
        let local = Node::new(config.node_id, advertised);

        let client_ip = listen_addrs
            .first()
            .map(SocketAddr::ip)
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let routing = Arc::new(RoutingTable::new(config.node_id, config.k));
        let client = KademliaClient::bind(
            SocketAddr::new(client_ip, 0),
            local,
            routing,
            Arc::default(),
            config.rpc_timeout,
            config.eviction,
        )
        .await?;

        let servers = sockets
            .into_iter()
            .map(|socket| KademliaServer::from_socket(socket, client.clone(), storage.clone()).spawn())
            .collect();
        let maintenance = Maintenance::new(client.clone(), storage.clone(), config.republish_after, config.max_lookup_depth);

        info!("DHT node {} started", client.local());
        Ok(Self {
            config,
            client,
            storage,
            maintenance,
            listen_addrs,
            servers: Mutex::new(servers),
            maintenance_task: Mutex::new(None),
        })
    }

    /// Our identity as advertised to peers
    pub fn local_node(&self) -> &Node {
        self.client.local()
    }

    /// Addresses the UDP servers are bound to
    pub fn listen_addrs(&self) -> &[SocketAddr] {
        &self.listen_addrs
    }

    /// The routing table
    pub fn routing_table(&self) -> &Arc<RoutingTable> {
        self.client.routing()
    }

    /// The storage backend
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Active configuration
    pub fn config(&self) -> &Configuration {
        &self.config
    }

    /// Join the network through `seed`.
    ///
    /// Fails with a timeout if the seed does not answer FIND_NODE for our own
    /// ID within the RPC timeout. Otherwise the answer seeds a lookup of our
    /// own ID, followed by a full bucket refresh. Returns the number of known
    /// peers afterwards.
    pub async fn bootstrap(&self, seed: &Node) -> Result<usize> {
        info!("Bootstrapping from {}", seed);
        let local_id = self.client.local().id;

        self.client.send_ping(seed, |origin| debug!("Seed {} answered ping", origin.id));
        let (tx, rx) = oneshot::channel();
        self.client.send_find_node(seed, local_id, move |nodes| {
            let _ = tx.send(nodes);
        });

        let nodes = match timeout(self.config.rpc_timeout, rx).await {
            Ok(Ok(nodes)) => nodes,
            _ => {
                warn!("Seed {} did not answer", seed.id);
                return Err(DhtError::timeout_after("bootstrap", self.config.rpc_timeout));
            }
        };
        debug!("Seed returned {} nodes", nodes.len());
        for node in &nodes {
            self.client.touch(node.clone());
        }

        find_closest_nodes(&self.client, local_id, nodes, self.config.max_lookup_depth).await;
        let known = self.refresh_buckets().await;
        info!("Bootstrap complete, {} peers known", known);
        Ok(known)
    }

    /// Store `value` under `key` on the k closest nodes.
    ///
    /// STOREs are not acknowledged. The value is also kept locally when this
    /// node is itself among the k closest to `key`. Returns the number of
    /// peers sent a STORE.
    pub async fn put(&self, key: Key, value: impl Into<String>) -> Result<usize> {
        let value = value.into();
        let routing = self.client.routing();
        let k = routing.k();
        let local_id = self.client.local().id;

        let seeds = routing.closest_to(&key, Some(k));
        let closest = find_closest_nodes(&self.client, key, seeds, self.config.max_lookup_depth).await;

        let closer_than_us = closest
            .iter()
            .filter(|node| key.cmp_distance(&node.id, &local_id) == Ordering::Less)
            .count();
        if closer_than_us < k {
            self.storage
                .put(key, value.clone())
                .await
                .map_err(|e| DhtError::storage_error_with_source("Failed to store value locally", e.to_string()))?;
        }

        for node in &closest {
            self.client.send_store(node, key, value.clone());
        }
        info!("Stored {} on {} peers", key, closest.len());
        Ok(closest.len())
    }

    /// Look up `key` and wait for its value.
    ///
    /// A value in local storage is returned without any network traffic.
    /// Otherwise the first value returned by any peer wins. Fails with a
    /// timeout when no value arrives before the configured deadline.
    pub async fn get(&self, key: &Key) -> Result<String> {
        let (tx, rx) = oneshot::channel();
        self.get_with(*key, move |reply| {
            let _ = tx.send(reply);
        })
        .await;

        match timeout(self.config.get_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply.value),
            Ok(Err(_)) => {
                debug!("Value lookup for {} exhausted without a value", key);
                Err(DhtError::timeout_after(format!("get {}", key), self.config.get_timeout))
            }
            Err(_) => Err(DhtError::timeout_after(format!("get {}", key), self.config.get_timeout)),
        }
    }

    /// Look up `key` and hand the first value found to `on_value`.
    ///
    /// `on_value` runs at most once, and never if no value is found. A local
    /// hit runs it before this returns.
    pub async fn get_with(&self, key: Key, on_value: impl FnOnce(ValueReply) + Send + 'static) {
        match self.storage.get(&key).await {
            Ok(Some(stored)) => {
                debug!("Found {} in local storage", key);
                on_value(ValueReply {
                    source: ValueSource::Local,
                    key,
                    value: stored.content,
                });
                return;
            }
            Ok(None) => {}
            Err(e) => warn!("Local storage lookup for {} failed: {}", key, e),
        }

        let routing = self.client.routing();
        let seeds = routing.closest_to(&key, Some(routing.k()));
        lookup_value(&self.client, key, seeds, self.config.max_lookup_depth, on_value);
    }

    /// Refresh every bucket; returns the number of known peers afterwards
    pub async fn refresh_buckets(&self) -> usize {
        self.maintenance.refresh_buckets().await
    }

    /// Republish stale keys; returns the number of STORE requests sent
    pub async fn republish_keys(&self) -> Result<usize> {
        self.maintenance.republish_keys().await
    }

    /// Start the periodic refresh and republish timers.
    ///
    /// Returns false when both are disabled or the timers already run.
    pub fn start_maintenance(&self) -> bool {
        let mut task = self.maintenance_task.lock();
        if task.is_some() {
            return false;
        }
        *task = self
            .maintenance
            .clone()
            .spawn(self.config.refresh_interval, self.config.republish_interval);
        task.is_some()
    }

    /// Register an event listener under `registration_id`
    pub fn add_event_listener(&self, registration_id: impl Into<String>, listener: impl Fn(&Event) + Send + Sync + 'static) {
        self.client.events().add(registration_id, listener);
    }

    /// Remove an event listener; returns whether it was registered
    pub fn remove_event_listener(&self, registration_id: &str) -> bool {
        self.client.events().remove(registration_id)
    }

    /// Stop serving, abandon pending requests and drop all listeners
    pub fn close(&self) {
        for server in self.servers.lock().drain(..) {
            server.abort();
        }
        if let Some(task) = self.maintenance_task.lock().take() {
            task.abort();
        }
        self.client.close();
        self.client.events().clear();
        info!("DHT node {} stopped", self.client.local().id);
    }
}

impl Drop for Kademlia {
    fn drop(&mut self) {
        for server in self.servers.get_mut().drain(..) {
            server.abort();
        }
        if let Some(task) = self.maintenance_task.get_mut().take() {
            task.abort();
        }
        self.client.close();
    }
}

impl std::fmt::Debug for Kademlia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kademlia")
            .field("local", &self.client.local().to_string())
            .field("listen_addrs", &self.listen_addrs)
            .field("peers", &self.client.routing().len())
            .finish()
    }
}
