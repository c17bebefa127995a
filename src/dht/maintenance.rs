//! DHT maintenance module
//!
//! Bucket refresh, key republishing and the timer task driving both.

use crate::dht::client::KademliaClient;
use crate::dht::key::ID_BITS;
use crate::dht::lookup::lookup_nodes;
use crate::error::{DhtError, Result};
use crate::storage::Storage;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Periodic upkeep of the routing table and of locally stored keys
#[derive(Clone)]
pub struct Maintenance {
    client: Arc<KademliaClient>,
    storage: Arc<dyn Storage>,
    /// Keys not written for this long are republished
    republish_after: Duration,
    max_depth: usize,
}

impl Maintenance {
    /// Create maintenance routines for a node
    pub fn new(client: Arc<KademliaClient>, storage: Arc<dyn Storage>, republish_after: Duration, max_depth: usize) -> Self {
        Self {
            client,
            storage,
            republish_after,
            max_depth,
        }
    }

    /// Probe every bucket distance with a node lookup.
    ///
    /// Each lookup targets a random ID at that distance from us and is seeded
    /// with every known peer, so the closest of them are asked first. Returns
    /// the routing table size once every lookup has finished.
    pub async fn refresh_buckets(&self) -> usize {
        let routing = self.client.routing();
        let known = routing.nodes();
        if known.is_empty() {
            debug!("Routing table is empty, skipping bucket refresh");
            return 0;
        }
        debug!("Refreshing {} buckets from {} known peers", ID_BITS, known.len());

        let local_id = routing.local_id();
        let mut pending = Vec::with_capacity(ID_BITS);
        for distance in 1..=ID_BITS {
            let probe = local_id.generate_at_distance(distance);
            let (tx, rx) = oneshot::channel();
            lookup_nodes(&self.client, probe, known.clone(), self.max_depth, move |_| {
                let _ = tx.send(());
            });
            pending.push(rx);
        }
        for rx in pending {
            let _ = rx.await;
        }

        let size = routing.len();
        info!("Bucket refresh complete, {} peers known", size);
        size
    }

    /// Re-send every stale key to the k closest known peers.
    ///
    /// The local copy's timestamp is refreshed afterwards. Returns the number
    /// of STORE requests sent.
    pub async fn republish_keys(&self) -> Result<usize> {
        let stale = self
            .storage
            .keys_stale_since(self.republish_after)
            .await
            .map_err(|e| DhtError::storage_error_with_source("Failed to list stale keys", e.to_string()))?;
        if stale.is_empty() {
            return Ok(0);
        }
        debug!("Republishing {} stale keys", stale.len());

        let routing = self.client.routing();
        let mut sent = 0;
        for key in stale {
            let value = match self.storage.get(&key).await {
                Ok(Some(value)) => value,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Failed to read {} for republishing: {}", key, e);
                    continue;
                }
            };

            for node in routing.closest_to(&key, Some(routing.k())) {
                self.client.send_store(&node, key, value.content.clone());
                sent += 1;
            }
            self.storage
                .put(key, value.content)
                .await
                .map_err(|e| DhtError::storage_error_with_source("Failed to refresh republished key", e.to_string()))?;
        }

        info!("Republished stale keys with {} STORE requests", sent);
        Ok(sent)
    }

    /// Spawn the timer task. Returns `None` when both intervals are disabled.
    pub fn spawn(self, refresh_interval: Option<Duration>, republish_interval: Option<Duration>) -> Option<JoinHandle<()>> {
        if refresh_interval.is_none() && republish_interval.is_none() {
            return None;
        }
        Some(tokio::spawn(async move {
            let mut refresh = refresh_interval.and_then(delayed_interval);
            let mut republish = republish_interval.and_then(delayed_interval);
            info!(
                "Starting DHT maintenance (refresh every {:?}, republish every {:?})",
                refresh_interval, republish_interval
            );
            loop {
                tokio::select! {
                    _ = tick(&mut refresh) => {
                        self.refresh_buckets().await;
                    }
                    _ = tick(&mut republish) => {
                        if let Err(e) = self.republish_keys().await {
                            warn!("Key republishing failed: {}", e);
                        }
                    }
                }
            }
        }))
    }
}

impl std::fmt::Debug for Maintenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Maintenance")
            .field("republish_after", &self.republish_after)
            .field("max_depth", &self.max_depth)
            .finish()
    }
}

/// An interval whose first tick is one period away. Periods too long to
/// schedule never tick.
fn delayed_interval(period: Duration) -> Option<Interval> {
    let start = Instant::now().checked_add(period)?;
    let mut interval = interval_at(start, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(interval)
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
