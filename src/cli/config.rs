//! Node configuration module
//!
//! Settings consumed by a DHT node, built from CLI arguments and optionally
//! layered over a JSON configuration file.

use crate::cli::args::CliArgs;
use crate::dht::key::Key;
use crate::dht::listener::Listener;
use crate::dht::lookup::DEFAULT_MAX_LOOKUP_DEPTH;
use crate::dht::routing::{EvictionPolicy, DEFAULT_K};
use crate::error::{DhtError, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Configuration for a DHT node
#[derive(Debug, Clone)]
pub struct Configuration {
    /// Local node ID
    pub node_id: Key,
    /// Endpoints to bind; one server runs per UDP listener
    pub listeners: Vec<Listener>,
    /// Endpoints announced to peers; the bound listeners when empty
    pub advertised_listeners: Vec<Listener>,
    /// Bucket size and replication factor
    pub k: usize,
    /// Per-request timeout
    pub rpc_timeout: Duration,
    /// Overall deadline of a blocking `get`
    pub get_timeout: Duration,
    /// Stored keys older than this are republished
    pub republish_after: Duration,
    /// Period of the bucket refresh timer
    pub refresh_interval: Option<Duration>,
    /// Period of the republish timer
    pub republish_interval: Option<Duration>,
    /// Policy applied to full buckets
    pub eviction: EvictionPolicy,
    /// Round cap for iterative lookups
    pub max_lookup_depth: usize,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            node_id: Key::random(),
            listeners: vec![Listener::Udp(SocketAddr::from(([127, 0, 0, 1], 0)))],
            advertised_listeners: Vec::new(),
            k: DEFAULT_K,
            rpc_timeout: Duration::from_secs(3),
            get_timeout: Duration::from_secs(10),
            republish_after: Duration::from_secs(3600),
            refresh_interval: Some(Duration::from_secs(3600)),
            republish_interval: Some(Duration::from_secs(3600)),
            eviction: EvictionPolicy::default(),
            max_lookup_depth: DEFAULT_MAX_LOOKUP_DEPTH,
        }
    }
}

/// On-disk form; every field is optional and durations are in milliseconds
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    node_id: Option<Key>,
    listeners: Option<Vec<Listener>>,
    advertised_listeners: Option<Vec<Listener>>,
    k: Option<usize>,
    rpc_timeout_ms: Option<u64>,
    get_timeout_ms: Option<u64>,
    republish_after_ms: Option<u64>,
    /// 0 disables the timer
    refresh_interval_ms: Option<u64>,
    /// 0 disables the timer
    republish_interval_ms: Option<u64>,
    eviction: Option<EvictionPolicy>,
    max_lookup_depth: Option<usize>,
}

fn optional_period(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

fn optional_period_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl Configuration {
    /// Load a JSON configuration file over the defaults
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            DhtError::config_error(format!("Failed to read configuration file {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    /// Parse a JSON configuration over the defaults
    pub fn from_json(text: &str) -> Result<Self> {
        let file: ConfigFile = serde_json::from_str(text)?;
        let mut config = Self::default();
        config.apply_file(file);
        Ok(config)
    }

    fn apply_file(&mut self, file: ConfigFile) {
        if let Some(node_id) = file.node_id {
            self.node_id = node_id;
        }
        if let Some(listeners) = file.listeners {
            self.listeners = listeners;
        }
        if let Some(advertised) = file.advertised_listeners {
            self.advertised_listeners = advertised;
        }
        if let Some(k) = file.k {
            self.k = k;
        }
        if let Some(ms) = file.rpc_timeout_ms {
            self.rpc_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = file.get_timeout_ms {
            self.get_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = file.republish_after_ms {
            self.republish_after = Duration::from_millis(ms);
        }
        if let Some(ms) = file.refresh_interval_ms {
            self.refresh_interval = optional_period(ms);
        }
        if let Some(ms) = file.republish_interval_ms {
            self.republish_interval = optional_period(ms);
        }
        if let Some(eviction) = file.eviction {
            self.eviction = eviction;
        }
        if let Some(depth) = file.max_lookup_depth {
            self.max_lookup_depth = depth;
        }
    }

    /// Create configuration from CLI arguments, starting from `--config` if given
    pub fn from_args(args: &CliArgs) -> Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };

        if let Some(id) = &args.id {
            config.node_id = Key::from_hex(id)
                .ok_or_else(|| DhtError::config_error_with_field(format!("Invalid node ID: {}", id), "id"))?;
        } else if let Some(name) = &args.name {
            config.node_id = Key::from_name(name);
        }
        if !args.listen.is_empty() {
            config.listeners = parse_listeners(&args.listen, "listen")?;
        }
        if !args.advertise.is_empty() {
            config.advertised_listeners = parse_listeners(&args.advertise, "advertise")?;
        }
        if let Some(k) = args.k {
            config.k = k;
        }
        if let Some(ms) = args.rpc_timeout_ms {
            config.rpc_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = args.get_timeout_ms {
            config.get_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = args.refresh_interval_secs {
            config.refresh_interval = optional_period_secs(secs);
        }
        if let Some(secs) = args.republish_interval_secs {
            config.republish_interval = optional_period_secs(secs);
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            return Err(DhtError::config_error_with_field("k must be at least 1", "k"));
        }

        if self.max_lookup_depth == 0 {
            return Err(DhtError::config_error_with_field("max_lookup_depth must be at least 1", "max_lookup_depth"));
        }

        if self.rpc_timeout.is_zero() {
            return Err(DhtError::config_error_with_field("rpc_timeout must be positive", "rpc_timeout"));
        }

        if self.get_timeout.is_zero() {
            return Err(DhtError::config_error_with_field("get_timeout must be positive", "get_timeout"));
        }

        // At least one server is needed to answer requests
        if !self.listeners.iter().any(|l| l.udp_addr().is_some()) {
            return Err(DhtError::config_error_with_field("At least one udp:// listener is required", "listeners"));
        }

        Ok(())
    }

    /// Addresses of the UDP listeners to bind
    pub fn udp_listen_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().filter_map(Listener::udp_addr).collect()
    }
}

fn parse_listeners(values: &[String], field: &str) -> Result<Vec<Listener>> {
    let mut listeners = Vec::new();
    for value in values {
        let parsed = Listener::parse_list(value)
            .map_err(|e| DhtError::config_error_with_field(format!("Invalid listener {:?}: {}", value, e), field))?;
        listeners.extend(parsed);
    }
    Ok(listeners)
}
