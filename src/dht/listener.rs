//! Listener module
//!
//! Network endpoints a node listens on or advertises, written as URLs such
//! as `udp://127.0.0.1:9000`.

use anyhow::Result;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use url::Url;

/// A listener endpoint, tagged by transport kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Listener {
    /// Datagram endpoint; the only kind that runs a server and receives RPCs
    Udp(SocketAddr),
    /// Stream endpoint, advertised for applications but unused by the DHT itself
    Tcp(SocketAddr),
}

impl Listener {
    /// Parse a listener from a `scheme://host:port` URL, resolving host names.
    ///
    /// Resolution blocks, so this is for configuration and command-line input.
    /// Datagrams go through [`Listener::from_wire`].
    pub fn from_url(input: &str) -> Result<Self> {
        let (tcp, host, port) = split_url(input)?;
        let addr = (host.as_str(), port)
            .to_socket_addrs()
            .map_err(|e| anyhow::anyhow!("Failed to resolve listener host '{}': {}", host, e))?
            .next()
            .ok_or_else(|| anyhow::anyhow!("Listener host '{}' resolved to no address", host))?;
        Ok(Self::tagged(tcp, addr))
    }

    /// Parse a listener received from a peer. Only literal IP hosts are
    /// accepted; names are rejected without being resolved.
    pub fn from_wire(input: &str) -> Result<Self> {
        let (tcp, host, port) = split_url(input)?;
        let ip = host
            .parse::<IpAddr>()
            .map_err(|_| anyhow::anyhow!("Listener '{}' must use a literal IP address", input))?;
        Ok(Self::tagged(tcp, SocketAddr::new(ip, port)))
    }

    fn tagged(tcp: bool, addr: SocketAddr) -> Self {
        if tcp {
            Listener::Tcp(addr)
        } else {
            Listener::Udp(addr)
        }
    }

    /// Parse a comma-separated list of listener URLs
    pub fn parse_list(input: &str) -> Result<Vec<Self>> {
        input
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .map(Listener::from_url)
            .collect()
    }

    /// The socket address of this listener
    pub fn addr(&self) -> SocketAddr {
        match self {
            Listener::Udp(addr) | Listener::Tcp(addr) => *addr,
        }
    }

    /// The UDP address, if this is a datagram listener
    pub fn udp_addr(&self) -> Option<SocketAddr> {
        match self {
            Listener::Udp(addr) => Some(*addr),
            Listener::Tcp(_) => None,
        }
    }

    /// Render this listener as a URL string
    pub fn to_url(&self) -> String {
        match self {
            Listener::Udp(addr) => format!("udp://{}", addr),
            Listener::Tcp(addr) => format!("tcp://{}", addr),
        }
    }
}

impl fmt::Display for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_url())
    }
}

impl std::str::FromStr for Listener {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Listener::from_url(s)
    }
}

impl Serialize for Listener {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_url())
    }
}

impl<'de> Deserialize<'de> for Listener {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let url = String::deserialize(deserializer)?;
        Listener::from_url(&url).map_err(serde::de::Error::custom)
    }
}

/// Split a listener URL into (is_tcp, bare host, port)
fn split_url(input: &str) -> Result<(bool, String, u16)> {
    let url = Url::parse(input.trim())
        .map_err(|e| anyhow::anyhow!("Invalid listener URL '{}': {}", input, e))?;
    let tcp = match url.scheme() {
        "udp" => false,
        "tcp" => true,
        other => return Err(anyhow::anyhow!("Unsupported listener scheme: {}", other)),
    };
    let host = url
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("Listener URL '{}' has no host", input))?;
    let port = url
        .port()
        .ok_or_else(|| anyhow::anyhow!("Listener URL '{}' has no port", input))?;
    let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
    Ok((tcp, host, port))
}
