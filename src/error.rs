//! Error types for the DHT node
//!
//! Only top-level operations surface errors. Individual RPC branches that
//! time out or fail are absorbed by the lookup that issued them.

use std::fmt;
use std::time::Duration;

/// Error type for DHT operations
#[derive(Debug, Clone)]
pub enum DhtError {
    /// A top-level operation did not complete before its deadline
    Timeout {
        operation: String,
        after: Option<Duration>,
    },

    /// Socket errors, including failure to bind a listener
    NetworkError {
        message: String,
        address: Option<String>,
        source: Option<String>,
    },

    /// Malformed or unexpected wire messages
    ProtocolError {
        message: String,
        source: Option<String>,
    },

    /// Errors reported by the storage backend
    StorageError {
        message: String,
        source: Option<String>,
    },

    /// Configuration errors
    ConfigError {
        message: String,
        field: Option<String>,
    },
}

impl DhtError {
    /// Create a new Timeout error with the elapsed deadline
    pub fn timeout_after(operation: impl Into<String>, after: Duration) -> Self {
        DhtError::Timeout {
            operation: operation.into(),
            after: Some(after),
        }
    }

    /// Create a new NetworkError with address and source
    pub fn network_error_full(message: impl Into<String>, address: impl Into<String>, source: impl Into<String>) -> Self {
        DhtError::NetworkError {
            message: message.into(),
            address: Some(address.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new ProtocolError
    pub fn protocol_error(message: impl Into<String>) -> Self {
        DhtError::ProtocolError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new ProtocolError with source
    pub fn protocol_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        DhtError::ProtocolError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new StorageError with source
    pub fn storage_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        DhtError::StorageError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new ConfigError
    pub fn config_error(message: impl Into<String>) -> Self {
        DhtError::ConfigError {
            message: message.into(),
            field: None,
        }
    }

    /// Create a new ConfigError with field
    pub fn config_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        DhtError::ConfigError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Whether this error is a deadline expiry
    pub fn is_timeout(&self) -> bool {
        matches!(self, DhtError::Timeout { .. })
    }
}

impl fmt::Display for DhtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DhtError::Timeout { operation, after } => {
                if let Some(after) = after {
                    write!(f, "Timeout: {} did not complete within {:?}", operation, after)
                } else {
                    write!(f, "Timeout: {} did not complete", operation)
                }
            }
            DhtError::NetworkError { message, address, source } => {
                match (address, source) {
                    (Some(a), Some(s)) => write!(f, "Network error: {} (address: {}, source: {})", message, a, s),
                    (Some(a), None) => write!(f, "Network error: {} (address: {})", message, a),
                    (None, Some(s)) => write!(f, "Network error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Network error: {}", message),
                }
            }
            DhtError::ProtocolError { message, source } => {
                if let Some(src) = source {
                    write!(f, "Protocol error: {} (source: {})", message, src)
                } else {
                    write!(f, "Protocol error: {}", message)
                }
            }
            DhtError::StorageError { message, source } => {
                if let Some(src) = source {
                    write!(f, "Storage error: {} (source: {})", message, src)
                } else {
                    write!(f, "Storage error: {}", message)
                }
            }
            DhtError::ConfigError { message, field } => {
                if let Some(field_val) = field {
                    write!(f, "Config error: {} (field: {})", message, field_val)
                } else {
                    write!(f, "Config error: {}", message)
                }
            }
        }
    }
}

impl std::error::Error for DhtError {}

impl From<std::io::Error> for DhtError {
    fn from(err: std::io::Error) -> Self {
        DhtError::NetworkError {
            message: err.to_string(),
            address: None,
            source: Some(err.kind().to_string()),
        }
    }
}

impl From<serde_bencode::Error> for DhtError {
    fn from(err: serde_bencode::Error) -> Self {
        DhtError::protocol_error_with_source("Failed to decode bencode data", err.to_string())
    }
}

impl From<serde_json::Error> for DhtError {
    fn from(err: serde_json::Error) -> Self {
        DhtError::config_error(format!("Failed to parse JSON configuration: {}", err))
    }
}

/// Result alias for DHT operations
pub type Result<T> = std::result::Result<T, DhtError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout() {
        let err = DhtError::timeout_after("get", Duration::from_secs(5));
        assert!(err.is_timeout());
        assert!(err.to_string().contains("Timeout"));
        assert!(err.to_string().contains("get"));
        assert!(err.to_string().contains("5s"));
    }

    #[test]
    fn test_network_error_full() {
        let err = DhtError::network_error_full("Failed to bind UDP socket", "127.0.0.1:9000", "address in use");
        assert!(!err.is_timeout());
        assert!(err.to_string().contains("Network error"));
        assert!(err.to_string().contains("127.0.0.1:9000"));
        assert!(err.to_string().contains("address in use"));
    }

    #[test]
    fn test_protocol_error_with_source() {
        let err = DhtError::protocol_error_with_source("Malformed datagram", "unknown kind");
        assert!(err.to_string().contains("Protocol error"));
        assert!(err.to_string().contains("unknown kind"));
    }

    #[test]
    fn test_config_error_with_field() {
        let err = DhtError::config_error_with_field("must be at least 1", "k");
        assert!(err.to_string().contains("Config error"));
        assert!(err.to_string().contains("field: k"));
    }

    #[test]
    fn test_storage_error() {
        let err = DhtError::storage_error_with_source("Failed to list stale keys", "disk full");
        assert_eq!(err.to_string(), "Storage error: Failed to list stale keys (source: disk full)");
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use");
        let err: DhtError = io_err.into();
        assert!(matches!(err, DhtError::NetworkError { .. }));
    }

    #[test]
    fn test_from_bencode_error() {
        let bencode_err = serde_bencode::de::from_bytes::<String>(b"i42e").unwrap_err();
        let err: DhtError = bencode_err.into();
        assert!(matches!(err, DhtError::ProtocolError { .. }));
        assert!(err.to_string().contains("bencode"));
    }
}
