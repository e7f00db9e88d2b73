//! Error types for the discovery system.

use std::fmt;

use ipremote_reactor::ReactorError;

/// Error type for discovery operations.
#[derive(Debug)]
pub enum DiscoveryError {
    /// Network-related errors (HTTP requests, interface enumeration, etc.)
    NetworkError(String),
    /// Parsing errors (XML, SSDP packet, etc.)
    ParseError(String),
    /// No socket is open to send a search on
    NoNetwork,
    /// A match predicate named a field that cannot be matched on
    UnsupportedMatchField(String),
    /// Invalid discovery configuration
    Configuration(String),
    /// Failure reported by the reactor
    Reactor(ReactorError),
}

impl fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryError::NetworkError(msg) => write!(f, "Network error: {}", msg),
            DiscoveryError::ParseError(msg) => write!(f, "Parse error: {}", msg),
            DiscoveryError::NoNetwork => write!(f, "No discovery network is open"),
            DiscoveryError::UnsupportedMatchField(field) => {
                write!(f, "Unsupported match field: {}", field)
            }
            DiscoveryError::Configuration(msg) => write!(f, "Invalid configuration: {}", msg),
            DiscoveryError::Reactor(e) => write!(f, "Reactor error: {}", e),
        }
    }
}

impl std::error::Error for DiscoveryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DiscoveryError::Reactor(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ReactorError> for DiscoveryError {
    fn from(e: ReactorError) -> Self {
        DiscoveryError::Reactor(e)
    }
}

/// Convenience Result type alias for discovery operations.
pub type Result<T> = std::result::Result<T, DiscoveryError>;
