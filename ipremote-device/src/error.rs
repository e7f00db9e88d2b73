use ipremote_discovery::DiscoveryError;
use ipremote_reactor::ReactorError;
use thiserror::Error;

/// Errors raised by the device layer
#[derive(Error, Debug)]
pub enum DeviceError {
    /// Missing, empty or ambiguous code table, or an invalid device setting
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// The property's code table has no entry for the command
    #[error("{property} has no command '{command}'")]
    UnknownCommand { property: String, command: String },

    /// A value outside what the property accepts
    #[error("Invalid value for {property}: {value}")]
    InvalidValue { property: String, value: String },

    #[error("Reactor error: {0}")]
    Reactor(#[from] ReactorError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;
