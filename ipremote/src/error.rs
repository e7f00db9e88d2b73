use thiserror::Error;

use crate::logging::LoggingError;

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Reactor error: {0}")]
    Reactor(#[from] ipremote_reactor::ReactorError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] ipremote_discovery::DiscoveryError),

    #[error("Device error: {0}")]
    Device(#[from] ipremote_device::DeviceError),

    #[error("Logging error: {0}")]
    Logging(#[from] LoggingError),

    #[error("Driver already registered: {0}")]
    DuplicateDriver(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Invalid device group: {0}")]
    InvalidGroup(String),
}

pub type Result<T> = std::result::Result<T, RemoteError>;
