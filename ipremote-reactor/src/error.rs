use std::net::IpAddr;
use thiserror::Error;

use crate::channel::ChannelId;

/// Errors that can occur in the reactor and its channels
#[derive(Error, Debug)]
pub enum ReactorError {
    /// The reactor has not been opened, or has been closed
    #[error("Reactor is not open")]
    NotOpen,

    /// A write or send was attempted on a closed channel
    #[error("Channel {0} is closed")]
    ChannelClosed(ChannelId),

    /// No interface accepted the multicast membership
    #[error("Failed to join multicast group {group} on any interface")]
    MulticastJoin { group: IpAddr },

    /// Invalid reactor configuration
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Socket or poll failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for reactor operations
pub type Result<T> = std::result::Result<T, ReactorError>;
