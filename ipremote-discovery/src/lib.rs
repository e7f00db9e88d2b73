//! SSDP discovery of IP-controlled home-theater devices
//!
//! The [`DiscoveryManager`] joins the SSDP multicast groups on every local
//! interface, searches periodically and tracks each root device it sees until
//! the device expires, says goodbye or is reported gone. Listeners are told
//! about additions with the device's description and about removals with the
//! handle they returned.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use ipremote_discovery::{DiscoveryConfig, DiscoveryManager, LoggingListener};
//! use ipremote_reactor::{ChannelManager, ReactorConfig, Scheduler, TokioScheduler};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let scheduler: Arc<dyn Scheduler> = Arc::new(TokioScheduler::new(2)?);
//! let reactor = ChannelManager::new(ReactorConfig::default(), scheduler)?;
//! let discovery = DiscoveryManager::new(reactor, DiscoveryConfig::default())?;
//!
//! discovery.add_device_listener(Arc::new(LoggingListener));
//! discovery.open()?;
//! # Ok(())
//! # }
//! ```

mod config;
mod description;
mod error;
mod fetch;
mod listener;
mod manager;
mod network;
mod packet;

pub use config::{
    DiscoveryConfig, DEFAULT_CONTENT_TYPES, IPV4_GROUP, IPV6_LINK_LOCAL_GROUP,
    IPV6_SITE_LOCAL_GROUP, SSDP_PORT, UNICAST_PORT,
};
pub use description::{DeviceDescription, Service};
pub use error::{DiscoveryError, Result};
pub use fetch::{DescriptionFetcher, HttpDescriptionFetcher};
pub use listener::{
    DeviceHandle, DeviceListener, DeviceMatcher, ListenerId, LoggingListener, MatchStrategy,
    MatchingListener, SearchOnRemoveListener,
};
pub use manager::{DiscoveryManager, WeakDiscoveryManager};
pub use network::local_interfaces;
pub use packet::{NotifyState, PacketType, SsdpPacket, SsdpSearchRequest, ROOT_DEVICE};
