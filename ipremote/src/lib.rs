//! Control IP home-theater devices
//!
//! Devices are found with SSDP, connected to over TCP and driven through
//! coded properties. A [`Remote`] wires the layers together:
//!
//! - [`ipremote_reactor`]: one thread multiplexing every socket
//! - [`ipremote_discovery`]: SSDP search, presence tracking and descriptions
//! - [`ipremote_device`]: command queuing, properties and device drivers
//!
//! Drivers are registered with the remote, which opens a [`Device`] for
//! each and connects it when a matching device appears on the network.
//! A [`DeviceGroupRegistry`] ties their aspects together per location and
//! activity.

pub mod logging;
pub mod samples;

mod config;
mod error;
mod groups;
mod registry;
mod system;

pub use config::RemoteConfig;
pub use error::{RemoteError, Result};
pub use groups::{
    DeviceGroup, DeviceGroupRegistry, GroupChange, GroupListenerId, GroupSelection, NO_SELECTION,
};
pub use registry::DriverRegistry;
pub use system::Remote;

pub use ipremote_device::{
    Attachable, CodeTable, CodedProperty, CommandChannel, Device, DeviceConfig, DeviceDriver,
    DeviceError, Menu, PortSource, Power, PropertyPoller, QueryOnPower, Response, Retry,
    Selection, Sound,
};
pub use ipremote_discovery::{
    DeviceDescription, DeviceMatcher, DiscoveryConfig, DiscoveryManager, MatchStrategy,
};
pub use ipremote_reactor::{ChannelManager, ReactorConfig, Scheduler, TokioScheduler};

pub use ipremote_device;
pub use ipremote_discovery;
pub use ipremote_reactor;
