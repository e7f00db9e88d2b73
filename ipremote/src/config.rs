//! Configuration for the whole remote

use ipremote_device::DeviceConfig;
use ipremote_discovery::DiscoveryConfig;
use ipremote_reactor::ReactorConfig;

use crate::error::Result;

/// Settings for every layer a [`Remote`](crate::Remote) wires together
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub reactor: ReactorConfig,
    pub discovery: DiscoveryConfig,
    pub device: DeviceConfig,

    /// Re-search for devices whose connection drops
    /// Default: true
    pub search_on_remove: bool,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            reactor: ReactorConfig::default(),
            discovery: DiscoveryConfig::default(),
            device: DeviceConfig::default(),
            search_on_remove: true,
        }
    }
}

impl RemoteConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// IPv4 multicast only, for hosts without IPv6
    pub fn ipv4_only() -> Self {
        Self {
            discovery: DiscoveryConfig::ipv4_only(),
            ..Self::new()
        }
    }

    pub fn with_reactor(mut self, reactor: ReactorConfig) -> Self {
        self.reactor = reactor;
        self
    }

    pub fn with_discovery(mut self, discovery: DiscoveryConfig) -> Self {
        self.discovery = discovery;
        self
    }

    pub fn with_device(mut self, device: DeviceConfig) -> Self {
        self.device = device;
        self
    }

    pub fn with_search_on_remove(mut self, enabled: bool) -> Self {
        self.search_on_remove = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.reactor.validate()?;
        self.discovery.validate()?;
        self.device.validate()?;
        Ok(())
    }
}
