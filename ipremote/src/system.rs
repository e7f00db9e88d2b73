//! Remote - main entry point
//!
//! Wires one worker pool, one reactor and one discovery manager together and
//! keeps a [`Device`] per registered driver.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use ipremote_device::{Device, DeviceDriver};
use ipremote_discovery::{
    DeviceDescription, DiscoveryManager, ListenerId, LoggingListener, SearchOnRemoveListener,
};
use ipremote_reactor::{ChannelManager, Scheduler, TokioScheduler};
use parking_lot::{Mutex, RwLock};
use tracing::info;

use crate::config::RemoteConfig;
use crate::error::{RemoteError, Result};
use crate::groups::DeviceGroupRegistry;
use crate::registry::DriverRegistry;

/// Discovers and controls every device a registered driver matches.
///
/// All operations are synchronous; device traffic runs on the reactor
/// thread and the worker pool.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use ipremote::{samples::Receiver, Remote, RemoteConfig};
///
/// fn main() -> Result<(), ipremote::RemoteError> {
///     let remote = Remote::new(RemoteConfig::new())?;
///     let receiver = Arc::new(Receiver::new()?);
///     remote.register(receiver.clone())?;
///     remote.open()?;
///
///     receiver.zone1().power().property().add_listener(|name| {
///         println!("{} changed", name);
///     });
///     receiver.zone1().power().power_on()?;
///     Ok(())
/// }
/// ```
pub struct Remote {
    config: RemoteConfig,
    scheduler: Arc<dyn Scheduler>,
    reactor: ChannelManager,
    discovery: DiscoveryManager,
    registry: RwLock<DriverRegistry>,
    devices: RwLock<HashMap<String, Device>>,
    groups: DeviceGroupRegistry,
    stock_listeners: Mutex<Vec<ListenerId>>,
}

impl Remote {
    /// Create a closed remote with its own worker pool.
    pub fn new(config: RemoteConfig) -> Result<Self> {
        config.validate()?;
        let scheduler: Arc<dyn Scheduler> = Arc::new(TokioScheduler::from_config(&config.reactor)?);
        Self::with_scheduler(config, scheduler)
    }

    /// Create a closed remote running its tasks on `scheduler`.
    pub fn with_scheduler(config: RemoteConfig, scheduler: Arc<dyn Scheduler>) -> Result<Self> {
        config.validate()?;
        let reactor = ChannelManager::new(config.reactor.clone(), Arc::clone(&scheduler))?;
        let discovery = DiscoveryManager::new(reactor.clone(), config.discovery.clone())?;

        Ok(Self {
            config,
            scheduler,
            reactor,
            discovery,
            registry: RwLock::new(DriverRegistry::new()),
            devices: RwLock::new(HashMap::new()),
            groups: DeviceGroupRegistry::new(),
            stock_listeners: Mutex::new(Vec::new()),
        })
    }

    /// Add a driver and create its device, opened if the remote is open.
    pub fn register(&self, driver: Arc<dyn DeviceDriver>) -> Result<Device> {
        let device = Device::new(
            Arc::clone(&driver),
            self.reactor.clone(),
            self.discovery.clone(),
            self.config.device.clone(),
        )?;
        self.registry.write().register(driver)?;
        self.devices
            .write()
            .insert(device.name().to_string(), device.clone());

        if self.is_open() {
            device.open();
        }
        info!("Registered driver {}", device.name());
        Ok(device)
    }

    /// Close and forget the device of driver `name`.
    pub fn unregister(&self, name: &str) -> Result<()> {
        let device = self
            .devices
            .write()
            .remove(name)
            .ok_or_else(|| RemoteError::DeviceNotFound(name.to_string()))?;
        self.registry.write().remove(name);
        device.close();
        Ok(())
    }

    /// Start discovery and open every device.
    pub fn open(&self) -> Result<()> {
        self.discovery.open()?;

        {
            let mut stock = self.stock_listeners.lock();
            if stock.is_empty() {
                stock.push(self.discovery.add_device_listener(Arc::new(LoggingListener)));
                if self.config.search_on_remove {
                    stock.push(self.discovery.add_device_listener(Arc::new(
                        SearchOnRemoveListener::new(self.discovery.downgrade()),
                    )));
                }
            }
        }

        for device in self.devices() {
            device.open();
        }
        info!("Remote open with {} device(s)", self.devices.read().len());
        Ok(())
    }

    /// Deactivate the active group, then close every device, discovery and
    /// the reactor. Idempotent.
    pub fn close(&self) {
        self.groups.deactivate();
        for device in self.devices() {
            device.close();
        }
        let stock: Vec<ListenerId> = self.stock_listeners.lock().drain(..).collect();
        for id in stock {
            self.discovery.remove_device_listener(id);
        }
        self.discovery.close();
        self.reactor.close();
    }

    pub fn is_open(&self) -> bool {
        self.discovery.is_open()
    }

    /// Send the configured search request now.
    pub fn search(&self) -> Result<()> {
        self.discovery.search(&self.config.discovery.search_request)?;
        Ok(())
    }

    pub fn device(&self, name: &str) -> Option<Device> {
        self.devices.read().get(name).cloned()
    }

    pub fn devices(&self) -> Vec<Device> {
        self.devices.read().values().cloned().collect()
    }

    pub fn device_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.devices.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Name of the driver that would control a device described this way
    pub fn identify(&self, description: &DeviceDescription, source: SocketAddr) -> Option<String> {
        self.registry
            .read()
            .driver_for(description, source)
            .map(|driver| driver.name().to_string())
    }

    /// Device groups of the registered drivers' aspects
    pub fn groups(&self) -> &DeviceGroupRegistry {
        &self.groups
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    pub fn reactor(&self) -> &ChannelManager {
        &self.reactor
    }

    pub fn discovery(&self) -> &DiscoveryManager {
        &self.discovery
    }
}

impl Drop for Remote {
    fn drop(&mut self) {
        self.close();
    }
}
