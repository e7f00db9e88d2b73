//! Drivers selected by what a discovered device looks like

use std::net::SocketAddr;
use std::sync::Arc;

use ipremote_device::DeviceDriver;
use ipremote_discovery::DeviceDescription;

use crate::error::{RemoteError, Result};

/// Drivers in registration order, each keyed by its match predicate.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: Vec<Arc<dyn DeviceDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `driver`. Names must be unique.
    pub fn register(&mut self, driver: Arc<dyn DeviceDriver>) -> Result<()> {
        if self.get(driver.name()).is_some() {
            return Err(RemoteError::DuplicateDriver(driver.name().to_string()));
        }
        self.drivers.push(driver);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Option<Arc<dyn DeviceDriver>> {
        let index = self.drivers.iter().position(|driver| driver.name() == name)?;
        Some(self.drivers.remove(index))
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn DeviceDriver>> {
        self.drivers.iter().find(|driver| driver.name() == name)
    }

    /// First registered driver whose matcher accepts the device
    pub fn driver_for(
        &self,
        description: &DeviceDescription,
        source: SocketAddr,
    ) -> Option<&Arc<dyn DeviceDriver>> {
        self.drivers
            .iter()
            .find(|driver| driver.matcher().matches(description, source))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.drivers.iter().map(|driver| driver.name())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn DeviceDriver>> {
        self.drivers.iter()
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipremote_device::{Attachable, PortSource, Response};
    use ipremote_discovery::{DeviceMatcher, MatchStrategy};

    struct NamedDriver {
        name: &'static str,
        model: &'static str,
    }

    impl DeviceDriver for NamedDriver {
        fn name(&self) -> &str {
            self.name
        }

        fn matcher(&self) -> Arc<dyn MatchStrategy> {
            Arc::new(DeviceMatcher::new().model_name(self.model))
        }

        fn port(&self) -> PortSource {
            PortSource::Fixed(8102)
        }

        fn properties(&self) -> Vec<Arc<dyn Attachable>> {
            Vec::new()
        }

        fn handle_response(&self, _line: &str, _outstanding: Option<&str>) -> Response {
            Response::Unsolicited
        }
    }

    fn description(model: &str) -> DeviceDescription {
        let mut description = DeviceDescription::default();
        description.model_name = model.to_string();
        description.udn = "uuid:test".to_string();
        description
    }

    fn source() -> SocketAddr {
        "192.168.1.20:1900".parse().unwrap()
    }

    #[test]
    fn test_driver_for_uses_first_match() {
        let mut registry = DriverRegistry::new();
        registry
            .register(Arc::new(NamedDriver { name: "receiver", model: "VSX-1123" }))
            .unwrap();
        registry
            .register(Arc::new(NamedDriver { name: "player", model: "BDP-150" }))
            .unwrap();

        let found = registry.driver_for(&description("BDP-150"), source());
        assert_eq!(found.map(|driver| driver.name()), Some("player"));
        assert!(registry.driver_for(&description("KDL-40"), source()).is_none());
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["receiver", "player"]);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut registry = DriverRegistry::new();
        registry
            .register(Arc::new(NamedDriver { name: "receiver", model: "VSX-1123" }))
            .unwrap();

        let result = registry.register(Arc::new(NamedDriver { name: "receiver", model: "VSX-923" }));
        assert!(matches!(result, Err(RemoteError::DuplicateDriver(name)) if name == "receiver"));
        assert_eq!(registry.len(), 1);
    }
}
