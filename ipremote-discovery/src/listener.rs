//! Device listeners and match strategies
//!
//! A listener sees every new device with its description and source address
//! and returns a [`DeviceHandle`] if it wants to hear about the device's
//! removal. Returning `None` means "not interested".

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::description::DeviceDescription;
use crate::error::{DiscoveryError, Result};
use crate::manager::WeakDiscoveryManager;
use crate::packet::SsdpSearchRequest;

/// Identifies a registered listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub(crate) u64);

/// Opaque value a listener returns from `device_added` and receives back in
/// `device_removed`.
#[derive(Clone)]
pub struct DeviceHandle(Arc<dyn Any + Send + Sync>);

impl DeviceHandle {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    pub fn from_arc<T: Any + Send + Sync>(value: Arc<T>) -> Self {
        Self(value)
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    pub fn downcast_arc<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.0).downcast::<T>().ok()
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DeviceHandle(..)")
    }
}

/// Receives device additions and removals, off the reactor thread.
pub trait DeviceListener: Send + Sync {
    fn device_added(
        &self,
        description: &DeviceDescription,
        source: SocketAddr,
    ) -> Option<DeviceHandle>;

    fn device_removed(&self, handle: DeviceHandle);
}

/// Decides whether a sighting is a device of interest.
pub trait MatchStrategy: Send + Sync {
    fn matches(&self, description: &DeviceDescription, source: SocketAddr) -> bool;
}

impl<F> MatchStrategy for F
where
    F: Fn(&DeviceDescription, SocketAddr) -> bool + Send + Sync,
{
    fn matches(&self, description: &DeviceDescription, source: SocketAddr) -> bool {
        self(description, source)
    }
}

/// Exact match on description fields; `None` matches anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceMatcher {
    pub device_type: Option<String>,
    pub friendly_name: Option<String>,
    pub model_name: Option<String>,
}

impl DeviceMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device_type(mut self, device_type: impl Into<String>) -> Self {
        self.device_type = Some(device_type.into());
        self
    }

    pub fn friendly_name(mut self, friendly_name: impl Into<String>) -> Self {
        self.friendly_name = Some(friendly_name.into());
        self
    }

    pub fn model_name(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = Some(model_name.into());
        self
    }

    /// Build a matcher from `(field, value)` pairs using description element
    /// names (`deviceType`, `friendlyName`, `modelName`).
    pub fn from_fields<I, K, V>(fields: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut matcher = Self::new();
        for (field, value) in fields {
            match field.as_ref() {
                "deviceType" => matcher.device_type = Some(value.into()),
                "friendlyName" => matcher.friendly_name = Some(value.into()),
                "modelName" => matcher.model_name = Some(value.into()),
                other => return Err(DiscoveryError::UnsupportedMatchField(other.to_string())),
            }
        }
        Ok(matcher)
    }
}

fn field_matches(expected: &Option<String>, actual: &str) -> bool {
    expected.as_deref().map_or(true, |expected| expected == actual)
}

impl MatchStrategy for DeviceMatcher {
    fn matches(&self, description: &DeviceDescription, _source: SocketAddr) -> bool {
        field_matches(&self.device_type, &description.device_type)
            && field_matches(&self.friendly_name, &description.friendly_name)
            && field_matches(&self.model_name, &description.model_name)
    }
}

/// Forwards only sightings accepted by a [`MatchStrategy`].
pub struct MatchingListener {
    strategy: Arc<dyn MatchStrategy>,
    inner: Arc<dyn DeviceListener>,
}

impl MatchingListener {
    pub fn new(strategy: Arc<dyn MatchStrategy>, inner: Arc<dyn DeviceListener>) -> Self {
        Self { strategy, inner }
    }
}

impl DeviceListener for MatchingListener {
    fn device_added(
        &self,
        description: &DeviceDescription,
        source: SocketAddr,
    ) -> Option<DeviceHandle> {
        if self.strategy.matches(description, source) {
            self.inner.device_added(description, source)
        } else {
            None
        }
    }

    fn device_removed(&self, handle: DeviceHandle) {
        self.inner.device_removed(handle);
    }
}

/// Logs every addition and removal.
#[derive(Debug, Default)]
pub struct LoggingListener;

impl DeviceListener for LoggingListener {
    fn device_added(
        &self,
        description: &DeviceDescription,
        source: SocketAddr,
    ) -> Option<DeviceHandle> {
        info!(
            "Device added: {} \"{}\" ({}) at {}",
            description.udn, description.friendly_name, description.model_name, source
        );
        Some(DeviceHandle::new(description.udn.clone()))
    }

    fn device_removed(&self, handle: DeviceHandle) {
        match handle.downcast_ref::<String>() {
            Some(udn) => info!("Device removed: {}", udn),
            None => info!("Device removed"),
        }
    }
}

/// Searches for a device again when it is removed, so a device that only
/// missed its refresh is found again quickly. Searches for one UDN are
/// limited to one per `min_interval`.
pub struct SearchOnRemoveListener {
    manager: WeakDiscoveryManager,
    mx: u32,
    min_interval: Duration,
    last_search: Mutex<HashMap<String, Instant>>,
}

impl SearchOnRemoveListener {
    pub fn new(manager: WeakDiscoveryManager) -> Self {
        Self {
            manager,
            mx: 3,
            min_interval: Duration::from_secs(60),
            last_search: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.min_interval = min_interval;
        self
    }

    fn should_search(&self, udn: &str, now: Instant) -> bool {
        let mut last_search = self.last_search.lock();
        match last_search.get(udn) {
            Some(last) if now.duration_since(*last) < self.min_interval => false,
            _ => {
                last_search.insert(udn.to_string(), now);
                true
            }
        }
    }
}

impl DeviceListener for SearchOnRemoveListener {
    fn device_added(
        &self,
        description: &DeviceDescription,
        _source: SocketAddr,
    ) -> Option<DeviceHandle> {
        if description.udn.is_empty() {
            return None;
        }
        Some(DeviceHandle::new(description.udn.clone()))
    }

    fn device_removed(&self, handle: DeviceHandle) {
        let Some(udn) = handle.downcast_ref::<String>() else {
            return;
        };
        if !self.should_search(udn, Instant::now()) {
            debug!("Skipping search for {}; searched recently", udn);
            return;
        }
        let Some(manager) = self.manager.upgrade() else {
            return;
        };

        debug!("Searching for removed device {}", udn);
        if let Err(e) = manager.search(&SsdpSearchRequest::new(udn.clone(), self.mx)) {
            warn!("Search for {} failed: {}", udn, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn receiver() -> DeviceDescription {
        DeviceDescription {
            device_type: "urn:schemas-upnp-org:device:MediaRenderer:1".to_string(),
            friendly_name: "VSX-1123".to_string(),
            model_name: "VSX-1123/CUXESM".to_string(),
            udn: "uuid:receiver".to_string(),
            ..Default::default()
        }
    }

    fn source() -> SocketAddr {
        "192.168.1.20:1900".parse().unwrap()
    }

    #[test]
    fn test_matcher_none_is_dont_care() {
        assert!(DeviceMatcher::new().matches(&receiver(), source()));
        assert!(DeviceMatcher::new()
            .friendly_name("VSX-1123")
            .matches(&receiver(), source()));
    }

    #[test]
    fn test_matcher_requires_exact_values() {
        let matcher = DeviceMatcher::new()
            .device_type("urn:schemas-upnp-org:device:MediaRenderer:1")
            .model_name("VSX-1123");
        assert!(!matcher.matches(&receiver(), source()));
        assert!(!DeviceMatcher::new()
            .friendly_name("VSX-1123")
            .matches(&DeviceDescription::default(), source()));
    }

    #[test]
    fn test_matcher_from_fields() {
        let matcher = DeviceMatcher::from_fields([
            ("deviceType", "urn:schemas-upnp-org:device:MediaRenderer:1"),
            ("modelName", "VSX-1123/CUXESM"),
        ])
        .unwrap();
        assert!(matcher.matches(&receiver(), source()));

        let result = DeviceMatcher::from_fields([("serialNumber", "123")]);
        assert!(matches!(
            result,
            Err(DiscoveryError::UnsupportedMatchField(field)) if field == "serialNumber"
        ));
    }

    struct Counting {
        added: AtomicUsize,
        removed: AtomicUsize,
    }

    impl DeviceListener for Counting {
        fn device_added(&self, _: &DeviceDescription, _: SocketAddr) -> Option<DeviceHandle> {
            self.added.fetch_add(1, Ordering::SeqCst);
            Some(DeviceHandle::new(()))
        }

        fn device_removed(&self, _: DeviceHandle) {
            self.removed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_matching_listener_filters_with_closure_strategy() {
        let inner = Arc::new(Counting {
            added: AtomicUsize::new(0),
            removed: AtomicUsize::new(0),
        });
        let only_lan: Arc<dyn MatchStrategy> = Arc::new(
            |_: &DeviceDescription, source: SocketAddr| source.ip().to_string().starts_with("192.168."),
        );
        let listener = MatchingListener::new(only_lan, inner.clone());

        assert!(listener
            .device_added(&receiver(), "10.0.0.5:1900".parse().unwrap())
            .is_none());
        let handle = listener.device_added(&receiver(), source()).unwrap();
        listener.device_removed(handle);

        assert_eq!(inner.added.load(Ordering::SeqCst), 1);
        assert_eq!(inner.removed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_device_handle_downcast() {
        let handle = DeviceHandle::new(String::from("uuid:receiver"));
        assert_eq!(
            handle.downcast_ref::<String>().map(String::as_str),
            Some("uuid:receiver")
        );
        assert!(handle.downcast_ref::<u32>().is_none());
        assert!(handle.downcast_arc::<String>().is_some());
    }

    #[test]
    fn test_search_on_remove_rate_limit() {
        let listener = SearchOnRemoveListener::new(WeakDiscoveryManager::detached())
            .with_min_interval(Duration::from_secs(60));
        let start = Instant::now();

        assert!(listener.should_search("uuid:receiver", start));
        assert!(!listener.should_search("uuid:receiver", start + Duration::from_secs(30)));
        assert!(listener.should_search("uuid:player", start + Duration::from_secs(30)));
        assert!(listener.should_search("uuid:receiver", start + Duration::from_secs(61)));
    }
}
