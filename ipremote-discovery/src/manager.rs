//! SSDP discovery manager
//!
//! ```text
//!  multicast / unicast datagrams
//!            |
//!     [AsyncDispatch] ---> handle_datagram ---> device table
//!                                 |                  |
//!                          fetch description    expiry timers
//!                                 |                  |
//!                        listener.device_added  listener.device_removed
//! ```
//!
//! A device is tracked from its first sighting until its `max-age` runs out
//! without a refresh, it says ByeBye, its owner reports it gone or the
//! manager closes. Each listener that returned a handle on addition gets
//! exactly one `device_removed` with that handle.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use ipremote_reactor::{
    AsyncDispatch, ChannelCallback, ChannelEvent, ChannelManager, Scheduler, TimerHandle,
};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::config::DiscoveryConfig;
use crate::error::{DiscoveryError, Result};
use crate::fetch::{DescriptionFetcher, HttpDescriptionFetcher};
use crate::listener::{DeviceHandle, DeviceListener, ListenerId};
use crate::network::{local_interfaces, Network};
use crate::packet::{NotifyState, PacketType, SsdpPacket, SsdpSearchRequest, ROOT_DEVICE};

struct TrackedHandle {
    listener_id: ListenerId,
    listener: Arc<dyn DeviceListener>,
    handle: DeviceHandle,
}

struct DeviceRecord {
    generation: u64,
    arm: u64,
    expiry: Option<TimerHandle>,
    handles: Vec<TrackedHandle>,
}

#[derive(Default)]
struct Lifecycle {
    open: bool,
    epoch: u64,
    networks: Vec<Network>,
    search_timer: Option<TimerHandle>,
}

struct ManagerInner {
    config: DiscoveryConfig,
    reactor: ChannelManager,
    scheduler: Arc<dyn Scheduler>,
    fetcher: Arc<dyn DescriptionFetcher>,
    lifecycle: Mutex<Lifecycle>,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn DeviceListener>)>>,
    devices: Mutex<HashMap<String, DeviceRecord>>,
    next_listener_id: AtomicU64,
    next_generation: AtomicU64,
    next_arm: AtomicU64,
}

/// Finds devices over SSDP and tracks their presence.
///
/// Cloning yields another handle to the same manager.
#[derive(Clone)]
pub struct DiscoveryManager {
    inner: Arc<ManagerInner>,
}

/// Non-owning reference to a [`DiscoveryManager`]
#[derive(Clone)]
pub struct WeakDiscoveryManager {
    inner: Weak<ManagerInner>,
}

impl WeakDiscoveryManager {
    /// A reference that never upgrades
    pub fn detached() -> Self {
        Self { inner: Weak::new() }
    }

    pub fn upgrade(&self) -> Option<DiscoveryManager> {
        self.inner.upgrade().map(|inner| DiscoveryManager { inner })
    }
}

impl DiscoveryManager {
    /// Create a closed manager fetching descriptions over HTTP.
    pub fn new(reactor: ChannelManager, config: DiscoveryConfig) -> Result<Self> {
        let fetcher = Arc::new(HttpDescriptionFetcher::from_config(&config)?);
        Self::with_fetcher(reactor, config, fetcher)
    }

    /// Create a closed manager with a custom description fetcher.
    pub fn with_fetcher(
        reactor: ChannelManager,
        config: DiscoveryConfig,
        fetcher: Arc<dyn DescriptionFetcher>,
    ) -> Result<Self> {
        config.validate()?;
        let scheduler = Arc::clone(reactor.scheduler());
        Ok(Self {
            inner: Arc::new(ManagerInner {
                config,
                reactor,
                scheduler,
                fetcher,
                lifecycle: Mutex::new(Lifecycle::default()),
                listeners: Mutex::new(Vec::new()),
                devices: Mutex::new(HashMap::new()),
                next_listener_id: AtomicU64::new(1),
                next_generation: AtomicU64::new(1),
                next_arm: AtomicU64::new(1),
            }),
        })
    }

    pub fn downgrade(&self) -> WeakDiscoveryManager {
        WeakDiscoveryManager {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.inner.config
    }

    pub fn is_open(&self) -> bool {
        self.inner.lifecycle.lock().open
    }

    /// Open the reactor if needed, then join the configured groups and start
    /// the repeating search on the worker pool. Does nothing if already open.
    pub fn open(&self) -> Result<()> {
        let epoch = {
            let mut lifecycle = self.inner.lifecycle.lock();
            if lifecycle.open {
                return Ok(());
            }
            lifecycle.open = true;
            lifecycle.epoch += 1;
            lifecycle.epoch
        };

        if let Err(e) = self.inner.reactor.open() {
            self.inner.lifecycle.lock().open = false;
            return Err(e.into());
        }

        let weak = Arc::downgrade(&self.inner);
        self.inner.scheduler.execute(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                ManagerInner::start(&inner, epoch);
            }
        }));
        Ok(())
    }

    /// Stop searching, close every socket and report every tracked device as
    /// removed. Does nothing if not open.
    pub fn close(&self) {
        let (networks, search_timer) = {
            let mut lifecycle = self.inner.lifecycle.lock();
            if !lifecycle.open {
                return;
            }
            lifecycle.open = false;
            (
                std::mem::take(&mut lifecycle.networks),
                lifecycle.search_timer.take(),
            )
        };

        if let Some(timer) = search_timer {
            timer.cancel();
        }
        for network in &networks {
            network.close();
        }

        let records: Vec<(String, DeviceRecord)> = self.inner.devices.lock().drain().collect();
        info!(
            "Discovery closed; removing {} tracked device(s)",
            records.len()
        );
        for (udn, record) in records {
            self.inner.announce_removal(&udn, record);
        }
    }

    /// Register `listener`. Devices already tracked are not replayed.
    pub fn add_device_listener(&self, listener: Arc<dyn DeviceListener>) -> ListenerId {
        let id = ListenerId(self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.inner.listeners.lock().push((id, listener));
        debug!("Added device listener {:?}", id);
        id
    }

    /// Unregister a listener and forget its handles without calling it.
    /// Returns false if `id` was not registered.
    pub fn remove_device_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        if listeners.len() == before {
            return false;
        }

        let mut devices = self.inner.devices.lock();
        for record in devices.values_mut() {
            record.handles.retain(|tracked| tracked.listener_id != id);
        }
        debug!("Removed device listener {:?}", id);
        true
    }

    /// Send `request` from every open unicast socket of every network.
    pub fn search(&self, request: &SsdpSearchRequest) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock();
        let mut sent = 0;
        for network in lifecycle.networks.iter_mut() {
            let count = network.send(request);
            trace!(
                "Sent search for {} on {} socket(s) of {}",
                request.target,
                count,
                network.group()
            );
            sent += count;
        }

        if sent == 0 {
            return Err(DiscoveryError::NoNetwork);
        }
        debug!("Searching for {} from {} socket(s)", request.target, sent);
        Ok(())
    }

    /// Forget `udn` now, as if it had said ByeBye. Its next sighting adds it
    /// again.
    pub fn notify_device_removed(&self, udn: &str) {
        self.inner.remove_device(udn, None);
    }

    /// Process one received datagram.
    pub fn handle_datagram(&self, data: &[u8], from: SocketAddr) {
        self.inner.handle_datagram(data, from);
    }

    /// UDNs currently tracked
    pub fn tracked_devices(&self) -> Vec<String> {
        let mut udns: Vec<String> = self.inner.devices.lock().keys().cloned().collect();
        udns.sort();
        udns
    }

    pub fn is_tracked(&self, udn: &str) -> bool {
        self.inner.devices.lock().contains_key(udn)
    }
}

impl ManagerInner {
    fn start(self: &Arc<Self>, epoch: u64) {
        let callback = AsyncDispatch::wrap(
            Arc::clone(&self.scheduler),
            Arc::new(PacketHandler {
                manager: Arc::downgrade(self),
            }),
        );

        let mut networks = Vec::new();
        for group in &self.config.multicast_groups {
            let interfaces = local_interfaces(group.is_ipv6());
            if interfaces.is_empty() {
                debug!("No interfaces for {}; skipping", group);
                continue;
            }
            match Network::open(
                &self.reactor,
                *group,
                &interfaces,
                self.config.unicast_port,
                Arc::clone(&callback),
            ) {
                Ok(network) => networks.push(network),
                Err(e) => warn!("Unable to open discovery network {}: {}", group, e),
            }
        }

        let mut lifecycle = self.lifecycle.lock();
        if !lifecycle.open || lifecycle.epoch != epoch {
            for network in &networks {
                network.close();
            }
            return;
        }
        if networks.is_empty() {
            warn!("No discovery network could be opened");
        }
        lifecycle.networks = networks;

        let weak = Arc::downgrade(self);
        let request = self.config.search_request.clone();
        lifecycle.search_timer = Some(self.scheduler.schedule_repeating(
            Duration::ZERO,
            self.config.search_frequency,
            Arc::new(move || {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if let Err(e) = (DiscoveryManager { inner }).search(&request) {
                    debug!("Periodic search skipped: {}", e);
                }
            }),
        ));
        info!("Discovery started");
    }

    fn handle_datagram(self: &Arc<Self>, data: &[u8], from: SocketAddr) {
        if self.listeners.lock().is_empty() {
            return;
        }

        let packet = match SsdpPacket::from_bytes(data) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Dropping packet from {}: {}", from, e);
                return;
            }
        };

        if packet.packet_type() == PacketType::Search {
            return;
        }
        if packet.notification_type() != Some(ROOT_DEVICE) {
            return;
        }
        let Some(udn) = packet.udn() else {
            debug!("Dropping packet from {} without a USN", from);
            return;
        };

        match (packet.packet_type(), packet.notify_state()) {
            (PacketType::SearchResponse, _) | (PacketType::Notify, Some(NotifyState::Alive)) => {
                self.device_seen(&packet, udn, from)
            }
            (PacketType::Notify, Some(NotifyState::ByeBye)) => {
                debug!("{} said byebye", udn);
                self.remove_device(udn, None);
            }
            _ => trace!("Ignoring notify from {} without a known NTS", from),
        }
    }

    fn device_seen(self: &Arc<Self>, packet: &SsdpPacket, udn: &str, source: SocketAddr) {
        let lifetime = packet
            .max_age()
            .map(Duration::from_secs)
            .unwrap_or(self.config.default_max_age);

        let (generation, location) = {
            let mut devices = self.devices.lock();
            if let Some(record) = devices.get_mut(udn) {
                trace!("Refreshing {} for {:?}", udn, lifetime);
                self.arm_expiry(record, udn, lifetime);
                return;
            }

            let Some(location) = packet.location() else {
                debug!("Ignoring new device {} without a location", udn);
                return;
            };

            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            let mut record = DeviceRecord {
                generation,
                arm: 0,
                expiry: None,
                handles: Vec::new(),
            };
            self.arm_expiry(&mut record, udn, lifetime);
            devices.insert(udn.to_string(), record);
            info!("New device {} at {}", udn, location);
            (generation, location.to_string())
        };

        let inner = Arc::clone(self);
        let udn = udn.to_string();
        self.scheduler.execute(Box::new(move || {
            inner.announce(udn, location, source, generation);
        }));
    }

    fn arm_expiry(self: &Arc<Self>, record: &mut DeviceRecord, udn: &str, lifetime: Duration) {
        if let Some(timer) = record.expiry.take() {
            timer.cancel();
        }
        let arm = self.next_arm.fetch_add(1, Ordering::Relaxed);
        record.arm = arm;

        let weak = Arc::downgrade(self);
        let udn = udn.to_string();
        record.expiry = Some(self.scheduler.schedule(
            lifetime,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    debug!("{} expired", udn);
                    inner.remove_device(&udn, Some(arm));
                }
            }),
        ));
    }

    /// Fetch the description of a new device and offer it to every listener.
    fn announce(
        self: &Arc<Self>,
        udn: String,
        location: String,
        source: SocketAddr,
        generation: u64,
    ) {
        let description = match self.fetcher.fetch(&location) {
            Ok(description) => Arc::new(description),
            Err(e) => {
                warn!("Unable to describe {}: {}", udn, e);
                self.forget_undescribed(&udn, generation);
                return;
            }
        };

        let listeners: Vec<(ListenerId, Arc<dyn DeviceListener>)> = self.listeners.lock().clone();
        for (listener_id, listener) in listeners {
            let inner = Arc::clone(self);
            let udn = udn.clone();
            let description = Arc::clone(&description);
            self.scheduler.execute(Box::new(move || {
                if let Some(handle) = listener.device_added(&description, source) {
                    inner.record_handle(&udn, generation, listener_id, listener, handle);
                }
            }));
        }
    }

    /// Drop a record whose description could not be fetched so the next
    /// sighting tries again.
    fn forget_undescribed(&self, udn: &str, generation: u64) {
        let mut devices = self.devices.lock();
        let matches = devices
            .get(udn)
            .map_or(false, |record| record.generation == generation);
        if matches {
            if let Some(record) = devices.remove(udn) {
                if let Some(timer) = record.expiry {
                    timer.cancel();
                }
            }
        }
    }

    fn record_handle(
        &self,
        udn: &str,
        generation: u64,
        listener_id: ListenerId,
        listener: Arc<dyn DeviceListener>,
        handle: DeviceHandle,
    ) {
        let handle = {
            let listeners = self.listeners.lock();
            if !listeners.iter().any(|(id, _)| *id == listener_id) {
                return;
            }

            let mut devices = self.devices.lock();
            match devices.get_mut(udn) {
                Some(record) if record.generation == generation => {
                    record.handles.push(TrackedHandle {
                        listener_id,
                        listener,
                        handle,
                    });
                    return;
                }
                _ => handle,
            }
        };

        debug!("{} was removed before its listener answered", udn);
        listener.device_removed(handle);
    }

    /// Remove `udn`. With `arm`, only if that expiry is still the current one.
    fn remove_device(&self, udn: &str, arm: Option<u64>) {
        let record = {
            let mut devices = self.devices.lock();
            match devices.get(udn) {
                Some(record) if arm.map_or(true, |arm| arm == record.arm) => devices.remove(udn),
                _ => None,
            }
        };

        if let Some(record) = record {
            info!("Device {} removed", udn);
            self.announce_removal(udn, record);
        }
    }

    fn announce_removal(&self, udn: &str, record: DeviceRecord) {
        if let Some(timer) = record.expiry {
            timer.cancel();
        }
        for tracked in record.handles {
            trace!("Notifying listener {:?} of {} removal", tracked.listener_id, udn);
            let TrackedHandle {
                listener, handle, ..
            } = tracked;
            self.scheduler
                .execute(Box::new(move || listener.device_removed(handle)));
        }
    }
}

struct PacketHandler {
    manager: Weak<ManagerInner>,
}

impl ChannelCallback for PacketHandler {
    fn on_event(&self, event: ChannelEvent) {
        let ChannelEvent::Read { data, from, .. } = event else {
            return;
        };
        if let Some(manager) = self.manager.upgrade() {
            manager.handle_datagram(&data, from);
        }
    }
}

impl std::fmt::Debug for DiscoveryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryManager")
            .field("open", &self.is_open())
            .field("tracked", &self.inner.devices.lock().len())
            .finish()
    }
}
