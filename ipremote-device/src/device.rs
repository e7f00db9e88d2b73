//! Devices: a driver, its properties and one TCP connection
//!
//! A [`Device`] listens for discovery sightings accepted by its driver's
//! matcher. On a sighting it connects to the device's control port, hands
//! the connection to its [`CommandChannel`] and attaches that channel to
//! every property the driver exposes. Responses are split into lines and
//! passed to the driver, whose verdict acknowledges the outstanding command.

use std::fmt;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use ipremote_discovery::{
    DeviceDescription, DeviceHandle, DeviceListener, DiscoveryManager, ListenerId,
    MatchStrategy, MatchingListener,
};
use ipremote_reactor::{
    AsyncDispatch, ChannelCallback, ChannelEvent, ChannelId, ChannelManager, Scheduler,
    TcpChannel, TimerHandle,
};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::command_channel::{CommandChannel, CommandWriter};
use crate::config::DeviceConfig;
use crate::error::Result;
use crate::property::Attachable;

// ============================================================================
// Driver contract
// ============================================================================

/// Where a device's control port comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSource {
    Fixed(u16),
    /// The description's `X_ipRemoteTcpPort` element
    Description,
}

/// A driver's verdict on one response line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    /// Answers the outstanding command
    Handled,
    /// The device rejected the outstanding command
    Failed,
    /// Not an answer to the outstanding command; the queue is untouched
    Unsolicited,
}

/// Everything specific to one family of devices.
pub trait DeviceDriver: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Which discovered devices this driver controls
    fn matcher(&self) -> Arc<dyn MatchStrategy>;

    fn port(&self) -> PortSource;

    /// Appended to written codes that do not already end with it
    fn line_terminator(&self) -> &str {
        "\r"
    }

    /// Everything the command channel is attached to on connect
    fn properties(&self) -> Vec<Arc<dyn Attachable>>;

    /// Interpret one response line.
    ///
    /// `outstanding` is the command awaiting an answer, without its
    /// terminator.
    fn handle_response(&self, line: &str, outstanding: Option<&str>) -> Response;
}

// ============================================================================
// Device
// ============================================================================

struct Connection {
    udn: String,
    channel: TcpChannel,
}

struct DeviceState {
    listener: Option<ListenerId>,
    connection: Option<Connection>,
}

struct DeviceInner {
    driver: Arc<dyn DeviceDriver>,
    discovery: DiscoveryManager,
    reactor: ChannelManager,
    config: DeviceConfig,
    commands: CommandChannel,
    state: Mutex<DeviceState>,
}

/// A controllable device, connected while it is visible on the network.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    pub fn new(
        driver: Arc<dyn DeviceDriver>,
        reactor: ChannelManager,
        discovery: DiscoveryManager,
        config: DeviceConfig,
    ) -> Result<Self> {
        config.validate()?;
        let commands = CommandChannel::new(driver.name(), Arc::clone(reactor.scheduler()));
        commands.set_default_retry(config.default_retry);

        Ok(Self {
            inner: Arc::new(DeviceInner {
                driver,
                discovery,
                reactor,
                config,
                commands,
                state: Mutex::new(DeviceState {
                    listener: None,
                    connection: None,
                }),
            }),
        })
    }

    pub fn name(&self) -> &str {
        self.inner.driver.name()
    }

    pub fn driver(&self) -> &Arc<dyn DeviceDriver> {
        &self.inner.driver
    }

    pub fn command_channel(&self) -> &CommandChannel {
        &self.inner.commands
    }

    /// Start listening for the device. Opening twice is a no-op.
    pub fn open(&self) {
        let mut state = self.inner.state.lock();
        if state.listener.is_some() {
            return;
        }

        let listener = Arc::new(MatchingListener::new(
            self.inner.driver.matcher(),
            Arc::new(DeviceDiscoveryListener {
                device: Arc::downgrade(&self.inner),
            }),
        ));
        state.listener = Some(self.inner.discovery.add_device_listener(listener));
        info!("{}: waiting for device", self.name());
    }

    /// Stop listening, drop the connection and reset every property.
    pub fn close(&self) {
        let (listener, connection) = {
            let mut state = self.inner.state.lock();
            (state.listener.take(), state.connection.take())
        };

        if let Some(id) = listener {
            self.inner.discovery.remove_device_listener(id);
        }
        self.inner.detach();
        if let Some(connection) = connection {
            info!("{}: closing connection to {}", self.name(), connection.udn);
            connection.channel.close();
            // Untracked, so the next sighting after a reopen is announced again.
            self.inner.discovery.notify_device_removed(&connection.udn);
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.state.lock().listener.is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().connection.is_some()
    }

    /// UDN of the connected device
    pub fn udn(&self) -> Option<String> {
        self.inner
            .state
            .lock()
            .connection
            .as_ref()
            .map(|connection| connection.udn.clone())
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner
            .state
            .lock()
            .connection
            .as_ref()
            .and_then(|connection| connection.channel.remote_addr())
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name())
            .field("udn", &self.udn())
            .field("commands", &self.inner.commands)
            .finish()
    }
}

impl DeviceInner {
    fn connect(
        self: &Arc<Self>,
        description: &DeviceDescription,
        source: SocketAddr,
    ) -> Option<DeviceHandle> {
        let port = match self.driver.port() {
            PortSource::Fixed(port) => port,
            PortSource::Description => match description.control_port {
                Some(port) => port,
                None => {
                    warn!(
                        "{}: {} has no control port in its description",
                        self.driver.name(),
                        description.udn
                    );
                    return None;
                }
            },
        };
        let address = SocketAddr::new(source.ip(), port);

        // Held across connect so early events find the connection.
        let mut state = self.state.lock();
        if state.listener.is_none() {
            return None;
        }
        if let Some(current) = &state.connection {
            debug!(
                "{}: already connected to {}, ignoring {}",
                self.driver.name(),
                current.udn,
                description.udn
            );
            return None;
        }

        let handler = Arc::new(ConnectionHandler {
            device: Arc::downgrade(self),
        });
        let channel = match self.reactor.connect(
            address,
            self.config.connect_timeout,
            AsyncDispatch::wrap(Arc::clone(self.reactor.scheduler()), handler),
        ) {
            Ok(channel) => channel,
            Err(e) => {
                error!("{}: unable to connect to {}: {}", self.driver.name(), address, e);
                return None;
            }
        };

        info!(
            "{}: connecting to {} ({}) at {}",
            self.driver.name(),
            description.friendly_name,
            description.udn,
            address
        );
        let id = channel.id();
        self.commands.set_writer(Some(Arc::new(LineWriter::new(
            channel.clone(),
            self.driver.line_terminator(),
        ))));
        state.connection = Some(Connection {
            udn: description.udn.clone(),
            channel: channel.clone(),
        });
        for property in self.driver.properties() {
            property.attach(Some(self.commands.clone()));
        }

        Some(DeviceHandle::new(ConnectionHandle {
            udn: description.udn.clone(),
            channel: id,
        }))
    }

    /// Take the connection if `channel` is still the current one.
    fn take_connection(&self, channel: ChannelId) -> Option<Connection> {
        let mut state = self.state.lock();
        match &state.connection {
            Some(connection) if connection.channel.id() == channel => state.connection.take(),
            _ => None,
        }
    }

    fn is_current(&self, channel: ChannelId) -> bool {
        self.state
            .lock()
            .connection
            .as_ref()
            .map_or(false, |connection| connection.channel.id() == channel)
    }

    fn detach(&self) {
        self.commands.set_writer(None);
        for property in self.driver.properties() {
            property.attach(None);
        }
    }

    fn connection_lost(&self, channel: ChannelId) {
        let Some(connection) = self.take_connection(channel) else {
            return;
        };
        warn!(
            "{}: connection to {} lost",
            self.driver.name(),
            connection.udn
        );
        self.detach();
        self.discovery.notify_device_removed(&connection.udn);
    }

    fn handle_read(&self, data: &[u8]) {
        let text = String::from_utf8_lossy(data);
        for line in text.split(['\r', '\n']).filter(|line| !line.is_empty()) {
            let outstanding = self.commands.outstanding_request().map(|request| {
                String::from_utf8_lossy(&request)
                    .trim_end_matches(['\r', '\n'])
                    .to_string()
            });

            let verdict = panic::catch_unwind(AssertUnwindSafe(|| {
                self.driver.handle_response(line, outstanding.as_deref())
            }));
            match verdict {
                Ok(Response::Handled) => self.commands.acknowledge_response(true),
                Ok(Response::Failed) => self.commands.acknowledge_response(false),
                Ok(Response::Unsolicited) => {
                    debug!("{}: unsolicited '{}'", self.driver.name(), line);
                }
                Err(_) => {
                    error!(
                        "{}: parsing '{}' panicked (outstanding {:?})",
                        self.driver.name(),
                        line,
                        outstanding
                    );
                    if outstanding.is_some() {
                        self.commands.acknowledge_response(false);
                    }
                }
            }
        }
    }
}

/// Handle the discovery manager keeps for a connected device
#[derive(Debug)]
struct ConnectionHandle {
    udn: String,
    channel: ChannelId,
}

struct DeviceDiscoveryListener {
    device: Weak<DeviceInner>,
}

impl DeviceListener for DeviceDiscoveryListener {
    fn device_added(
        &self,
        description: &DeviceDescription,
        source: SocketAddr,
    ) -> Option<DeviceHandle> {
        self.device.upgrade()?.connect(description, source)
    }

    fn device_removed(&self, handle: DeviceHandle) {
        let Some(handle) = handle.downcast_ref::<ConnectionHandle>() else {
            return;
        };
        let Some(device) = self.device.upgrade() else {
            return;
        };
        if let Some(connection) = device.take_connection(handle.channel) {
            info!("{}: {} went away", device.driver.name(), handle.udn);
            connection.channel.close();
            device.detach();
        }
    }
}

struct ConnectionHandler {
    device: Weak<DeviceInner>,
}

impl ChannelCallback for ConnectionHandler {
    fn on_event(&self, event: ChannelEvent) {
        let Some(device) = self.device.upgrade() else {
            return;
        };
        match event {
            ChannelEvent::Opened { channel, remote } => {
                debug!("{}: channel {} open to {}", device.driver.name(), channel, remote);
            }
            ChannelEvent::Read { channel, data, .. } => {
                if device.is_current(channel) {
                    device.handle_read(&data);
                }
            }
            ChannelEvent::Closed { channel } | ChannelEvent::Failed { channel } => {
                device.connection_lost(channel);
            }
        }
    }
}

/// Terminates each command before it goes on the wire
struct LineWriter {
    channel: TcpChannel,
    terminator: Bytes,
}

impl LineWriter {
    fn new(channel: TcpChannel, terminator: &str) -> Self {
        Self {
            channel,
            terminator: Bytes::copy_from_slice(terminator.as_bytes()),
        }
    }
}

impl CommandWriter for LineWriter {
    fn write_command(&self, data: Bytes) -> ipremote_reactor::Result<()> {
        if self.terminator.is_empty() || data.ends_with(&self.terminator) {
            return self.channel.write(data);
        }
        let mut line = BytesMut::with_capacity(data.len() + self.terminator.len());
        line.extend_from_slice(&data);
        line.extend_from_slice(&self.terminator);
        self.channel.write(line.freeze())
    }
}

// ============================================================================
// PropertyPoller
// ============================================================================

/// Queries a property at a fixed period while active.
///
/// Used around slow transitions such as power-on warm-up, when devices stop
/// announcing changes on their own. Dropping the poller stops it.
pub struct PropertyPoller {
    scheduler: Arc<dyn Scheduler>,
    target: Arc<dyn Attachable>,
    period: Duration,
    timer: Mutex<Option<TimerHandle>>,
}

impl PropertyPoller {
    pub fn new(scheduler: Arc<dyn Scheduler>, target: Arc<dyn Attachable>, period: Duration) -> Self {
        Self {
            scheduler,
            target,
            period,
            timer: Mutex::new(None),
        }
    }

    /// Begin polling, first after one period. Starting twice is a no-op.
    pub fn start(&self) {
        let mut timer = self.timer.lock();
        if timer.is_some() {
            return;
        }
        let target = Arc::clone(&self.target);
        debug!("Polling {} every {:?}", target.name(), self.period);
        *timer = Some(self.scheduler.schedule_repeating(
            self.period,
            self.period,
            Arc::new(move || {
                if let Err(e) = target.query() {
                    warn!("Polling {} failed: {}", target.name(), e);
                }
            }),
        ));
    }

    pub fn stop(&self) {
        if let Some(timer) = self.timer.lock().take() {
            debug!("Stopped polling {}", self.target.name());
            timer.cancel();
        }
    }

    pub fn is_active(&self) -> bool {
        self.timer.lock().is_some()
    }
}

impl Drop for PropertyPoller {
    fn drop(&mut self) {
        self.stop();
    }
}
