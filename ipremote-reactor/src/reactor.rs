//! Channel manager and its poll thread
//!
//! # Architecture
//!
//! ```text
//! +-------------------------------------------------------------+
//! |                     ChannelManager                          |
//! |  connect / listen_* / send_datagram / close                 |
//! |        |                                                    |
//! |        v  Command queue + Waker                             |
//! |  +-------------------------------------------------------+  |
//! |  |                 PollThread (mio::Poll)                |  |
//! |  |  1. drain commands (register, send, shutdown)         |  |
//! |  |  2. tear down closed channels, refresh interest       |  |
//! |  |  3. wait for readiness                                |  |
//! |  |  4. finish connects, flush writes, read bytes         |  |
//! |  +-------------------------------------------------------+  |
//! |        |                                                    |
//! |        v  ChannelEvent                                      |
//! |  ChannelCallback (directly, or through AsyncDispatch)       |
//! +-------------------------------------------------------------+
//! ```
//!
//! Channel handles only touch their shared core. Sockets are registered,
//! polled and dropped by the poll thread alone.

use std::collections::{HashMap, HashSet};
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::{Buf, Bytes};
use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use mio::net::{TcpStream, UdpSocket};
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info, warn};

use crate::channel::{
    ChannelCallback, ChannelCore, ChannelEvent, ChannelId, ChannelKind, ChannelState,
    DatagramChannel, TcpChannel,
};
use crate::config::ReactorConfig;
use crate::error::{ReactorError, Result};
use crate::interface::Interface;
use crate::scheduler::Scheduler;

// ============================================================================
// Constants
// ============================================================================

/// Token for the waker
const WAKER_TOKEN: Token = Token(0);

/// Channel ids start above the waker token
const FIRST_CHANNEL_ID: u64 = 1;

// ============================================================================
// Commands
// ============================================================================

enum Command {
    RegisterTcp {
        stream: TcpStream,
        core: Arc<ChannelCore>,
    },
    RegisterDatagram {
        socket: UdpSocket,
        core: Arc<ChannelCore>,
    },
    SendDatagram {
        to: SocketAddr,
        data: Bytes,
    },
    Shutdown,
}

// ============================================================================
// Channel Manager
// ============================================================================

struct Running {
    commands: Sender<Command>,
    waker: Arc<Waker>,
    thread: Option<JoinHandle<()>>,
}

struct ManagerInner {
    config: ReactorConfig,
    scheduler: Arc<dyn Scheduler>,
    next_id: AtomicU64,
    running: Mutex<Option<Running>>,
}

/// Owns the multiplexer and the single thread polling it.
///
/// Cloning yields another handle to the same reactor.
#[derive(Clone)]
pub struct ChannelManager {
    inner: Arc<ManagerInner>,
}

impl ChannelManager {
    /// Create a closed reactor. `scheduler` arms connect timeouts.
    pub fn new(config: ReactorConfig, scheduler: Arc<dyn Scheduler>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(ManagerInner {
                config,
                scheduler,
                next_id: AtomicU64::new(FIRST_CHANNEL_ID),
                running: Mutex::new(None),
            }),
        })
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.inner.scheduler
    }

    pub fn is_open(&self) -> bool {
        self.inner.running.lock().is_some()
    }

    /// Create the multiplexer and start the poll thread. Does nothing if
    /// already open.
    pub fn open(&self) -> Result<()> {
        let mut running = self.inner.running.lock();
        if running.is_some() {
            return Ok(());
        }

        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (commands, command_rx) = channel::unbounded();

        let poller = PollThread::new(poll, command_rx, &self.inner.config);
        let thread = thread::Builder::new()
            .name(self.inner.config.thread_name.clone())
            .spawn(move || poller.run())?;

        *running = Some(Running {
            commands,
            waker,
            thread: Some(thread),
        });

        info!("Reactor opened");
        Ok(())
    }

    /// Stop the poll thread and close every live channel. Does nothing if
    /// already closed.
    pub fn close(&self) {
        let Some(mut running) = self.inner.running.lock().take() else {
            return;
        };

        let _ = running.commands.send(Command::Shutdown);
        if let Err(e) = running.waker.wake() {
            warn!("Failed to wake reactor for shutdown: {}", e);
        }

        if let Some(handle) = running.thread.take() {
            if handle.thread().id() == thread::current().id() {
                // Closed from a callback; the loop exits once it returns.
                debug!("Reactor closed from its own thread");
            } else if handle.join().is_err() {
                error!("Reactor thread panicked");
            }
        }

        info!("Reactor closed");
    }

    /// Start a non-blocking connect to `address`.
    ///
    /// The returned channel accepts writes immediately; they are flushed once
    /// the connect completes. A non-zero `timeout` closes the channel if it
    /// is still connecting when the deadline passes.
    pub fn connect(
        &self,
        address: SocketAddr,
        timeout: Duration,
        callback: Arc<dyn ChannelCallback>,
    ) -> Result<TcpChannel> {
        let (commands, waker) = self.handles()?;
        let stream = TcpStream::connect(address)?;
        let core = Arc::new(ChannelCore::tcp(
            self.next_id(),
            address,
            callback,
            Arc::clone(&waker),
        ));

        if !timeout.is_zero() {
            let weak = Arc::downgrade(&core);
            let timer = self.inner.scheduler.schedule(
                timeout,
                Box::new(move || {
                    if let Some(core) = weak.upgrade() {
                        if core.state() == ChannelState::Connecting {
                            warn!("Connect to {} timed out", address);
                            core.close();
                        }
                    }
                }),
            );
            core.set_connect_timer(timer);
        }

        debug!("Connecting channel {} to {}", core.id(), address);
        Self::submit(
            &commands,
            &waker,
            Command::RegisterTcp {
                stream,
                core: Arc::clone(&core),
            },
        )?;
        Ok(TcpChannel::new(core))
    }

    /// Bind a UDP receiver on `address`.
    pub fn listen_datagram(
        &self,
        address: SocketAddr,
        callback: Arc<dyn ChannelCallback>,
    ) -> Result<DatagramChannel> {
        let (commands, waker) = self.handles()?;
        let socket = bind_udp(address)?;
        self.register_datagram(socket, callback, commands, waker)
    }

    /// Bind `group`'s port and join the group on every interface in
    /// `interfaces`.
    ///
    /// IPv4 memberships are made per interface address, IPv6 memberships per
    /// interface index.
    pub fn listen_multigram(
        &self,
        group: SocketAddr,
        interfaces: &[Interface],
        callback: Arc<dyn ChannelCallback>,
    ) -> Result<DatagramChannel> {
        let (commands, waker) = self.handles()?;
        let bind_addr = match group {
            SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), group.port()),
            SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), group.port()),
        };
        let socket = reusable_socket(bind_addr)?;

        let mut joined = 0usize;
        match group.ip() {
            IpAddr::V4(group_ip) => {
                for interface in interfaces {
                    let IpAddr::V4(interface_ip) = interface.address else {
                        continue;
                    };
                    match socket.join_multicast_v4(&group_ip, &interface_ip) {
                        Ok(()) => joined += 1,
                        Err(e) => warn!(
                            "Failed to join {} on interface {}: {}",
                            group_ip, interface_ip, e
                        ),
                    }
                }
            }
            IpAddr::V6(group_ip) => {
                // An interface with several addresses is joined once.
                let mut indexes = HashSet::new();
                for interface in interfaces.iter().filter(|interface| interface.is_ipv6()) {
                    if !indexes.insert(interface.index) {
                        continue;
                    }
                    match socket.join_multicast_v6(&group_ip, interface.index) {
                        Ok(()) => joined += 1,
                        Err(e) => warn!(
                            "Failed to join {} on interface {} (index {}): {}",
                            group_ip, interface.name, interface.index, e
                        ),
                    }
                }
            }
        }

        if joined == 0 {
            return Err(ReactorError::MulticastJoin { group: group.ip() });
        }

        debug!("Joined {} on {} interface(s)", group, joined);
        self.register_datagram(socket.into(), callback, commands, waker)
    }

    /// Send one datagram to `address` from an unbound socket. Errors after
    /// queuing are logged, not reported.
    pub fn send_datagram(&self, address: SocketAddr, data: impl Into<Bytes>) -> Result<()> {
        let (commands, waker) = self.handles()?;
        Self::submit(
            &commands,
            &waker,
            Command::SendDatagram {
                to: address,
                data: data.into(),
            },
        )
    }

    fn register_datagram(
        &self,
        socket: std::net::UdpSocket,
        callback: Arc<dyn ChannelCallback>,
        commands: Sender<Command>,
        waker: Arc<Waker>,
    ) -> Result<DatagramChannel> {
        socket.set_nonblocking(true)?;
        let local = socket.local_addr()?;
        let core = Arc::new(ChannelCore::datagram(
            self.next_id(),
            local,
            callback,
            Arc::clone(&waker),
        ));

        debug!("Listening on {} as channel {}", local, core.id());
        Self::submit(
            &commands,
            &waker,
            Command::RegisterDatagram {
                socket: UdpSocket::from_std(socket),
                core: Arc::clone(&core),
            },
        )?;
        Ok(DatagramChannel::new(core))
    }

    fn handles(&self) -> Result<(Sender<Command>, Arc<Waker>)> {
        let running = self.inner.running.lock();
        let running = running.as_ref().ok_or(ReactorError::NotOpen)?;
        Ok((running.commands.clone(), Arc::clone(&running.waker)))
    }

    fn submit(commands: &Sender<Command>, waker: &Waker, command: Command) -> Result<()> {
        commands.send(command).map_err(|_| ReactorError::NotOpen)?;
        waker.wake()?;
        Ok(())
    }

    fn next_id(&self) -> ChannelId {
        ChannelId(self.inner.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// UDP socket with address reuse, bound to `address`.
fn reusable_socket(address: SocketAddr) -> io::Result<Socket> {
    let domain = match address {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    if address.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.bind(&address.into())?;
    Ok(socket)
}

fn bind_udp(address: SocketAddr) -> io::Result<std::net::UdpSocket> {
    Ok(reusable_socket(address)?.into())
}

// ============================================================================
// Poll Thread
// ============================================================================

enum Source {
    Tcp(TcpStream),
    Datagram(UdpSocket),
}

impl Source {
    fn as_event_source(&mut self) -> &mut dyn mio::event::Source {
        match self {
            Source::Tcp(stream) => stream,
            Source::Datagram(socket) => socket,
        }
    }
}

struct Registration {
    source: Source,
    core: Arc<ChannelCore>,
    interest: Interest,
}

impl Registration {
    fn wanted_interest(&self) -> Interest {
        let writing = self.core.state() == ChannelState::Connecting || self.core.has_pending();
        if writing {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        }
    }

    /// Complete an in-flight connect once the socket reports readiness.
    fn finish_connect(&mut self) {
        let Source::Tcp(stream) = &self.source else {
            return;
        };

        match stream.take_error() {
            Ok(None) => {}
            Ok(Some(e)) | Err(e) => {
                debug!("Connect for channel {} failed: {}", self.core.id(), e);
                self.core.close();
                return;
            }
        }

        match stream.peer_addr() {
            Ok(remote) => {
                if self.core.mark_open() {
                    info!("Channel {} connected to {}", self.core.id(), remote);
                    self.core.emit(ChannelEvent::Opened {
                        channel: self.core.id(),
                        remote,
                    });
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotConnected => {}
            Err(e) => {
                debug!("Connect for channel {} failed: {}", self.core.id(), e);
                self.core.close();
            }
        }
    }

    /// Write queued buffers until the queue empties or the socket would block.
    fn flush(&mut self) {
        loop {
            if self.core.is_closed() {
                return;
            }
            let front = self.core.pending.lock().front().cloned();
            let Some(write) = front else {
                return;
            };

            match &mut self.source {
                Source::Tcp(stream) => match stream.write(&write.data) {
                    Ok(0) => {
                        debug!("Channel {} wrote zero bytes", self.core.id());
                        self.core.close();
                        return;
                    }
                    Ok(n) => {
                        let mut pending = self.core.pending.lock();
                        if n >= write.data.len() {
                            pending.pop_front();
                        } else if let Some(front) = pending.front_mut() {
                            front.data.advance(n);
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        debug!("Write on channel {} failed: {}", self.core.id(), e);
                        self.core.close();
                        return;
                    }
                },
                Source::Datagram(socket) => {
                    let Some(target) = write.target else {
                        self.core.pending.lock().pop_front();
                        continue;
                    };
                    match socket.send_to(&write.data, target) {
                        Ok(_) => {
                            self.core.pending.lock().pop_front();
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => {
                            debug!(
                                "Unable to send from {:?} to {}: {}; closing channel {}",
                                self.core.local(),
                                target,
                                e,
                                self.core.id()
                            );
                            self.core.close();
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Read until the socket would block, forwarding every chunk.
    fn read(&mut self, buffer: &mut [u8], own_addrs: &HashSet<SocketAddr>) {
        loop {
            if self.core.is_closed() {
                return;
            }

            match &mut self.source {
                Source::Tcp(stream) => match stream.read(buffer) {
                    Ok(0) => {
                        debug!("Channel {} reached end of stream", self.core.id());
                        self.core.close();
                        return;
                    }
                    Ok(n) => {
                        let from = self
                            .core
                            .remote()
                            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
                        self.core.emit(ChannelEvent::Read {
                            channel: self.core.id(),
                            data: Bytes::copy_from_slice(&buffer[..n]),
                            from,
                        });
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        debug!("Read on channel {} failed: {}", self.core.id(), e);
                        self.core.close();
                        return;
                    }
                },
                Source::Datagram(socket) => match socket.recv_from(buffer) {
                    Ok((n, from)) => {
                        if own_addrs.contains(&from) {
                            continue;
                        }
                        self.core.emit(ChannelEvent::Read {
                            channel: self.core.id(),
                            data: Bytes::copy_from_slice(&buffer[..n]),
                            from,
                        });
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        debug!("Receive on channel {} failed: {}", self.core.id(), e);
                        return;
                    }
                },
            }
        }
    }
}

struct PollThread {
    poll: Poll,
    commands: Receiver<Command>,
    registrations: HashMap<Token, Registration>,
    /// Local addresses of our own datagram sockets; datagrams from these are
    /// multicast loopback of our own sends.
    own_addrs: HashSet<SocketAddr>,
    sender_v4: Option<std::net::UdpSocket>,
    sender_v6: Option<std::net::UdpSocket>,
    read_buffer: Vec<u8>,
    event_capacity: usize,
    poll_timeout: Option<Duration>,
}

impl PollThread {
    fn new(poll: Poll, commands: Receiver<Command>, config: &ReactorConfig) -> Self {
        Self {
            poll,
            commands,
            registrations: HashMap::new(),
            own_addrs: HashSet::new(),
            sender_v4: None,
            sender_v6: None,
            read_buffer: vec![0; config.read_buffer_size],
            event_capacity: config.event_capacity,
            poll_timeout: config.poll_timeout,
        }
    }

    fn run(mut self) {
        let mut events = Events::with_capacity(self.event_capacity);
        debug!("Reactor thread started");

        loop {
            if !self.drain_commands() {
                break;
            }
            self.refresh_registrations();

            if let Err(e) = self.poll.poll(&mut events, self.poll_timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("Reactor poll failed: {}", e);
                break;
            }

            for event in events.iter() {
                let token = event.token();
                if token == WAKER_TOKEN {
                    continue;
                }
                self.handle_ready(
                    token,
                    event.is_readable() || event.is_read_closed(),
                    event.is_writable(),
                    event.is_error(),
                );
            }
        }

        self.shutdown();
    }

    /// Process queued commands. Returns false when the loop should stop.
    fn drain_commands(&mut self) -> bool {
        loop {
            match self.commands.try_recv() {
                Ok(Command::RegisterTcp { stream, core }) => {
                    self.register(Source::Tcp(stream), core);
                }
                Ok(Command::RegisterDatagram { socket, core }) => {
                    self.register(Source::Datagram(socket), core);
                }
                Ok(Command::SendDatagram { to, data }) => self.send_unicast(to, &data),
                Ok(Command::Shutdown) => return false,
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn register(&mut self, source: Source, core: Arc<ChannelCore>) {
        if core.is_closed() {
            return;
        }

        let token = Token(core.id().as_u64() as usize);
        let mut registration = Registration {
            source,
            core,
            interest: Interest::READABLE,
        };
        let interest = registration.wanted_interest();
        registration.interest = interest;

        if let Err(e) = self.poll.registry().register(
            registration.source.as_event_source(),
            token,
            interest,
        ) {
            warn!(
                "Failed to register channel {}: {}",
                registration.core.id(),
                e
            );
            registration.core.close();
            return;
        }

        if registration.core.kind() == ChannelKind::Datagram {
            if let Some(local) = registration.core.local() {
                self.own_addrs.insert(local);
            }
        }
        self.registrations.insert(token, registration);
    }

    /// Drop closed channels, flush queued writes and refresh interest sets.
    fn refresh_registrations(&mut self) {
        let closed: Vec<Token> = self
            .registrations
            .iter()
            .filter(|(_, registration)| registration.core.is_closed())
            .map(|(token, _)| *token)
            .collect();
        for token in closed {
            self.teardown(token);
        }

        let registry = self.poll.registry();
        for (token, registration) in self.registrations.iter_mut() {
            if registration.core.state() == ChannelState::Open && registration.core.has_pending() {
                registration.flush();
            }
            if registration.core.is_closed() {
                continue;
            }

            let wanted = registration.wanted_interest();
            if wanted != registration.interest {
                match registry.reregister(registration.source.as_event_source(), *token, wanted) {
                    Ok(()) => registration.interest = wanted,
                    Err(e) => {
                        warn!(
                            "Failed to update interest for channel {}: {}",
                            registration.core.id(),
                            e
                        );
                        registration.core.close();
                    }
                }
            }
        }
    }

    fn handle_ready(&mut self, token: Token, readable: bool, writable: bool, failed: bool) {
        let Some(registration) = self.registrations.get_mut(&token) else {
            return;
        };

        if registration.core.state() == ChannelState::Connecting {
            if readable || writable || failed {
                registration.finish_connect();
            }
            if registration.core.state() != ChannelState::Open {
                return;
            }
        }

        if writable && registration.core.has_pending() {
            registration.flush();
        }
        if readable {
            registration.read(&mut self.read_buffer, &self.own_addrs);
        }
    }

    fn teardown(&mut self, token: Token) {
        let Some(mut registration) = self.registrations.remove(&token) else {
            return;
        };
        if let Err(e) = self
            .poll
            .registry()
            .deregister(registration.source.as_event_source())
        {
            debug!(
                "Failed to deregister channel {}: {}",
                registration.core.id(),
                e
            );
        }
        if let Some(local) = registration.core.local() {
            self.own_addrs.remove(&local);
        }
        // Double close is harmless.
        registration.core.close();
    }

    fn send_unicast(&mut self, to: SocketAddr, data: &[u8]) {
        let slot = if to.is_ipv4() {
            &mut self.sender_v4
        } else {
            &mut self.sender_v6
        };

        if slot.is_none() {
            let bind_addr = if to.is_ipv4() {
                SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
            } else {
                SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
            };
            match std::net::UdpSocket::bind(bind_addr).and_then(|socket| {
                socket.set_nonblocking(true)?;
                Ok(socket)
            }) {
                Ok(socket) => *slot = Some(socket),
                Err(e) => {
                    warn!("Unable to open sender socket for {}: {}", to, e);
                    return;
                }
            }
        }

        if let Some(socket) = slot.as_ref() {
            if let Err(e) = socket.send_to(data, to) {
                debug!("Unable to send datagram to {}: {}", to, e);
            }
        }
    }

    fn shutdown(&mut self) {
        // Channels queued but never registered still need their terminal event.
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::RegisterTcp { core, .. } | Command::RegisterDatagram { core, .. } => {
                    core.close();
                }
                Command::SendDatagram { .. } | Command::Shutdown => {}
            }
        }

        let tokens: Vec<Token> = self.registrations.keys().copied().collect();
        for token in tokens {
            self.teardown(token);
        }
        debug!("Reactor thread stopped");
    }
}
