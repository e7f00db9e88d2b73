//! Channel instances shared between the reactor thread and callers
//!
//! A channel's socket is owned by the reactor thread. Everything else (the
//! lifecycle state, the pending-write queue and the callback) lives in a
//! shared [`ChannelCore`] so any thread can queue writes or close the
//! channel while only the reactor performs I/O.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use bytes::Bytes;
use mio::Waker;
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::{ReactorError, Result};
use crate::scheduler::{panic_message, TimerHandle};

/// Identifier assigned to every channel by its reactor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub(crate) u64);

impl ChannelId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a channel. `Closed` is terminal and entered exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// TCP connect still in flight
    Connecting,
    /// Connected stream or bound datagram socket
    Open,
    Closed,
}

/// Event delivered to a [`ChannelCallback`]
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// TCP connect completed
    Opened {
        channel: ChannelId,
        remote: SocketAddr,
    },

    /// Bytes from one read, or one datagram
    Read {
        channel: ChannelId,
        data: Bytes,
        from: SocketAddr,
    },

    /// An open channel closed
    Closed { channel: ChannelId },

    /// A TCP channel closed before its connect completed
    Failed { channel: ChannelId },
}

impl ChannelEvent {
    pub fn channel(&self) -> ChannelId {
        match self {
            ChannelEvent::Opened { channel, .. }
            | ChannelEvent::Read { channel, .. }
            | ChannelEvent::Closed { channel }
            | ChannelEvent::Failed { channel } => *channel,
        }
    }

    /// True for the terminal `Closed` and `Failed` events
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChannelEvent::Closed { .. } | ChannelEvent::Failed { .. }
        )
    }
}

/// Receiver of channel events.
///
/// Called on the reactor thread unless wrapped in
/// [`AsyncDispatch`](crate::AsyncDispatch).
pub trait ChannelCallback: Send + Sync + 'static {
    fn on_event(&self, event: ChannelEvent);
}

impl<F> ChannelCallback for F
where
    F: Fn(ChannelEvent) + Send + Sync + 'static,
{
    fn on_event(&self, event: ChannelEvent) {
        self(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChannelKind {
    Tcp,
    Datagram,
}

/// Queued outbound buffer. Datagram writes carry their destination.
#[derive(Debug, Clone)]
pub(crate) struct PendingWrite {
    pub(crate) data: Bytes,
    pub(crate) target: Option<SocketAddr>,
}

pub(crate) struct ChannelCore {
    id: ChannelId,
    kind: ChannelKind,
    remote: Option<SocketAddr>,
    local: Option<SocketAddr>,
    state: Mutex<ChannelState>,
    pub(crate) pending: Mutex<VecDeque<PendingWrite>>,
    callback: Arc<dyn ChannelCallback>,
    waker: Arc<Waker>,
    connect_timer: Mutex<Option<TimerHandle>>,
}

impl ChannelCore {
    pub(crate) fn tcp(
        id: ChannelId,
        remote: SocketAddr,
        callback: Arc<dyn ChannelCallback>,
        waker: Arc<Waker>,
    ) -> Self {
        Self::new(
            id,
            ChannelKind::Tcp,
            ChannelState::Connecting,
            Some(remote),
            None,
            callback,
            waker,
        )
    }

    pub(crate) fn datagram(
        id: ChannelId,
        local: SocketAddr,
        callback: Arc<dyn ChannelCallback>,
        waker: Arc<Waker>,
    ) -> Self {
        Self::new(
            id,
            ChannelKind::Datagram,
            ChannelState::Open,
            None,
            Some(local),
            callback,
            waker,
        )
    }

    fn new(
        id: ChannelId,
        kind: ChannelKind,
        state: ChannelState,
        remote: Option<SocketAddr>,
        local: Option<SocketAddr>,
        callback: Arc<dyn ChannelCallback>,
        waker: Arc<Waker>,
    ) -> Self {
        Self {
            id,
            kind,
            remote,
            local,
            state: Mutex::new(state),
            pending: Mutex::new(VecDeque::new()),
            callback,
            waker,
            connect_timer: Mutex::new(None),
        }
    }

    pub(crate) fn id(&self) -> ChannelId {
        self.id
    }

    pub(crate) fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub(crate) fn remote(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub(crate) fn local(&self) -> Option<SocketAddr> {
        self.local
    }

    pub(crate) fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state() == ChannelState::Closed
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.pending.lock().is_empty()
    }

    pub(crate) fn set_connect_timer(&self, timer: TimerHandle) {
        if self.is_closed() {
            timer.cancel();
            return;
        }
        *self.connect_timer.lock() = Some(timer);
    }

    /// Connecting -> Open. Returns false if the channel was closed meanwhile.
    pub(crate) fn mark_open(&self) -> bool {
        {
            let mut state = self.state.lock();
            if *state != ChannelState::Connecting {
                return false;
            }
            *state = ChannelState::Open;
        }
        if let Some(timer) = self.connect_timer.lock().take() {
            timer.cancel();
        }
        true
    }

    /// Queue `write` and wake the reactor to flush it.
    pub(crate) fn enqueue(&self, write: PendingWrite) -> Result<()> {
        // Checked under the queue lock so a concurrent close cannot strand the write.
        let mut pending = self.pending.lock();
        if self.is_closed() {
            return Err(ReactorError::ChannelClosed(self.id));
        }
        pending.push_back(write);
        drop(pending);
        self.wake();
        Ok(())
    }

    /// Close the channel, delivering the terminal event exactly once.
    pub(crate) fn close(&self) -> bool {
        let previous = {
            let mut pending = self.pending.lock();
            let mut state = self.state.lock();
            let previous = *state;
            *state = ChannelState::Closed;
            pending.clear();
            previous
        };

        if previous == ChannelState::Closed {
            return false;
        }

        if let Some(timer) = self.connect_timer.lock().take() {
            timer.cancel();
        }

        debug!("Channel {} closed (was {:?})", self.id, previous);
        let event = match previous {
            ChannelState::Connecting => ChannelEvent::Failed { channel: self.id },
            _ => ChannelEvent::Closed { channel: self.id },
        };
        self.emit(event);
        self.wake();
        true
    }

    /// Deliver `event` to the callback, containing any panic.
    pub(crate) fn emit(&self, event: ChannelEvent) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| self.callback.on_event(event))) {
            error!(
                "Callback for channel {} panicked: {}",
                self.id,
                panic_message(payload.as_ref())
            );
        }
    }

    fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            debug!("Failed to wake reactor for channel {}: {}", self.id, e);
        }
    }
}

/// Handle to a TCP connection managed by the reactor.
#[derive(Clone)]
pub struct TcpChannel {
    core: Arc<ChannelCore>,
}

impl TcpChannel {
    pub(crate) fn new(core: Arc<ChannelCore>) -> Self {
        Self { core }
    }

    pub fn id(&self) -> ChannelId {
        self.core.id()
    }

    /// Address passed to `connect`
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.core.remote()
    }

    pub fn state(&self) -> ChannelState {
        self.core.state()
    }

    /// True once the connect has completed and until the channel closes
    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// Queue `data` for sending. Allowed while the connect is in flight.
    pub fn write(&self, data: impl Into<Bytes>) -> Result<()> {
        self.core.enqueue(PendingWrite {
            data: data.into(),
            target: None,
        })
    }

    /// Close the connection. Emits `Failed` if the connect never completed,
    /// `Closed` otherwise. Later calls do nothing.
    pub fn close(&self) {
        self.core.close();
    }
}

impl PartialEq for TcpChannel {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

impl Eq for TcpChannel {}

impl fmt::Debug for TcpChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpChannel")
            .field("id", &self.core.id())
            .field("remote", &self.core.remote())
            .field("state", &self.core.state())
            .finish()
    }
}

/// Handle to a bound UDP socket (unicast or multicast) managed by the reactor.
#[derive(Clone)]
pub struct DatagramChannel {
    core: Arc<ChannelCore>,
}

impl DatagramChannel {
    pub(crate) fn new(core: Arc<ChannelCore>) -> Self {
        Self { core }
    }

    pub fn id(&self) -> ChannelId {
        self.core.id()
    }

    /// Address the socket is bound to
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.core.local()
    }

    pub fn is_open(&self) -> bool {
        !self.core.is_closed()
    }

    /// Queue one datagram to `to`, sent from this socket.
    pub fn send(&self, data: impl Into<Bytes>, to: SocketAddr) -> Result<()> {
        self.core.enqueue(PendingWrite {
            data: data.into(),
            target: Some(to),
        })
    }

    pub fn close(&self) {
        self.core.close();
    }
}

impl fmt::Debug for DatagramChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatagramChannel")
            .field("id", &self.core.id())
            .field("local", &self.core.local())
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::{Poll, Token};

    fn core_with_events(
        state: ChannelState,
    ) -> (Arc<ChannelCore>, Arc<Mutex<Vec<ChannelEvent>>>, Poll) {
        let poll = Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), Token(0)).unwrap());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let callback: Arc<dyn ChannelCallback> =
            Arc::new(move |event: ChannelEvent| sink.lock().push(event));

        let core = match state {
            ChannelState::Connecting => ChannelCore::tcp(
                ChannelId(7),
                "127.0.0.1:8102".parse().unwrap(),
                callback,
                waker,
            ),
            _ => ChannelCore::datagram(
                ChannelId(7),
                "127.0.0.1:8008".parse().unwrap(),
                callback,
                waker,
            ),
        };
        (Arc::new(core), events, poll)
    }

    #[test]
    fn test_close_before_connect_reports_failure_once() {
        let (core, events, _poll) = core_with_events(ChannelState::Connecting);

        assert!(core.close());
        assert!(!core.close());

        let events = events.lock();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ChannelEvent::Failed { .. }));
    }

    #[test]
    fn test_close_after_open_reports_close() {
        let (core, events, _poll) = core_with_events(ChannelState::Connecting);

        assert!(core.mark_open());
        core.close();

        let events = events.lock();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ChannelEvent::Closed { .. }));
    }

    #[test]
    fn test_mark_open_after_close_is_refused() {
        let (core, _events, _poll) = core_with_events(ChannelState::Connecting);
        core.close();
        assert!(!core.mark_open());
        assert_eq!(core.state(), ChannelState::Closed);
    }

    #[test]
    fn test_writes_queue_until_closed() {
        let (core, _events, _poll) = core_with_events(ChannelState::Connecting);
        let channel = TcpChannel::new(Arc::clone(&core));

        channel.write(&b"PWR?\r"[..]).unwrap();
        channel.write(&b"VOL?\r"[..]).unwrap();
        assert_eq!(core.pending.lock().len(), 2);

        channel.close();
        assert!(!core.has_pending());
        assert!(matches!(
            channel.write(&b"MUT?\r"[..]),
            Err(ReactorError::ChannelClosed(_))
        ));
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let poll = Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), Token(0)).unwrap());
        let callback: Arc<dyn ChannelCallback> =
            Arc::new(|_event: ChannelEvent| panic!("handler bug"));
        let core = ChannelCore::datagram(
            ChannelId(1),
            "127.0.0.1:8008".parse().unwrap(),
            callback,
            waker,
        );

        assert!(core.close());
        assert!(core.is_closed());
    }

    #[test]
    fn test_event_accessors() {
        let event = ChannelEvent::Read {
            channel: ChannelId(3),
            data: Bytes::from_static(b"PWR0"),
            from: "10.0.0.2:8102".parse().unwrap(),
        };
        assert_eq!(event.channel(), ChannelId(3));
        assert!(!event.is_terminal());
        assert!(ChannelEvent::Failed {
            channel: ChannelId(3)
        }
        .is_terminal());
        assert_eq!(ChannelId(3).to_string(), "#3");
    }
}
