//! Request queue enforcing one outstanding command per device
//!
//! Most devices answer each command with a line of their own and get
//! confused when a second command arrives before the first is answered.
//! A [`CommandChannel`] holds every write in a FIFO and only transmits the
//! head once the previous head has been acknowledged.
//!
//! ```text
//!            write            acknowledge(true)
//!   Idle ------------> Awaiting ---------------> Idle (next head sent)
//!                         |
//!                         | acknowledge(false), Retry::After(d)
//!                         v
//!                   RetryPending ---- d elapses ----> Awaiting (resent)
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use ipremote_reactor::{Scheduler, TcpChannel, TimerHandle};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

/// Destination of transmitted commands
pub trait CommandWriter: Send + Sync {
    fn write_command(&self, data: Bytes) -> ipremote_reactor::Result<()>;
}

impl CommandWriter for TcpChannel {
    fn write_command(&self, data: Bytes) -> ipremote_reactor::Result<()> {
        self.write(data)
    }
}

/// What to do with a request whose response reports failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Retry {
    /// Drop it. Also dropped when the connection is reset.
    #[default]
    Never,
    /// Resend it after the delay. Survives connection resets.
    After(Duration),
}

#[derive(Clone)]
struct Request {
    data: Bytes,
    retry: Retry,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = String::from_utf8_lossy(&self.data);
        let text = text.trim_end_matches(['\r', '\n']);
        match self.retry {
            Retry::Never => write!(f, "{}", text),
            Retry::After(_) => write!(f, "{}*", text),
        }
    }
}

enum Slot {
    Idle,
    Awaiting,
    RetryPending(TimerHandle),
}

struct QueueState {
    writer: Option<Arc<dyn CommandWriter>>,
    queue: VecDeque<Request>,
    slot: Slot,
    default_retry: Retry,
    /// Bumped on every reset so stale retry timers do nothing
    epoch: u64,
}

struct ChannelInner {
    name: String,
    scheduler: Arc<dyn Scheduler>,
    state: Mutex<QueueState>,
}

/// FIFO of commands with at most one in flight.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct CommandChannel {
    inner: Arc<ChannelInner>,
}

impl CommandChannel {
    /// Create a queue with no writer. `scheduler` arms retry timers.
    pub fn new(name: impl Into<String>, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                name: name.into(),
                scheduler,
                state: Mutex::new(QueueState {
                    writer: None,
                    queue: VecDeque::new(),
                    slot: Slot::Idle,
                    default_retry: Retry::Never,
                    epoch: 0,
                }),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Queue `data` with the default retry policy.
    pub fn write(&self, data: impl Into<Bytes>) {
        let retry = self.inner.state.lock().default_retry;
        self.write_with_retry(data, retry);
    }

    pub fn write_with_retry(&self, data: impl Into<Bytes>, retry: Retry) {
        let mut state = self.inner.state.lock();
        let request = Request {
            data: data.into(),
            retry,
        };
        trace!("{}: queued {:?}", self.inner.name, request);
        state.queue.push_back(request);
        self.inner.transmit(&mut state);
    }

    /// Settle the in-flight request.
    ///
    /// Success, or failure of a [`Retry::Never`] request, removes it and
    /// sends the next one. A failed [`Retry::After`] request is resent after
    /// its delay and keeps the slot until then.
    pub fn acknowledge_response(&self, success: bool) {
        let mut state = self.inner.state.lock();
        if !matches!(state.slot, Slot::Awaiting) {
            debug!(
                "{}: acknowledgement with nothing outstanding ignored",
                self.inner.name
            );
            return;
        }

        if success {
            state.queue.pop_front();
            state.slot = Slot::Idle;
        } else {
            self.inner.fail_head(&mut state);
        }
        self.inner.transmit(&mut state);
    }

    /// Swap the underlying connection.
    ///
    /// Any pending retry is cancelled and [`Retry::Never`] requests are
    /// discarded. The rest stay queued in order and the head is sent as soon
    /// as a writer is attached. Attaching the current writer again does
    /// nothing.
    pub fn set_writer(&self, writer: Option<Arc<dyn CommandWriter>>) {
        let mut state = self.inner.state.lock();
        if same_writer(state.writer.as_ref(), writer.as_ref()) {
            return;
        }

        if let Slot::RetryPending(timer) = std::mem::replace(&mut state.slot, Slot::Idle) {
            timer.cancel();
        }
        state.epoch += 1;

        let before = state.queue.len();
        state.queue.retain(|request| request.retry != Retry::Never);
        let dropped = before - state.queue.len();
        if dropped > 0 {
            debug!(
                "{}: connection reset, dropped {} request(s)",
                self.inner.name, dropped
            );
        }

        state.writer = writer;
        self.inner.transmit(&mut state);
    }

    pub fn has_writer(&self) -> bool {
        self.inner.state.lock().writer.is_some()
    }

    /// The request currently in flight or waiting to be retried
    pub fn outstanding_request(&self) -> Option<Bytes> {
        let state = self.inner.state.lock();
        match state.slot {
            Slot::Idle => None,
            Slot::Awaiting | Slot::RetryPending(_) => {
                state.queue.front().map(|request| request.data.clone())
            }
        }
    }

    /// Drop every queued [`Retry::Never`] request that is not in flight.
    pub fn clear_pending(&self) {
        self.inner.clear_where(|_| true);
    }

    /// Drop queued [`Retry::Never`] requests equal to `data` that are not in
    /// flight.
    pub fn clear_pending_matching(&self, data: &[u8]) {
        self.inner.clear_where(|request| request.data.as_ref() == data);
    }

    /// Retry policy for [`write`](Self::write)
    pub fn set_default_retry(&self, retry: Retry) {
        self.inner.state.lock().default_retry = retry;
    }

    pub fn default_retry(&self) -> Retry {
        self.inner.state.lock().default_retry
    }

    /// Number of queued requests, including the one in flight
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ChannelInner {
    /// Send the head if nothing is in flight.
    fn transmit(self: &Arc<Self>, state: &mut QueueState) {
        loop {
            if !matches!(state.slot, Slot::Idle) {
                return;
            }
            let Some(writer) = state.writer.clone() else {
                return;
            };
            let Some(head) = state.queue.front() else {
                return;
            };

            let data = head.data.clone();
            trace!("{}: sending {:?}", self.name, head);
            state.slot = Slot::Awaiting;
            match writer.write_command(data) {
                Ok(()) => return,
                Err(e) => {
                    warn!("{}: write failed: {}", self.name, e);
                    self.fail_head(state);
                }
            }
        }
    }

    /// Failure path for the in-flight head. Leaves the slot Idle when the
    /// request is dropped, RetryPending when it will be resent.
    fn fail_head(self: &Arc<Self>, state: &mut QueueState) {
        let retry = state.queue.front().map(|request| request.retry);
        match retry {
            Some(Retry::After(delay)) => {
                debug!("{}: retrying {:?} in {:?}", self.name, state.queue.front(), delay);
                let weak: Weak<Self> = Arc::downgrade(self);
                let epoch = state.epoch;
                let timer = self.scheduler.schedule(
                    delay,
                    Box::new(move || {
                        if let Some(inner) = weak.upgrade() {
                            inner.retry(epoch);
                        }
                    }),
                );
                state.slot = Slot::RetryPending(timer);
            }
            Some(Retry::Never) => {
                let dropped = state.queue.pop_front();
                debug!("{}: dropping failed {:?}", self.name, dropped);
                state.slot = Slot::Idle;
            }
            None => state.slot = Slot::Idle,
        }
    }

    fn retry(self: &Arc<Self>, epoch: u64) {
        let mut state = self.state.lock();
        if state.epoch != epoch || !matches!(state.slot, Slot::RetryPending(_)) {
            return;
        }
        state.slot = Slot::Idle;
        self.transmit(&mut state);
    }

    fn clear_where(&self, matches: impl Fn(&Request) -> bool) {
        let mut state = self.state.lock();
        let in_flight = !matches!(state.slot, Slot::Idle);
        let mut index = 0;
        state.queue.retain(|request| {
            let keep = (index == 0 && in_flight)
                || request.retry != Retry::Never
                || !matches(request);
            index += 1;
            keep
        });
    }
}

fn same_writer(a: Option<&Arc<dyn CommandWriter>>, b: Option<&Arc<dyn CommandWriter>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const (),
        _ => false,
    }
}

impl fmt::Debug for CommandChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("CommandChannel")
            .field("name", &self.inner.name)
            .field("connected", &state.writer.is_some())
            .field("pending", &state.queue)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipremote_reactor::testing::ManualScheduler;
    use ipremote_reactor::ReactorError;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct RecordingWriter {
        sent: Mutex<Vec<Bytes>>,
        broken: AtomicBool,
    }

    impl RecordingWriter {
        fn sent(&self) -> Vec<String> {
            self.sent
                .lock()
                .iter()
                .map(|data| String::from_utf8_lossy(data).into_owned())
                .collect()
        }
    }

    impl CommandWriter for RecordingWriter {
        fn write_command(&self, data: Bytes) -> ipremote_reactor::Result<()> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(ReactorError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "broken",
                )));
            }
            self.sent.lock().push(data);
            Ok(())
        }
    }

    fn setup() -> (Arc<ManualScheduler>, CommandChannel, Arc<RecordingWriter>) {
        let scheduler = Arc::new(ManualScheduler::new());
        let channel = CommandChannel::new("test", scheduler.clone());
        let writer = Arc::new(RecordingWriter::default());
        channel.set_writer(Some(writer.clone()));
        (scheduler, channel, writer)
    }

    #[test]
    fn test_next_sent_after_success() {
        let (_scheduler, channel, writer) = setup();

        channel.write("A");
        channel.write("B");
        assert_eq!(writer.sent(), vec!["A"]);
        assert_eq!(channel.outstanding_request(), Some(Bytes::from("A")));

        channel.acknowledge_response(true);
        assert_eq!(writer.sent(), vec!["A", "B"]);
        assert_eq!(channel.outstanding_request(), Some(Bytes::from("B")));

        channel.acknowledge_response(true);
        assert_eq!(channel.outstanding_request(), None);
        assert!(channel.is_empty());
    }

    #[test]
    fn test_failed_never_is_dropped() {
        let (_scheduler, channel, writer) = setup();

        channel.write_with_retry("?P\r", Retry::Never);
        channel.write("?V\r");
        channel.acknowledge_response(false);

        assert_eq!(writer.sent(), vec!["?P\r", "?V\r"]);
        assert_eq!(channel.outstanding_request(), Some(Bytes::from("?V\r")));
    }

    #[test]
    fn test_failed_retry_resent_once_after_delay() {
        let (scheduler, channel, writer) = setup();

        channel.write_with_retry("PN\r", Retry::After(Duration::from_millis(5000)));
        channel.write("?P\r");
        channel.acknowledge_response(false);

        scheduler.advance(Duration::from_millis(4999));
        assert_eq!(writer.sent(), vec!["PN\r"]);
        assert_eq!(channel.outstanding_request(), Some(Bytes::from("PN\r")));

        scheduler.advance(Duration::from_millis(1));
        assert_eq!(writer.sent(), vec!["PN\r", "PN\r"]);

        scheduler.advance(Duration::from_secs(60));
        assert_eq!(writer.sent().len(), 2);

        channel.acknowledge_response(true);
        assert_eq!(writer.sent(), vec!["PN\r", "PN\r", "?P\r"]);
    }

    #[test]
    fn test_acknowledge_without_outstanding_is_noop() {
        let (_scheduler, channel, writer) = setup();

        channel.acknowledge_response(true);
        channel.acknowledge_response(false);
        channel.write("A");

        assert_eq!(writer.sent(), vec!["A"]);
    }

    #[test]
    fn test_reset_keeps_only_retryable_requests() {
        let (scheduler, channel, first) = setup();

        channel.write("?P\r");
        channel.write_with_retry("PN\r", Retry::After(Duration::from_secs(1)));
        channel.write("?V\r");
        channel.set_writer(None);

        assert_eq!(channel.len(), 1);
        assert_eq!(channel.outstanding_request(), None);

        let second = Arc::new(RecordingWriter::default());
        channel.set_writer(Some(second.clone()));
        assert_eq!(second.sent(), vec!["PN\r"]);
        assert_eq!(first.sent(), vec!["?P\r"]);

        scheduler.advance(Duration::from_secs(5));
        assert_eq!(second.sent().len(), 1);
    }

    #[test]
    fn test_reset_cancels_pending_retry() {
        let (scheduler, channel, writer) = setup();

        channel.write_with_retry("PN\r", Retry::After(Duration::from_secs(1)));
        channel.acknowledge_response(false);
        assert_eq!(scheduler.pending_timers(), 1);

        channel.set_writer(None);
        assert_eq!(scheduler.pending_timers(), 0);
        scheduler.advance(Duration::from_secs(2));
        assert_eq!(writer.sent(), vec!["PN\r"]);
    }

    #[test]
    fn test_same_writer_is_noop() {
        let (_scheduler, channel, writer) = setup();

        channel.write("A");
        channel.write("B");
        channel.set_writer(Some(writer.clone()));

        assert_eq!(channel.len(), 2);
        assert_eq!(writer.sent(), vec!["A"]);
    }

    #[test]
    fn test_write_error_runs_failure_path() {
        let (_scheduler, channel, writer) = setup();
        writer.broken.store(true, Ordering::SeqCst);

        channel.write("A");
        channel.write("B");

        assert!(channel.is_empty());
        assert_eq!(channel.outstanding_request(), None);
    }

    #[test]
    fn test_clear_pending_spares_in_flight_and_retryable() {
        let (_scheduler, channel, writer) = setup();

        channel.write("?P\r");
        channel.write("?V\r");
        channel.write_with_retry("PN\r", Retry::After(Duration::from_secs(1)));
        channel.write("?V\r");
        channel.write("?M\r");

        channel.clear_pending_matching(b"?V\r");
        assert_eq!(channel.len(), 3);

        channel.clear_pending();
        assert_eq!(channel.len(), 2);

        channel.acknowledge_response(true);
        assert_eq!(writer.sent(), vec!["?P\r", "PN\r"]);
    }

    #[test]
    fn test_default_retry_applies_to_write() {
        let (scheduler, channel, writer) = setup();
        channel.set_default_retry(Retry::After(Duration::from_millis(200)));
        assert_eq!(channel.default_retry(), Retry::After(Duration::from_millis(200)));

        channel.write("PN\r");
        channel.acknowledge_response(false);
        scheduler.advance(Duration::from_millis(200));

        assert_eq!(writer.sent(), vec!["PN\r", "PN\r"]);
    }

    #[test]
    fn test_queue_holds_until_writer_attached() {
        let scheduler = Arc::new(ManualScheduler::new());
        let channel = CommandChannel::new("test", scheduler);

        channel.write_with_retry("PN\r", Retry::After(Duration::from_secs(1)));
        assert_eq!(channel.outstanding_request(), None);
        assert!(!channel.has_writer());

        let writer = Arc::new(RecordingWriter::default());
        channel.set_writer(Some(writer.clone()));
        assert_eq!(writer.sent(), vec!["PN\r"]);
    }
}
