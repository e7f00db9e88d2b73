//! Moves channel events off the reactor thread
//!
//! ```text
//! reactor thread            worker pool
//! --------------            -----------
//! on_event(e1) --push--+
//! on_event(e2) --push--+--> [ e1, e2, ... ] --drain--> target.on_event(..)
//! ```
//!
//! At most one drain task runs per dispatch, so events from one channel reach
//! the target in the order the reactor produced them.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::error;

use crate::channel::{ChannelCallback, ChannelEvent};
use crate::scheduler::{panic_message, Scheduler};

#[derive(Default)]
struct DispatchQueue {
    events: VecDeque<ChannelEvent>,
    draining: bool,
}

struct DispatchInner {
    target: Arc<dyn ChannelCallback>,
    scheduler: Arc<dyn Scheduler>,
    queue: Mutex<DispatchQueue>,
}

impl DispatchInner {
    fn drain(&self) {
        loop {
            let event = {
                let mut queue = self.queue.lock();
                match queue.events.pop_front() {
                    Some(event) => event,
                    None => {
                        queue.draining = false;
                        return;
                    }
                }
            };

            let channel = event.channel();
            if let Err(payload) =
                catch_unwind(AssertUnwindSafe(|| self.target.on_event(event)))
            {
                error!(
                    "Dispatched callback for channel {} panicked: {}",
                    channel,
                    panic_message(payload.as_ref())
                );
            }
        }
    }
}

/// [`ChannelCallback`] that queues each event and hands it to `target` on
/// the worker pool.
#[derive(Clone)]
pub struct AsyncDispatch {
    inner: Arc<DispatchInner>,
}

impl AsyncDispatch {
    pub fn new(scheduler: Arc<dyn Scheduler>, target: Arc<dyn ChannelCallback>) -> Self {
        Self {
            inner: Arc::new(DispatchInner {
                target,
                scheduler,
                queue: Mutex::new(DispatchQueue::default()),
            }),
        }
    }

    /// Wrap `target`, ready to pass to the reactor
    pub fn wrap(
        scheduler: Arc<dyn Scheduler>,
        target: Arc<dyn ChannelCallback>,
    ) -> Arc<dyn ChannelCallback> {
        Arc::new(Self::new(scheduler, target))
    }
}

impl ChannelCallback for AsyncDispatch {
    fn on_event(&self, event: ChannelEvent) {
        let start_drain = {
            let mut queue = self.inner.queue.lock();
            queue.events.push_back(event);
            !std::mem::replace(&mut queue.draining, true)
        };

        if start_drain {
            let inner = Arc::clone(&self.inner);
            self.inner.scheduler.execute(Box::new(move || inner.drain()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelId;
    use crate::scheduler::TokioScheduler;
    use crate::testing::ManualScheduler;
    use bytes::Bytes;
    use crossbeam::channel;
    use std::time::Duration;

    fn read_event(n: u8) -> ChannelEvent {
        ChannelEvent::Read {
            channel: ChannelId(1),
            data: Bytes::from(vec![n]),
            from: "127.0.0.1:9000".parse().unwrap(),
        }
    }

    #[test]
    fn test_events_arrive_in_order_on_worker() {
        let scheduler: Arc<dyn Scheduler> = Arc::new(TokioScheduler::new(2).unwrap());
        let (tx, rx) = channel::unbounded();
        let caller = std::thread::current().id();

        let target: Arc<dyn ChannelCallback> = Arc::new(move |event: ChannelEvent| {
            if let ChannelEvent::Read { data, .. } = event {
                tx.send((data[0], std::thread::current().id())).unwrap();
            }
        });
        let dispatch = AsyncDispatch::new(scheduler, target);

        for n in 0..50 {
            dispatch.on_event(read_event(n));
        }

        for expected in 0..50 {
            let (n, thread) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
            assert_eq!(n, expected);
            assert_ne!(thread, caller);
        }
    }

    #[test]
    fn test_panic_in_target_is_logged_and_dispatch_continues() {
        let scheduler: Arc<dyn Scheduler> = Arc::new(ManualScheduler::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let target: Arc<dyn ChannelCallback> = Arc::new(move |event: ChannelEvent| {
            if let ChannelEvent::Read { data, .. } = &event {
                if data[0] == 1 {
                    panic!("bad line");
                }
                sink.lock().push(data[0]);
            }
        });
        let dispatch = AsyncDispatch::wrap(scheduler, target);

        dispatch.on_event(read_event(0));
        dispatch.on_event(read_event(1));
        dispatch.on_event(read_event(2));

        assert_eq!(*seen.lock(), vec![0, 2]);
    }
}
