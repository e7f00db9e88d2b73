//! Ordering properties of the command queue under arbitrary interleavings

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use ipremote_device::{CommandChannel, CommandWriter, Retry};
use ipremote_reactor::testing::ManualScheduler;
use parking_lot::Mutex;
use proptest::prelude::*;

#[derive(Default)]
struct Wire {
    sent: Mutex<Vec<String>>,
}

impl CommandWriter for Wire {
    fn write_command(&self, data: Bytes) -> ipremote_reactor::Result<()> {
        self.sent
            .lock()
            .push(String::from_utf8_lossy(&data).into_owned());
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum Op {
    Write,
    Acknowledge(bool),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::Write),
        any::<bool>().prop_map(Op::Acknowledge),
    ]
}

proptest! {
    /// Commands go out in write order, each only after its predecessor was
    /// answered, and the outstanding request is always the oldest unanswered.
    #[test]
    fn one_in_flight_in_fifo_order(ops in prop::collection::vec(op(), 1..60)) {
        let channel = CommandChannel::new("prop", Arc::new(ManualScheduler::new()));
        let wire = Arc::new(Wire::default());
        channel.set_writer(Some(wire.clone()));

        let mut written: Vec<String> = Vec::new();
        let mut answered = 0usize;

        for op in ops {
            match op {
                Op::Write => {
                    let command = format!("C{}\r", written.len());
                    channel.write(command.clone().into_bytes());
                    written.push(command);
                }
                Op::Acknowledge(success) => {
                    if channel.outstanding_request().is_some() {
                        answered += 1;
                    }
                    channel.acknowledge_response(success);
                }
            }

            let sent = wire.sent.lock().clone();
            prop_assert_eq!(&sent[..], &written[..sent.len()]);
            prop_assert_eq!(sent.len(), written.len().min(answered + 1));
            prop_assert_eq!(
                channel.outstanding_request(),
                written.get(answered).map(|c| Bytes::from(c.clone()))
            );
            prop_assert_eq!(channel.len(), written.len() - answered);
        }
    }

    /// A command that keeps failing is resent after its delay and holds up
    /// everything behind it.
    #[test]
    fn retried_command_blocks_the_queue(failures in 1usize..6, queued in 1usize..5) {
        let scheduler = Arc::new(ManualScheduler::new());
        let channel = CommandChannel::new("prop", scheduler.clone());
        let wire = Arc::new(Wire::default());
        channel.set_writer(Some(wire.clone()));

        channel.write_with_retry(&b"PN\r"[..], Retry::After(Duration::from_millis(100)));
        for i in 0..queued {
            channel.write(format!("Q{}\r", i).into_bytes());
        }

        for attempt in 1..=failures {
            channel.acknowledge_response(false);
            prop_assert_eq!(wire.sent.lock().len(), attempt);
            scheduler.advance(Duration::from_millis(100));
            prop_assert_eq!(wire.sent.lock().len(), attempt + 1);
            prop_assert_eq!(channel.outstanding_request(), Some(Bytes::from_static(b"PN\r")));
        }

        channel.acknowledge_response(true);
        let sent = wire.sent.lock().clone();
        prop_assert!(sent[..=failures].iter().all(|c| c == "PN\r"));
        prop_assert_eq!(&sent[failures + 1], "Q0\r");
    }
}
