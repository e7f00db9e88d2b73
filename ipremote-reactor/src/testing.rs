//! Deterministic scheduler for tests
//!
//! `ManualScheduler` runs `execute` tasks inline and keeps timers on a
//! virtual clock that only moves when [`ManualScheduler::advance`] is called.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::scheduler::{run_logged, RepeatingTask, Scheduler, Task, TimerHandle};

enum TimerKind {
    Once(Task),
    Repeating { period: Duration, task: RepeatingTask },
}

struct ManualTimer {
    due: Duration,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    kind: TimerKind,
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    next_seq: u64,
    timers: Vec<ManualTimer>,
}

impl ManualState {
    fn push(&mut self, due: Duration, cancelled: Arc<AtomicBool>, kind: TimerKind) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.timers.push(ManualTimer {
            due,
            seq,
            cancelled,
            kind,
        });
    }

    fn pop_due(&mut self, until: Duration) -> Option<ManualTimer> {
        self.timers.retain(|t| !t.cancelled.load(Ordering::Acquire));
        let index = self
            .timers
            .iter()
            .enumerate()
            .filter(|(_, t)| t.due <= until)
            .min_by_key(|(_, t)| (t.due, t.seq))
            .map(|(i, _)| i)?;
        Some(self.timers.remove(index))
    }
}

/// Scheduler with a virtual clock.
#[derive(Default)]
pub struct ManualScheduler {
    state: Mutex<ManualState>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Virtual time elapsed since creation
    pub fn now(&self) -> Duration {
        self.state.lock().now
    }

    /// Number of armed, uncancelled timers
    pub fn pending_timers(&self) -> usize {
        self.state
            .lock()
            .timers
            .iter()
            .filter(|t| !t.cancelled.load(Ordering::Acquire))
            .count()
    }

    /// Move the clock forward by `by`, running every timer that falls due in
    /// order of deadline.
    pub fn advance(&self, by: Duration) {
        let target = self.state.lock().now + by;

        loop {
            let timer = {
                let mut state = self.state.lock();
                match state.pop_due(target) {
                    Some(timer) => {
                        if timer.due > state.now {
                            state.now = timer.due;
                        }
                        timer
                    }
                    None => {
                        state.now = target;
                        return;
                    }
                }
            };

            match timer.kind {
                TimerKind::Once(task) => run_logged(task),
                TimerKind::Repeating { period, task } => {
                    let tick = Arc::clone(&task);
                    run_logged(|| tick());
                    if !timer.cancelled.load(Ordering::Acquire) {
                        self.state.lock().push(
                            timer.due + period,
                            timer.cancelled,
                            TimerKind::Repeating { period, task },
                        );
                    }
                }
            }
        }
    }
}

impl Scheduler for ManualScheduler {
    fn execute(&self, task: Task) {
        run_logged(task);
    }

    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut state = self.state.lock();
        let due = state.now + delay;
        state.push(due, Arc::clone(&cancelled), TimerKind::Once(task));
        TimerHandle::new(cancelled, None)
    }

    fn schedule_repeating(
        &self,
        initial_delay: Duration,
        period: Duration,
        task: RepeatingTask,
    ) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let period = period.max(Duration::from_millis(1));
        let mut state = self.state.lock();
        let due = state.now + initial_delay;
        state.push(
            due,
            Arc::clone(&cancelled),
            TimerKind::Repeating { period, task },
        );
        TimerHandle::new(cancelled, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_timers_fire_in_deadline_order() {
        let scheduler = ManualScheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (name, delay) in [("late", 300), ("early", 100), ("middle", 200)] {
            let order = Arc::clone(&order);
            scheduler.schedule(
                Duration::from_millis(delay),
                Box::new(move || order.lock().push(name)),
            );
        }

        scheduler.advance(Duration::from_millis(150));
        assert_eq!(*order.lock(), vec!["early"]);

        scheduler.advance(Duration::from_millis(500));
        assert_eq!(*order.lock(), vec!["early", "middle", "late"]);
        assert_eq!(scheduler.now(), Duration::from_millis(650));
    }

    #[test]
    fn test_cancel_prevents_firing() {
        let scheduler = ManualScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);

        let timer = scheduler.schedule(
            Duration::from_secs(1),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(scheduler.pending_timers(), 1);

        timer.cancel();
        scheduler.advance(Duration::from_secs(5));

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.pending_timers(), 0);
    }

    #[test]
    fn test_repeating_rearms() {
        let scheduler = ManualScheduler::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);

        let timer = scheduler.schedule_repeating(
            Duration::ZERO,
            Duration::from_secs(10),
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        scheduler.advance(Duration::ZERO);
        assert_eq!(ticks.load(Ordering::SeqCst), 1);

        scheduler.advance(Duration::from_secs(25));
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        timer.cancel();
        scheduler.advance(Duration::from_secs(100));
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_task_may_schedule_more_work() {
        let scheduler = Arc::new(ManualScheduler::new());
        let fired = Arc::new(AtomicUsize::new(0));

        let inner_scheduler = Arc::clone(&scheduler);
        let counter = Arc::clone(&fired);
        scheduler.schedule(
            Duration::from_secs(1),
            Box::new(move || {
                let counter = Arc::clone(&counter);
                inner_scheduler.schedule(
                    Duration::from_secs(1),
                    Box::new(move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }),
                );
            }),
        );

        scheduler.advance(Duration::from_secs(3));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
