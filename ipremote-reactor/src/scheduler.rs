//! Shared worker pool for dispatched callbacks and timers
//!
//! Search timers, device expiry, command retries and busy polling all run
//! here, never on the reactor thread. Every task is wrapped so that a panic
//! is logged and the pool keeps running.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::AbortHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error};

use crate::config::ReactorConfig;
use crate::error::Result;

/// One-shot unit of work
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Unit of work run on every tick of a repeating timer
pub type RepeatingTask = Arc<dyn Fn() + Send + Sync + 'static>;

/// Executes work off the reactor thread and arms cancellable timers.
pub trait Scheduler: Send + Sync {
    /// Run `task` as soon as a worker is free.
    fn execute(&self, task: Task);

    /// Run `task` once after `delay`.
    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle;

    /// Run `task` after `initial_delay`, then every `period` until cancelled.
    fn schedule_repeating(
        &self,
        initial_delay: Duration,
        period: Duration,
        task: RepeatingTask,
    ) -> TimerHandle;
}

/// Handle to a scheduled task. Dropping it does not cancel the task.
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
    abort: Option<AbortHandle>,
}

impl TimerHandle {
    pub(crate) fn new(cancelled: Arc<AtomicBool>, abort: Option<AbortHandle>) -> Self {
        Self { cancelled, abort }
    }

    /// Cancel the task. A task already running is allowed to finish.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Run `task`, logging instead of propagating a panic.
pub fn run_logged<F: FnOnce()>(task: F) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
        error!("Scheduled task panicked: {}", panic_message(payload.as_ref()));
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// [`Scheduler`] backed by a multi-threaded tokio runtime.
///
/// Tasks are synchronous closures, so they run on the runtime's blocking
/// pool; the async workers only drive timers.
pub struct TokioScheduler {
    runtime: Option<Runtime>,
    handle: Handle,
}

impl TokioScheduler {
    /// Create a scheduler with `worker_threads` timer workers
    pub fn new(worker_threads: usize) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name("ipremote-worker")
            .enable_time()
            .build()?;
        let handle = runtime.handle().clone();

        Ok(Self {
            runtime: Some(runtime),
            handle,
        })
    }

    /// Create a scheduler sized from a [`ReactorConfig`]
    pub fn from_config(config: &ReactorConfig) -> Result<Self> {
        config.validate()?;
        Self::new(config.worker_threads)
    }
}

impl Scheduler for TokioScheduler {
    fn execute(&self, task: Task) {
        self.handle.spawn_blocking(move || run_logged(task));
    }

    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);

        let join = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if flag.load(Ordering::Acquire) {
                return;
            }
            let _ = tokio::task::spawn_blocking(move || {
                if !flag.load(Ordering::Acquire) {
                    run_logged(task);
                }
            })
            .await;
        });

        TimerHandle::new(cancelled, Some(join.abort_handle()))
    }

    fn schedule_repeating(
        &self,
        initial_delay: Duration,
        period: Duration,
        task: RepeatingTask,
    ) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let period = period.max(Duration::from_millis(1));

        let join = self.handle.spawn(async move {
            let mut ticker = interval_at(Instant::now() + initial_delay, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if flag.load(Ordering::Acquire) {
                    break;
                }
                let task = Arc::clone(&task);
                let _ = tokio::task::spawn_blocking(move || run_logged(|| task())).await;
            }
        });

        TimerHandle::new(cancelled, Some(join.abort_handle()))
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            debug!("Shutting down worker pool");
            runtime.shutdown_background();
        }
    }
}
