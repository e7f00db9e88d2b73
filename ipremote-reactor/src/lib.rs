//! Non-blocking I/O reactor for IP remote control channels
//!
//! One thread polls every TCP connection and UDP socket; callers only queue
//! work for it. Channel activity is reported as [`ChannelEvent`] values to a
//! [`ChannelCallback`]. Wrap the callback in [`AsyncDispatch`] to move the
//! work onto the [`Scheduler`] worker pool and keep the poll thread free.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use ipremote_reactor::{AsyncDispatch, ChannelEvent, ChannelManager, ReactorConfig, Scheduler, TokioScheduler};
//!
//! # fn main() -> ipremote_reactor::Result<()> {
//! let scheduler: Arc<dyn Scheduler> = Arc::new(TokioScheduler::new(2)?);
//! let reactor = ChannelManager::new(ReactorConfig::default(), Arc::clone(&scheduler))?;
//! reactor.open()?;
//!
//! let callback = AsyncDispatch::wrap(
//!     scheduler,
//!     Arc::new(|event: ChannelEvent| println!("{:?}", event)),
//! );
//! let channel = reactor.connect("192.168.1.20:8102".parse().unwrap(), Duration::from_secs(5), callback)?;
//! channel.write(&b"?P\r"[..])?;
//!
//! reactor.close();
//! # Ok(())
//! # }
//! ```

mod channel;
mod config;
mod dispatch;
mod error;
mod interface;
mod reactor;
mod scheduler;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use channel::{ChannelCallback, ChannelEvent, ChannelId, ChannelState, DatagramChannel, TcpChannel};
pub use config::ReactorConfig;
pub use dispatch::AsyncDispatch;
pub use error::{ReactorError, Result};
pub use interface::Interface;
pub use reactor::ChannelManager;
pub use scheduler::{run_logged, RepeatingTask, Scheduler, Task, TimerHandle, TokioScheduler};
