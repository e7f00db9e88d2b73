//! Command/response protocol layer for IP-controlled devices
//!
//! - [`CommandChannel`]: FIFO of commands with exactly one awaiting an answer
//! - [`CodedProperty`]: command names mapped to wire codes, plus the last
//!   reported status
//! - Aspects ([`Power`], [`Sound`], [`Selection`], [`Menu`]) composed by
//!   drivers
//! - [`Device`]: connects when discovery finds a device its
//!   [`DeviceDriver`] matches
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ipremote_device::{CodeTable, Power};
//!
//! let codes = CodeTable::new()
//!     .with("On", "PO\r,PN\r")
//!     .with("Off", "PF\r")
//!     .with("Query", "?P\r");
//! let power = Arc::new(Power::new("power", &codes)?);
//! power.property().add_listener(|name| println!("{} changed", name));
//! # Ok::<(), ipremote_device::DeviceError>(())
//! ```

mod aspects;
mod command_channel;
mod config;
mod device;
mod error;
mod property;

pub use aspects::{Menu, Power, QueryOnPower, Selection, Sound};
pub use command_channel::{CommandChannel, CommandWriter, Retry};
pub use config::DeviceConfig;
pub use device::{Device, DeviceDriver, PortSource, PropertyPoller, Response};
pub use error::{DeviceError, Result};
pub use property::{
    format_code, Attachable, CodeArg, CodeTable, CodedProperty, ListenerId, QUERY,
};
