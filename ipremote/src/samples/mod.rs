//! Sample drivers showing the driver contract

pub mod receiver;

pub use receiver::Receiver;
