//! Backend implementations.
//!
//! - [`v4l2`]: cameras exposed as `/dev/video*` device files.
//! - [`asi`]: USB astronomy cameras programmed register by register over
//!   the [`register`] transport.

pub mod asi;
pub mod register;
pub mod v4l2;

pub use asi::{AsiBackend, AsiDriver};
pub use register::{RegisterBatch, RegisterBus, UsbRegisterBus};
pub use v4l2::{V4l2Backend, V4l2Driver};
