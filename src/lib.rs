//! Astro-Cam: a camera abstraction for astronomy capture software
//!
//! Two kinds of camera sit behind one [`CameraHandle`]: devices exposed as
//! V4L2 device files and USB sensors driven by direct register writes. A
//! handle owns a capture thread that delivers frames to a [`FrameConsumer`]
//! through a small pool of buffers, applying control changes between frames.

pub mod backend;
pub mod buffer;
pub mod camera;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod format;
pub mod session;
pub mod traits;
pub mod validation;

#[cfg(test)]
pub mod mock;

pub use buffer::{FrameLease, PoolStatus};
pub use camera::CameraHandle;
pub use config::{CaptureConfig, ConfigError};
pub use control::{ControlDescriptor, ControlId, ControlRegistry, ControlValue};
pub use engine::{CaptureStats, FrameConsumer, Handoff};
pub use error::{CameraError, Result};
pub use format::{
    ActualFormat, FormatRequest, FourCC, FrameRate, FrameSize, FrameTimeout, PixelFormat,
};
pub use session::CameraSession;
pub use traits::{
    Backend, DeviceAddress, DeviceDescriptor, Driver, Frame, FrameMetadata, InterfaceKind,
    ReadOutcome, SensorInfo,
};
