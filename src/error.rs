//! Error taxonomy shared by every backend and the capture engine.

use crate::control::ControlId;

/// Error type for camera operations.
///
/// `Timeout` is part of the taxonomy but is not a failure during
/// streaming: the capture engine treats it as "no frame yet".
#[derive(Debug, Clone, thiserror::Error)]
pub enum CameraError {
    /// Device missing or permission denied. Fatal to this open attempt only.
    #[error("failed to open {device}: {reason}")]
    OpenFailed {
        /// Human-readable device name or path.
        device: String,
        /// Underlying cause.
        reason: String,
    },
    /// Requested geometry, bit depth or frame interval is impossible.
    #[error("format rejected: {0}")]
    FormatRejected(String),
    /// No frame arrived within the deadline.
    #[error("timed out waiting for a frame")]
    Timeout,
    /// A single frame (or control write) failed; the stream is still usable.
    #[error("transient I/O error: {0}")]
    TransientIo(String),
    /// The backend connection is gone; the handle must be reopened.
    #[error("device lost: {0}")]
    DeviceLost(String),
    /// The control is not offered by this camera.
    #[error("control {0} is not offered by this camera")]
    UnsupportedControl(ControlId),
    /// The control exists but cannot be used this way.
    #[error("control {id}: {reason}")]
    InvalidControl {
        /// Control that was addressed.
        id: ControlId,
        /// Why the request was refused.
        reason: String,
    },
    /// `start` was called before a frame consumer was registered.
    #[error("no frame consumer registered")]
    NoConsumer,
    /// The backend is not reachable from the caller right now.
    #[error("backend not available: {0}")]
    NotAvailable(&'static str),
    /// The capture thread could not be spawned or panicked.
    #[error("capture thread failure: {0}")]
    CaptureThread(String),
}

impl CameraError {
    /// Whether the error ends the stream for good.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::DeviceLost(_) | Self::CaptureThread(_))
    }

    /// Classify an I/O error raised while talking to a device node.
    pub fn from_io(err: &std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::TimedOut {
            return Self::Timeout;
        }
        match err.raw_os_error() {
            Some(libc::ENODEV | libc::ENXIO | libc::ESHUTDOWN) => Self::DeviceLost(err.to_string()),
            _ => Self::TransientIo(err.to_string()),
        }
    }
}

/// Result type for camera operations.
pub type Result<T> = std::result::Result<T, CameraError>;
