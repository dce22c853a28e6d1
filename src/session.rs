//! Discovery across every backend family.

use crate::backend::asi::AsiDriver;
use crate::backend::v4l2::V4l2Driver;
use crate::camera::CameraHandle;
use crate::config::CaptureConfig;
use crate::error::{CameraError, Result};
use crate::traits::{DeviceDescriptor, Driver};

/// Registered drivers plus the configuration handed to opened cameras.
pub struct CameraSession {
    drivers: Vec<Box<dyn Driver>>,
    config: CaptureConfig,
}

impl CameraSession {
    /// Session over the built-in device-file and direct-register drivers.
    pub fn new(config: CaptureConfig) -> Self {
        let drivers: Vec<Box<dyn Driver>> = vec![
            Box::new(V4l2Driver::new(config.stream_buffers)),
            Box::new(AsiDriver),
        ];
        Self::with_drivers(drivers, config)
    }

    /// Session over an explicit driver list.
    pub fn with_drivers(drivers: Vec<Box<dyn Driver>>, config: CaptureConfig) -> Self {
        Self { drivers, config }
    }

    /// Configuration handed to opened cameras.
    pub const fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// List attached cameras without opening them. A driver that fails to
    /// scan is skipped.
    pub fn enumerate(&self) -> Vec<DeviceDescriptor> {
        let mut found = Vec::new();
        for driver in &self.drivers {
            match driver.enumerate() {
                Ok(devices) => {
                    log::debug!("{} driver found {} device(s)", driver.kind(), devices.len());
                    found.extend(devices);
                }
                Err(err) => log::warn!("{} enumeration failed: {err}", driver.kind()),
            }
            if found.len() >= self.config.max_devices {
                found.truncate(self.config.max_devices);
                break;
            }
        }
        found
    }

    /// Open a camera returned by [`enumerate`](Self::enumerate).
    pub fn open(&self, descriptor: &DeviceDescriptor) -> Result<CameraHandle> {
        let driver = self
            .drivers
            .iter()
            .find(|driver| driver.kind() == descriptor.kind)
            .ok_or_else(|| CameraError::OpenFailed {
                device: descriptor.to_string(),
                reason: format!("no {} driver registered", descriptor.kind),
            })?;
        let backend = driver.open(descriptor)?;
        CameraHandle::open(descriptor.clone(), backend, self.config.clone())
    }
}
