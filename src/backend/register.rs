//! Register-level access to USB sensor bridges.
//!
//! The bridge exposes the sensor's 16-bit register file through vendor
//! control requests and streams frames over one bulk endpoint.

use std::time::Duration;

use rusb::{DeviceHandle, Direction, GlobalContext, Recipient, RequestType};

use crate::error::{CameraError, Result};

const REQUEST_WRITE_REGISTER: u8 = 0xa6;
const REQUEST_READ_REGISTER: u8 = 0xa7;
const REQUEST_WRITE_BATCH: u8 = 0xa8;
const REQUEST_START: u8 = 0xaf;
const REQUEST_STOP: u8 = 0xaa;

const FRAME_ENDPOINT: u8 = 0x82;
const CONTROL_TIMEOUT: Duration = Duration::from_millis(500);
// Largest batch one vendor request carries (4 bytes per write).
const BATCH_CHUNK: usize = 64;

/// Ordered register writes pushed to the sensor in one transfer.
///
/// A later write to the same address replaces the earlier one, keeping its
/// position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterBatch {
    writes: Vec<(u16, u16)>,
}

impl RegisterBatch {
    /// Empty batch.
    pub const fn new() -> Self {
        Self { writes: Vec::new() }
    }

    /// Queue a write.
    pub fn push(&mut self, address: u16, value: u16) {
        if let Some(entry) = self.writes.iter_mut().find(|(a, _)| *a == address) {
            entry.1 = value;
        } else {
            self.writes.push((address, value));
        }
    }

    /// Queued writes in order.
    pub fn iter(&self) -> impl Iterator<Item = (u16, u16)> + '_ {
        self.writes.iter().copied()
    }

    /// Number of queued writes.
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Move the queued writes out, leaving the batch empty.
    #[must_use]
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }
}

/// Transport to a sensor's register file and frame endpoint.
pub trait RegisterBus: Send {
    /// Read one 16-bit register.
    fn read_register(&mut self, address: u16) -> Result<u16>;

    /// Write one 16-bit register.
    fn write_register(&mut self, address: u16, value: u16) -> Result<()>;

    /// Write a batch of registers.
    fn write_batch(&mut self, batch: &RegisterBatch) -> Result<()> {
        for (address, value) in batch.iter() {
            self.write_register(address, value)?;
        }
        Ok(())
    }

    /// Tell the bridge to start pushing frames.
    fn start_stream(&mut self) -> Result<()>;

    /// Tell the bridge to stop pushing frames.
    fn stop_stream(&mut self) -> Result<()>;

    /// Fill `buf` with one frame. `None` waits forever.
    fn read_frame(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize>;

    /// Drop and re-establish the connection.
    fn reopen(&mut self) -> Result<()>;
}

/// Classify a USB error.
pub fn usb_error(err: rusb::Error) -> CameraError {
    match err {
        rusb::Error::Timeout => CameraError::Timeout,
        rusb::Error::NoDevice | rusb::Error::NotFound => CameraError::DeviceLost(err.to_string()),
        other => CameraError::TransientIo(other.to_string()),
    }
}

/// [`RegisterBus`] over a libusb device handle.
pub struct UsbRegisterBus {
    handle: DeviceHandle<GlobalContext>,
    bus: u8,
    address: u8,
}

impl UsbRegisterBus {
    /// Open the device at a bus position.
    pub fn open(bus: u8, address: u8) -> Result<Self> {
        let handle = open_handle(bus, address)?;
        Ok(Self {
            handle,
            bus,
            address,
        })
    }

    fn vendor_out(&self, request: u8, value: u16, index: u16, data: &[u8]) -> Result<()> {
        let request_type = rusb::request_type(Direction::Out, RequestType::Vendor, Recipient::Device);
        self.handle
            .write_control(request_type, request, value, index, data, CONTROL_TIMEOUT)
            .map_err(usb_error)?;
        Ok(())
    }
}

fn open_handle(bus: u8, address: u8) -> Result<DeviceHandle<GlobalContext>> {
    let open_failed = |reason: String| CameraError::OpenFailed {
        device: format!("usb {bus:03}:{address:03}"),
        reason,
    };
    let devices = rusb::devices().map_err(|err| open_failed(err.to_string()))?;
    let device = devices
        .iter()
        .find(|d| d.bus_number() == bus && d.address() == address)
        .ok_or_else(|| open_failed("device not present".to_owned()))?;
    let mut handle = device.open().map_err(|err| open_failed(err.to_string()))?;
    handle
        .claim_interface(0)
        .map_err(|err| open_failed(err.to_string()))?;
    Ok(handle)
}

impl RegisterBus for UsbRegisterBus {
    fn read_register(&mut self, address: u16) -> Result<u16> {
        let request_type = rusb::request_type(Direction::In, RequestType::Vendor, Recipient::Device);
        let mut data = [0u8; 2];
        let n = self
            .handle
            .read_control(
                request_type,
                REQUEST_READ_REGISTER,
                0,
                address,
                &mut data,
                CONTROL_TIMEOUT,
            )
            .map_err(usb_error)?;
        if n != data.len() {
            return Err(CameraError::TransientIo(format!(
                "short register read at {address:#06x}"
            )));
        }
        Ok(u16::from_be_bytes(data))
    }

    fn write_register(&mut self, address: u16, value: u16) -> Result<()> {
        self.vendor_out(REQUEST_WRITE_REGISTER, value, address, &[])
    }

    fn write_batch(&mut self, batch: &RegisterBatch) -> Result<()> {
        let payload: Vec<u8> = batch
            .iter()
            .flat_map(|(address, value)| {
                let [a0, a1] = address.to_be_bytes();
                let [v0, v1] = value.to_be_bytes();
                [a0, a1, v0, v1]
            })
            .collect();
        for chunk in payload.chunks(BATCH_CHUNK * 4) {
            self.vendor_out(REQUEST_WRITE_BATCH, 0, 0, chunk)?;
        }
        Ok(())
    }

    fn start_stream(&mut self) -> Result<()> {
        self.vendor_out(REQUEST_START, 0, 0, &[])
    }

    fn stop_stream(&mut self) -> Result<()> {
        self.vendor_out(REQUEST_STOP, 0, 0, &[])
    }

    fn read_frame(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        // libusb treats a zero timeout as "wait forever".
        let timeout = match timeout {
            None => Duration::ZERO,
            Some(d) if d.is_zero() => Duration::from_millis(1),
            Some(d) => d,
        };
        let mut filled = 0;
        while let Some(rest) = buf.get_mut(filled..).filter(|rest| !rest.is_empty()) {
            let n = self
                .handle
                .read_bulk(FRAME_ENDPOINT, rest, timeout)
                .map_err(usb_error)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    fn reopen(&mut self) -> Result<()> {
        log::debug!("reopening usb {:03}:{:03}", self.bus, self.address);
        if let Err(err) = self.handle.release_interface(0) {
            log::debug!("usb {:03}:{:03}: release interface: {err}", self.bus, self.address);
        }
        self.handle = open_handle(self.bus, self.address)?;
        Ok(())
    }
}
