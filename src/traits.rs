//! Backend contract shared by every hardware family.
//!
//! A [`Driver`] discovers devices of one family and opens them; the opened
//! [`Backend`] is the only thing that ever talks to the hardware. The camera
//! handle owns the backend while capture is stopped and lends it to the
//! capture thread while started, so a backend is never used from two threads
//! at once.

use std::fmt;
use std::time::Duration;

use crate::control::{ControlDescriptor, ControlId, ControlValue};
use crate::error::Result;
use crate::format::{
    ActualFormat, FormatRequest, FrameRate, FrameSize, FrameTimeout, PixelFormat,
};

/// Which backend family a device belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterfaceKind {
    /// OS video-capture device node driven through standard control calls.
    DeviceFile,
    /// USB sensor programmed directly through register writes.
    DirectRegister,
}

impl fmt::Display for InterfaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeviceFile => f.write_str("device-file"),
            Self::DirectRegister => f.write_str("direct-register"),
        }
    }
}

/// Backend-specific location of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceAddress {
    /// Device node index (`/dev/videoN`).
    Node(u32),
    /// USB bus position and product id.
    Usb {
        /// Bus number.
        bus: u8,
        /// Device address on the bus.
        address: u8,
        /// USB product id, used to look up the sensor model.
        product_id: u16,
    },
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node(index) => write!(f, "/dev/video{index}"),
            Self::Usb {
                bus,
                address,
                product_id,
            } => write!(f, "usb {bus:03}:{address:03} [{product_id:04x}]"),
        }
    }
}

/// One discovered camera. Produced by enumeration, never opens the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Backend family.
    pub kind: InterfaceKind,
    /// Human-readable name.
    pub name: String,
    /// Where to find it.
    pub address: DeviceAddress,
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {})", self.name, self.kind, self.address)
    }
}

/// Fixed facts about an open sensor.
#[derive(Debug, Clone, Default)]
pub struct SensorInfo {
    /// Model or card name.
    pub name: String,
    /// Whether the sensor delivers colour.
    pub colour: bool,
    /// Full sensor width at binning 1.
    pub max_width: u32,
    /// Full sensor height at binning 1.
    pub max_height: u32,
    /// Supported binning factors, always including 1.
    pub binning_factors: Vec<u32>,
    /// Pixel formats the device can deliver.
    pub pixel_formats: Vec<PixelFormat>,
    /// Whether the frame interval can be chosen.
    pub frame_rate_support: bool,
    /// Whether the ROI origin is programmed by the backend.
    pub programmable_roi: bool,
}

impl SensorInfo {
    /// Whether a binning factor is supported.
    pub fn has_binning(&self, factor: u32) -> bool {
        self.binning_factors.contains(&factor)
    }

    /// Whether a 16-bit format is available.
    pub fn has_16bit(&self) -> bool {
        self.pixel_formats.iter().any(|f| f.bit_depth() == 16)
    }

    /// Largest frame, in bytes, any supported format can produce.
    pub fn max_frame_bytes(&self) -> usize {
        let bpp = self
            .pixel_formats
            .iter()
            .map(|f| f.bytes_per_pixel())
            .max()
            .unwrap_or(1);
        self.max_width as usize * self.max_height as usize * bpp as usize
    }

    /// Format to use for a requested bit depth.
    ///
    /// 12-bit requests map to the 16-bit container the ADC output is packed in.
    pub fn pixel_format_for_bit_depth(&self, depth: u8) -> Option<PixelFormat> {
        let preferred: &[PixelFormat] = match depth {
            8 if self.colour => &[PixelFormat::Rgb24, PixelFormat::Bgr24, PixelFormat::Grey8],
            8 => &[PixelFormat::Grey8],
            12 | 16 => &[PixelFormat::Grey16Le, PixelFormat::Grey16Be],
            _ => &[],
        };
        preferred
            .iter()
            .copied()
            .find(|f| self.pixel_formats.contains(f))
    }
}

/// Metadata for a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameMetadata {
    /// Frame sequence number.
    pub sequence: u32,
    /// Capture timestamp.
    pub timestamp: Duration,
    /// Bytes of the buffer holding image data.
    pub bytes_used: usize,
}

/// Result of one `read_frame` call that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A frame was written into the caller's buffer.
    Frame(FrameMetadata),
    /// No frame within the deadline. Not an error.
    Timeout,
}

/// An owned copy of a frame, for consumers that keep frames around.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Raw frame data.
    pub data: Vec<u8>,
    /// Geometry the frame was captured with.
    pub format: ActualFormat,
    /// Frame metadata.
    pub metadata: FrameMetadata,
}

impl Frame {
    /// RGB value of the pixel at `(x, y)`.
    ///
    /// Grey formats are expanded to equal channels; 16-bit samples are reduced
    /// to their most significant byte. Returns `None` outside the frame.
    #[must_use]
    pub fn pixel_at(&self, x: u32, y: u32) -> Option<(u8, u8, u8)> {
        if x >= self.format.width || y >= self.format.height {
            return None;
        }
        let bpp = self.format.pixel_format.bytes_per_pixel() as usize;
        let offset = y as usize * self.format.stride as usize + x as usize * bpp;
        let px = self.data.get(offset..offset + bpp)?;

        match (self.format.pixel_format, px) {
            (PixelFormat::Grey8, [v]) => Some((*v, *v, *v)),
            (PixelFormat::Grey16Le, [_, hi]) | (PixelFormat::Grey16Be, [hi, _]) => {
                Some((*hi, *hi, *hi))
            }
            (PixelFormat::Rgb24, [r, g, b]) | (PixelFormat::Bgr24, [b, g, r]) => Some((*r, *g, *b)),
            _ => None,
        }
    }
}

/// A backend family: discovers devices and opens them.
pub trait Driver: Send {
    /// The family this driver serves.
    fn kind(&self) -> InterfaceKind;

    /// List devices of this family without opening any of them.
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>>;

    /// Open one of the devices returned by `enumerate`.
    fn open(&self, descriptor: &DeviceDescriptor) -> Result<Box<dyn Backend>>;
}

/// Abstraction over one open camera.
pub trait Backend: Send {
    /// Fixed facts about the sensor.
    fn info(&self) -> &SensorInfo;

    /// Discover which controls of the vocabulary the device offers. Controls
    /// the device lacks are absent from the result.
    fn query_controls(&mut self) -> Result<Vec<ControlDescriptor>>;

    /// Frame sizes available at the given binning factor, largest first.
    fn frame_sizes(&self, binning: u32) -> Vec<FrameSize>;

    /// Frame intervals available for a size. Empty if the device has no
    /// frame-rate control.
    fn frame_rates(&self, size: FrameSize) -> Vec<FrameRate>;

    /// Configure geometry and encoding. The result may differ from the request.
    fn negotiate_format(&mut self, request: &FormatRequest) -> Result<ActualFormat>;

    /// Apply (or queue) a control change.
    fn set_control(&mut self, id: ControlId, value: ControlValue) -> Result<()>;

    /// Read a control back.
    fn get_control(&mut self, id: ControlId) -> Result<ControlValue>;

    /// Push queued control changes to the hardware as one batch.
    fn commit_controls(&mut self) -> Result<()> {
        Ok(())
    }

    /// Begin streaming with the negotiated format.
    fn start(&mut self) -> Result<()>;

    /// Halt streaming and release stream buffers. Safe when not started.
    fn stop(&mut self);

    /// Read one frame into `buf`.
    fn read_frame(&mut self, buf: &mut [u8], timeout: FrameTimeout) -> Result<ReadOutcome>;

    /// Close and reopen the device connection, keeping configuration.
    fn reset(&mut self) -> Result<()>;

    /// Sensor temperature in degrees Celsius, if the device reports one.
    fn temperature(&mut self) -> Option<f32> {
        None
    }
}
