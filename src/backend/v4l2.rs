//! Device-file backend using the v4l crate.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use v4l::buffer::Type;
use v4l::control::{self, Control};
use v4l::frameinterval::FrameIntervalEnum;
use v4l::framesize::FrameSizeEnum;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream as _;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, Fraction};

use crate::control::{ControlDescriptor, ControlId, ControlValue};
use crate::error::{CameraError, Result};
use crate::format::{
    ActualFormat, FourCC, FormatRequest, FrameRate, FrameSize, FrameTimeout, PixelFormat,
};
use crate::traits::{
    Backend, DeviceAddress, DeviceDescriptor, Driver, FrameMetadata, InterfaceKind, ReadOutcome,
    SensorInfo,
};

/// Standard control ids from `videodev2.h`.
mod cid {
    const BASE: u32 = 0x0098_0900;
    const CAMERA_CLASS_BASE: u32 = 0x009a_0900;

    pub const BRIGHTNESS: u32 = BASE;
    pub const AUTO_WHITE_BALANCE: u32 = BASE + 12;
    pub const RED_BALANCE: u32 = BASE + 14;
    pub const BLUE_BALANCE: u32 = BASE + 15;
    pub const GAMMA: u32 = BASE + 16;
    pub const EXPOSURE: u32 = BASE + 17;
    pub const AUTOGAIN: u32 = BASE + 18;
    pub const GAIN: u32 = BASE + 19;
    pub const HFLIP: u32 = BASE + 20;
    pub const VFLIP: u32 = BASE + 21;
    pub const AUTOBRIGHTNESS: u32 = BASE + 32;
    pub const EXPOSURE_AUTO: u32 = CAMERA_CLASS_BASE + 1;
    pub const EXPOSURE_ABSOLUTE: u32 = CAMERA_CLASS_BASE + 2;
}

// EXPOSURE_AUTO menu entries.
const EXPOSURE_MANUAL: i64 = 1;
const EXPOSURE_APERTURE_PRIORITY: i64 = 3;
// EXPOSURE_ABSOLUTE counts in 100 µs units.
const EXPOSURE_ABSOLUTE_SCALE: i64 = 100;

/// How a control switches between manual and automatic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AutoSwitch {
    /// Boolean companion control (AUTOGAIN, AUTO_WHITE_BALANCE, ...).
    Flag(u32),
    /// The EXPOSURE_AUTO menu.
    ExposureMenu,
}

/// Candidate driver controls for each vocabulary entry, in preference order.
const CANDIDATES: &[(ControlId, u32, Option<AutoSwitch>, i64)] = &[
    (ControlId::Gain, cid::GAIN, Some(AutoSwitch::Flag(cid::AUTOGAIN)), 1),
    (
        ControlId::Exposure,
        cid::EXPOSURE_ABSOLUTE,
        Some(AutoSwitch::ExposureMenu),
        EXPOSURE_ABSOLUTE_SCALE,
    ),
    (ControlId::Exposure, cid::EXPOSURE, None, 1),
    (ControlId::Gamma, cid::GAMMA, None, 1),
    (
        ControlId::RedBalance,
        cid::RED_BALANCE,
        Some(AutoSwitch::Flag(cid::AUTO_WHITE_BALANCE)),
        1,
    ),
    (
        ControlId::BlueBalance,
        cid::BLUE_BALANCE,
        Some(AutoSwitch::Flag(cid::AUTO_WHITE_BALANCE)),
        1,
    ),
    (
        ControlId::Brightness,
        cid::BRIGHTNESS,
        Some(AutoSwitch::Flag(cid::AUTOBRIGHTNESS)),
        1,
    ),
    (ControlId::FlipHorizontal, cid::HFLIP, None, 1),
    (ControlId::FlipVertical, cid::VFLIP, None, 1),
];

/// A vocabulary control bound to the driver control that implements it.
#[derive(Debug, Clone, Copy)]
struct Binding {
    cid: u32,
    boolean: bool,
    auto: Option<AutoSwitch>,
    scale: i64,
}

fn io_error(err: &std::io::Error) -> CameraError {
    CameraError::from_io(err)
}

/// Discovers `/dev/video*` nodes.
#[derive(Debug, Clone, Copy)]
pub struct V4l2Driver {
    stream_buffers: u32,
}

impl V4l2Driver {
    /// Driver whose streams use `stream_buffers` mmap buffers.
    pub const fn new(stream_buffers: u32) -> Self {
        Self { stream_buffers }
    }
}

impl Default for V4l2Driver {
    fn default() -> Self {
        Self::new(4)
    }
}

impl Driver for V4l2Driver {
    fn kind(&self) -> InterfaceKind {
        InterfaceKind::DeviceFile
    }

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        // Names come from sysfs, so no node is opened here.
        let mut nodes = v4l::context::enum_devices();
        nodes.sort_by_key(v4l::context::Node::index);
        Ok(nodes
            .into_iter()
            .filter_map(|node| {
                let index = u32::try_from(node.index()).ok()?;
                Some(DeviceDescriptor {
                    kind: InterfaceKind::DeviceFile,
                    name: node
                        .name()
                        .map_or_else(|| format!("video{index}"), |n| n.trim().to_owned()),
                    address: DeviceAddress::Node(index),
                })
            })
            .collect())
    }

    fn open(&self, descriptor: &DeviceDescriptor) -> Result<Box<dyn Backend>> {
        let DeviceAddress::Node(index) = descriptor.address else {
            return Err(CameraError::OpenFailed {
                device: descriptor.to_string(),
                reason: "not a device node".to_owned(),
            });
        };
        Ok(Box::new(V4l2Backend::open(index, self.stream_buffers)?))
    }
}

/// Camera behind a video-capture device node.
pub struct V4l2Backend {
    index: u32,
    device: Device,
    info: SensorInfo,
    bindings: BTreeMap<ControlId, Binding>,
    format: Option<ActualFormat>,
    frame_rate: Option<FrameRate>,
    stream: Option<Stream<'static>>,
    stream_buffers: u32,
}

impl V4l2Backend {
    /// Open `/dev/video{index}`.
    pub fn open(index: u32, stream_buffers: u32) -> Result<Self> {
        let open_failed = |reason: String| CameraError::OpenFailed {
            device: format!("/dev/video{index}"),
            reason,
        };
        let device = Device::new(index as usize).map_err(|err| open_failed(err.to_string()))?;
        let caps = device
            .query_caps()
            .map_err(|err| open_failed(err.to_string()))?;
        if !caps
            .capabilities
            .contains(v4l::capability::Flags::VIDEO_CAPTURE)
        {
            return Err(open_failed("not a video capture device".to_owned()));
        }

        let offered: Vec<FourCC> = device
            .enum_formats()
            .map_err(|err| open_failed(err.to_string()))?
            .into_iter()
            .map(|desc| FourCC::from(desc.fourcc))
            .collect();
        let pixel_formats: Vec<PixelFormat> = PixelFormat::ALL
            .into_iter()
            .filter(|format| offered.contains(&format.fourcc()))
            .collect();
        let Some(preferred) = pixel_formats.first().copied() else {
            return Err(open_failed("no supported pixel format".to_owned()));
        };

        let sizes = enum_sizes(&device, preferred);
        let largest = sizes.first().copied().unwrap_or_else(|| {
            device
                .format()
                .map_or(FrameSize::new(0, 0), |fmt| FrameSize::new(fmt.width, fmt.height))
        });
        let frame_rate_support = !enum_rates(&device, preferred, largest).is_empty();

        let info = SensorInfo {
            name: caps.card,
            colour: pixel_formats.iter().any(|f| f.is_colour()),
            max_width: largest.width,
            max_height: largest.height,
            binning_factors: vec![1],
            pixel_formats,
            frame_rate_support,
            programmable_roi: false,
        };
        log::info!(
            "opened /dev/video{index}: {} ({}), max {largest}",
            info.name,
            caps.driver
        );

        Ok(Self {
            index,
            device,
            info,
            bindings: BTreeMap::new(),
            format: None,
            frame_rate: None,
            stream: None,
            stream_buffers: stream_buffers.max(1),
        })
    }

    fn binding(&self, id: ControlId) -> Result<Binding> {
        self.bindings
            .get(&id)
            .copied()
            .ok_or(CameraError::UnsupportedControl(id))
    }

    fn read_raw(&self, cid: u32) -> Result<i64> {
        let control = self.device.control(cid).map_err(|e| io_error(&e))?;
        match control.value {
            control::Value::Integer(v) => Ok(v),
            control::Value::Boolean(b) => Ok(i64::from(b)),
            _ => Err(CameraError::TransientIo(format!(
                "control {cid:#x} has an unexpected type"
            ))),
        }
    }

    fn write_raw(&self, cid: u32, boolean: bool, value: i64) -> Result<()> {
        let value = if boolean {
            control::Value::Boolean(value != 0)
        } else {
            control::Value::Integer(value)
        };
        self.device
            .set_control(Control { id: cid, value })
            .map_err(|e| io_error(&e))
    }

    fn apply_frame_rate(&self, rate: FrameRate) -> Result<()> {
        let params = Parameters::new(Fraction::new(rate.numerator, rate.denominator));
        let actual = self
            .device
            .set_params(&params)
            .map_err(|err| CameraError::FormatRejected(err.to_string()))?;
        if actual.interval.numerator != rate.numerator
            || actual.interval.denominator != rate.denominator
        {
            log::warn!(
                "frame interval {rate} adjusted to {}/{}s",
                actual.interval.numerator,
                actual.interval.denominator
            );
        }
        Ok(())
    }
}

fn enum_sizes(device: &Device, format: PixelFormat) -> Vec<FrameSize> {
    let mut sizes: Vec<FrameSize> = device
        .enum_framesizes(format.fourcc().into())
        .unwrap_or_default()
        .into_iter()
        .flat_map(|size| match size.size {
            FrameSizeEnum::Discrete(d) => vec![FrameSize::new(d.width, d.height)],
            FrameSizeEnum::Stepwise(s) => vec![
                FrameSize::new(s.max_width, s.max_height),
                FrameSize::new(s.min_width, s.min_height),
            ],
        })
        .collect();
    sizes.sort_by_key(|size| std::cmp::Reverse(size.area()));
    sizes.dedup();
    sizes
}

fn enum_rates(device: &Device, format: PixelFormat, size: FrameSize) -> Vec<FrameRate> {
    device
        .enum_frameintervals(format.fourcc().into(), size.width, size.height)
        .unwrap_or_default()
        .into_iter()
        .flat_map(|interval| match interval.interval {
            FrameIntervalEnum::Discrete(f) => vec![FrameRate::new(f.numerator, f.denominator)],
            FrameIntervalEnum::Stepwise(s) => vec![
                FrameRate::new(s.min.numerator, s.min.denominator),
                FrameRate::new(s.max.numerator, s.max.denominator),
            ],
        })
        .collect()
}

impl Backend for V4l2Backend {
    fn info(&self) -> &SensorInfo {
        &self.info
    }

    fn query_controls(&mut self) -> Result<Vec<ControlDescriptor>> {
        // Unknown control types make the v4l crate panic while converting
        // descriptions; treat that as "no controls".
        let described = match catch_unwind(AssertUnwindSafe(|| self.device.query_controls())) {
            Ok(Ok(list)) => list,
            Ok(Err(err)) => {
                log::warn!("/dev/video{}: control query failed: {err}", self.index);
                Vec::new()
            }
            Err(_) => {
                log::warn!("/dev/video{}: unsupported control types", self.index);
                Vec::new()
            }
        };
        let available: BTreeMap<u32, &control::Description> = described
            .iter()
            .filter(|d| !d.flags.contains(control::Flags::DISABLED))
            .map(|d| (d.id, d))
            .collect();

        self.bindings.clear();
        let mut descriptors = Vec::new();
        for &(id, cid, auto, scale) in CANDIDATES {
            if self.bindings.contains_key(&id) {
                continue;
            }
            let Some(desc) = available.get(&cid) else {
                continue;
            };
            let auto = auto.filter(|switch| match switch {
                AutoSwitch::Flag(flag) => available.contains_key(flag),
                AutoSwitch::ExposureMenu => available.contains_key(&cid::EXPOSURE_AUTO),
            });
            #[allow(clippy::cast_possible_wrap)]
            let step = (desc.step as i64).max(1) * scale;
            let mut descriptor = ControlDescriptor::new(
                id,
                desc.minimum * scale,
                desc.maximum * scale,
                step,
                desc.default * scale,
            );
            descriptor.auto_capable = auto.is_some();
            self.bindings.insert(
                id,
                Binding {
                    cid,
                    boolean: matches!(desc.typ, control::Type::Boolean),
                    auto,
                    scale,
                },
            );
            descriptors.push(descriptor);
        }
        // Capture size selection stands in for a region of interest.
        descriptors.push(ControlDescriptor::new(ControlId::Roi, 1, 1, 1, 1));
        log::debug!(
            "/dev/video{}: {} of {} driver controls mapped",
            self.index,
            descriptors.len() - 1,
            available.len()
        );
        Ok(descriptors)
    }

    fn frame_sizes(&self, binning: u32) -> Vec<FrameSize> {
        if binning != 1 {
            return Vec::new();
        }
        self.info
            .pixel_formats
            .first()
            .map(|format| enum_sizes(&self.device, *format))
            .unwrap_or_default()
    }

    fn frame_rates(&self, size: FrameSize) -> Vec<FrameRate> {
        let format = self
            .format
            .map(|f| f.pixel_format)
            .or_else(|| self.info.pixel_formats.first().copied());
        format
            .map(|format| enum_rates(&self.device, format, size))
            .unwrap_or_default()
    }

    fn negotiate_format(&mut self, request: &FormatRequest) -> Result<ActualFormat> {
        if request.binning != 1 {
            return Err(CameraError::FormatRejected(format!(
                "binning {} not supported by a device node",
                request.binning
            )));
        }
        self.stream = None;

        let mut fmt = self
            .device
            .format()
            .map_err(|err| CameraError::FormatRejected(err.to_string()))?;
        fmt.width = request.width;
        fmt.height = request.height;
        fmt.fourcc = request.pixel_format.fourcc().into();
        let fmt = self
            .device
            .set_format(&fmt)
            .map_err(|err| CameraError::FormatRejected(err.to_string()))?;

        let fourcc = FourCC::from(fmt.fourcc);
        let pixel_format = PixelFormat::from_fourcc(fourcc).ok_or_else(|| {
            CameraError::FormatRejected(format!("driver switched to unsupported {fourcc}"))
        })?;
        if let Some(rate) = request.frame_rate {
            self.apply_frame_rate(rate)?;
        }

        let actual = ActualFormat {
            width: fmt.width,
            height: fmt.height,
            binning: 1,
            pixel_format,
            origin_x: 0,
            origin_y: 0,
            stride: fmt.stride.max(fmt.width * pixel_format.bytes_per_pixel()),
        };
        if actual.size() != request.size() {
            log::debug!(
                "/dev/video{}: requested {}, driver chose {}",
                self.index,
                request.size(),
                actual.size()
            );
        }
        self.format = Some(actual);
        self.frame_rate = request.frame_rate;
        Ok(actual)
    }

    fn set_control(&mut self, id: ControlId, value: ControlValue) -> Result<()> {
        let binding = self.binding(id)?;
        match binding.auto {
            Some(AutoSwitch::Flag(flag)) => self.write_raw(flag, true, i64::from(value.auto))?,
            Some(AutoSwitch::ExposureMenu) => {
                let mode = if value.auto {
                    EXPOSURE_APERTURE_PRIORITY
                } else {
                    EXPOSURE_MANUAL
                };
                self.write_raw(cid::EXPOSURE_AUTO, false, mode)?;
            }
            None => {}
        }
        if value.auto {
            return Ok(());
        }
        let raw = if binding.scale > 1 {
            (value.value / binding.scale).max(1)
        } else {
            value.value
        };
        self.write_raw(binding.cid, binding.boolean, raw)
    }

    fn get_control(&mut self, id: ControlId) -> Result<ControlValue> {
        if id == ControlId::Roi {
            return Ok(ControlValue::manual(1));
        }
        let binding = self.binding(id)?;
        let value = self.read_raw(binding.cid)? * binding.scale;
        let auto = match binding.auto {
            Some(AutoSwitch::Flag(flag)) => self.read_raw(flag)? != 0,
            Some(AutoSwitch::ExposureMenu) => self.read_raw(cid::EXPOSURE_AUTO)? != EXPOSURE_MANUAL,
            None => false,
        };
        Ok(ControlValue::new(value, auto))
    }

    fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let stream = Stream::with_buffers(&self.device, Type::VideoCapture, self.stream_buffers)
            .map_err(|e| io_error(&e))?;
        self.stream = Some(stream);
        log::debug!("/dev/video{}: streaming", self.index);
        Ok(())
    }

    fn stop(&mut self) {
        if self.stream.take().is_some() {
            log::debug!("/dev/video{}: stream stopped", self.index);
        }
    }

    fn read_frame(&mut self, buf: &mut [u8], timeout: FrameTimeout) -> Result<ReadOutcome> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(CameraError::NotAvailable("device node is not streaming"));
        };
        match timeout {
            FrameTimeout::Infinite => stream.clear_timeout(),
            FrameTimeout::NonBlocking => stream.set_timeout(Duration::ZERO),
            FrameTimeout::After(d) => stream.set_timeout(d),
        }
        let (data, meta) = match stream.next() {
            Ok(next) => next,
            Err(err) => {
                return match io_error(&err) {
                    CameraError::Timeout => Ok(ReadOutcome::Timeout),
                    other => Err(other),
                };
            }
        };

        let used = (meta.bytesused as usize).min(data.len()).min(buf.len());
        let (Some(src), Some(dst)) = (data.get(..used), buf.get_mut(..used)) else {
            return Err(CameraError::TransientIo("frame larger than buffer".to_owned()));
        };
        dst.copy_from_slice(src);

        // V4L2 timestamps are never negative in practice.
        #[allow(clippy::cast_sign_loss)]
        let secs = meta.timestamp.sec.max(0) as u64;
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let nanos = (meta.timestamp.usec.max(0) as u32).saturating_mul(1000);

        Ok(ReadOutcome::Frame(FrameMetadata {
            sequence: meta.sequence,
            timestamp: Duration::new(secs, nanos),
            bytes_used: used,
        }))
    }

    fn reset(&mut self) -> Result<()> {
        let streaming = self.stream.is_some();
        self.stream = None;
        self.device = Device::new(self.index as usize).map_err(|err| CameraError::OpenFailed {
            device: format!("/dev/video{}", self.index),
            reason: err.to_string(),
        })?;
        if let Some(format) = self.format {
            let mut request = FormatRequest::new(format.width, format.height, format.pixel_format);
            request.frame_rate = self.frame_rate;
            self.negotiate_format(&request)?;
        }
        if streaming {
            self.start()?;
        }
        log::debug!("/dev/video{}: reset", self.index);
        Ok(())
    }
}
