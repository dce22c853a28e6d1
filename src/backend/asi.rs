//! Direct-register backend for USB astronomy cameras.
//!
//! These cameras have no OS video driver. The bridge chip exposes the image
//! sensor's register file, so geometry, exposure and gain are programmed by
//! writing sensor registers and frames arrive over a bulk endpoint.

use std::collections::BTreeMap;
use std::time::Instant;

use crate::backend::register::{usb_error, RegisterBatch, RegisterBus, UsbRegisterBus};
use crate::control::{ControlDescriptor, ControlId, ControlValue};
use crate::error::{CameraError, Result};
use crate::format::{ActualFormat, FormatRequest, FrameRate, FrameSize, FrameTimeout, PixelFormat};
use crate::traits::{
    Backend, DeviceAddress, DeviceDescriptor, Driver, FrameMetadata, InterfaceKind, ReadOutcome,
    SensorInfo,
};

/// USB vendor id of the supported camera family.
pub const VENDOR_ID: u16 = 0x03c3;

mod reg {
    pub const Y_ADDR_START: u16 = 0x3002;
    pub const X_ADDR_START: u16 = 0x3004;
    pub const Y_ADDR_END: u16 = 0x3006;
    pub const X_ADDR_END: u16 = 0x3008;
    pub const LINE_LENGTH: u16 = 0x300c;
    pub const COARSE_INTEGRATION: u16 = 0x3012;
    pub const RESET: u16 = 0x301a;
    pub const DATA_PEDESTAL: u16 = 0x301e;
    pub const DIGITAL_BINNING: u16 = 0x3032;
    pub const READ_MODE: u16 = 0x3040;
    pub const BLUE_GAIN: u16 = 0x3058;
    pub const RED_GAIN: u16 = 0x305a;
    pub const GLOBAL_GAIN: u16 = 0x305e;
    pub const TEMPERATURE: u16 = 0x30b2;
    pub const TEMPERATURE_CAL_70: u16 = 0x30c6;
    pub const TEMPERATURE_CAL_55: u16 = 0x30c8;
    pub const AE_CTRL: u16 = 0x3100;
    pub const DATA_FORMAT: u16 = 0x31ac;
    // Bridge pseudo-registers.
    pub const USB_TRAFFIC: u16 = 0xf001;
    pub const GAMMA: u16 = 0xf002;
}

const RESET_STREAMING: u16 = 0x10dc;
const RESET_IDLE: u16 = 0x10d8;
const READ_MODE_HFLIP: u16 = 1 << 14;
const READ_MODE_VFLIP: u16 = 1 << 15;
const AE_ENABLE: u16 = 1 << 0;
const AUTO_GAIN_ENABLE: u16 = 1 << 1;
const DATA_FORMAT_12BIT: u16 = 0x0c0c;
const DATA_FORMAT_8BIT: u16 = 0x0c08;
const GAIN_BASE: u16 = 0x20;
const LINE_TIME_NS: i64 = 17_500;
const LINE_LENGTH_SHORT: u16 = 1600;
// Stretched line used once the integration count no longer fits.
const LINE_LENGTH_LONG: u16 = 0x2fff;
const LONG_LINE_NS: i64 = LINE_TIME_NS * 0x2fff / 1600;
const MAX_LINES: i64 = 65_535;
/// Longest exposure the integration registers can hold, in µs.
pub const MAX_EXPOSURE_US: i64 = MAX_LINES * LONG_LINE_NS / 1000;

/// A supported camera model.
#[derive(Debug)]
pub struct SensorModel {
    /// USB product id.
    pub product_id: u16,
    /// Marketing name.
    pub name: &'static str,
    /// Bayer sensor.
    pub colour: bool,
    /// Full sensor width.
    pub width: u32,
    /// Full sensor height.
    pub height: u32,
    /// `(binning, width, height)` for every discrete window size.
    pub sizes: &'static [(u32, u32, u32)],
    /// Default values that differ from the generic control table.
    pub default_overrides: &'static [(ControlId, i64)],
}

impl SensorModel {
    fn binning_factors(&self) -> Vec<u32> {
        let mut factors: Vec<u32> = self.sizes.iter().map(|(bin, _, _)| *bin).collect();
        factors.sort_unstable();
        factors.dedup();
        factors
    }
}

const ASI120_SIZES: &[(u32, u32, u32)] = &[
    (1, 1280, 960),
    (1, 1280, 720),
    (1, 1280, 600),
    (1, 1280, 400),
    (1, 960, 960),
    (1, 1024, 768),
    (1, 1024, 600),
    (1, 1024, 400),
    (1, 800, 800),
    (1, 800, 640),
    (1, 800, 512),
    (1, 800, 320),
    (1, 640, 560),
    (1, 640, 480),
    (1, 512, 440),
    (1, 512, 400),
    (1, 480, 320),
    (1, 320, 240),
];

const ASI120MM_SIZES: &[(u32, u32, u32)] = &[
    (1, 1280, 960),
    (1, 1280, 720),
    (1, 1280, 600),
    (1, 1280, 400),
    (1, 960, 960),
    (1, 1024, 768),
    (1, 1024, 600),
    (1, 1024, 400),
    (1, 800, 800),
    (1, 800, 640),
    (1, 800, 512),
    (1, 800, 320),
    (1, 640, 560),
    (1, 640, 480),
    (1, 512, 440),
    (1, 512, 400),
    (1, 480, 320),
    (1, 320, 240),
    (2, 640, 480),
];

const ASI130_SIZES: &[(u32, u32, u32)] = &[
    (1, 1280, 1024),
    (1, 1280, 960),
    (1, 1024, 768),
    (1, 800, 600),
    (1, 640, 480),
    (1, 320, 240),
    (2, 640, 512),
    (4, 320, 256),
];

/// Supported models.
pub static MODELS: &[SensorModel] = &[
    SensorModel {
        product_id: 0x120a,
        name: "ZWO ASI120MM",
        colour: false,
        width: 1280,
        height: 960,
        sizes: ASI120MM_SIZES,
        default_overrides: &[(ControlId::UsbTraffic, 40)],
    },
    SensorModel {
        product_id: 0x120b,
        name: "ZWO ASI120MC",
        colour: true,
        width: 1280,
        height: 960,
        sizes: ASI120_SIZES,
        default_overrides: &[
            (ControlId::UsbTraffic, 40),
            (ControlId::RedBalance, 50),
            (ControlId::BlueBalance, 70),
        ],
    },
    SensorModel {
        product_id: 0x130a,
        name: "ZWO ASI130MM",
        colour: false,
        width: 1280,
        height: 1024,
        sizes: ASI130_SIZES,
        default_overrides: &[],
    },
];

/// Look a model up by USB product id.
pub fn model_for(product_id: u16) -> Option<&'static SensorModel> {
    MODELS.iter().find(|model| model.product_id == product_id)
}

fn descriptors_for(model: &SensorModel) -> Vec<ControlDescriptor> {
    let max_binning = model
        .binning_factors()
        .last()
        .copied()
        .map_or(1, i64::from);
    let mut descriptors = vec![
        ControlDescriptor::new(ControlId::Gain, 0, 100, 1, 0).with_auto(),
        ControlDescriptor::new(ControlId::Exposure, 32, MAX_EXPOSURE_US, 1, 10_000).with_auto(),
        ControlDescriptor::new(ControlId::Gamma, 1, 100, 1, 50),
        ControlDescriptor::new(ControlId::Brightness, 0, 100, 1, 0),
        ControlDescriptor::toggle(ControlId::FlipHorizontal),
        ControlDescriptor::toggle(ControlId::FlipVertical),
        ControlDescriptor::new(ControlId::UsbTraffic, 35, 100, 1, 80),
        ControlDescriptor::new(ControlId::Binning, 1, max_binning, 1, 1),
        ControlDescriptor::new(ControlId::Roi, 1, 1, 1, 1),
    ];
    if model.colour {
        descriptors.push(ControlDescriptor::new(ControlId::RedBalance, 1, 100, 1, 52));
        descriptors.push(ControlDescriptor::new(ControlId::BlueBalance, 1, 100, 1, 95));
    }
    for (id, default) in model.default_overrides {
        if let Some(descriptor) = descriptors.iter_mut().find(|d| d.id == *id) {
            descriptor.default = descriptor.clamp(*default);
        }
    }
    descriptors
}

fn to_register(value: i64) -> u16 {
    u16::try_from(value.max(0)).unwrap_or(u16::MAX)
}

/// Line length, line count and the exposure they actually give, in µs.
fn exposure_timing(micros: i64) -> (u16, u16, i64) {
    let short_lines = (micros * 1000 + LINE_TIME_NS / 2) / LINE_TIME_NS;
    let (line_length, line_ns) = if short_lines > MAX_LINES {
        (LINE_LENGTH_LONG, LONG_LINE_NS)
    } else {
        (LINE_LENGTH_SHORT, LINE_TIME_NS)
    };
    let lines = ((micros * 1000 + line_ns / 2) / line_ns).clamp(1, MAX_LINES);
    (line_length, to_register(lines), (lines * line_ns + 500) / 1000)
}

/// Discovers supported cameras on the USB bus.
#[derive(Debug, Default, Clone, Copy)]
pub struct AsiDriver;

impl Driver for AsiDriver {
    fn kind(&self) -> InterfaceKind {
        InterfaceKind::DirectRegister
    }

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        let devices = rusb::devices().map_err(usb_error)?;
        let mut found = Vec::new();
        for device in devices.iter() {
            let Ok(desc) = device.device_descriptor() else {
                continue;
            };
            if desc.vendor_id() != VENDOR_ID {
                continue;
            }
            let Some(model) = model_for(desc.product_id()) else {
                log::debug!("skipping unsupported camera {:04x}", desc.product_id());
                continue;
            };
            found.push(DeviceDescriptor {
                kind: InterfaceKind::DirectRegister,
                name: model.name.to_owned(),
                address: DeviceAddress::Usb {
                    bus: device.bus_number(),
                    address: device.address(),
                    product_id: desc.product_id(),
                },
            });
        }
        Ok(found)
    }

    fn open(&self, descriptor: &DeviceDescriptor) -> Result<Box<dyn Backend>> {
        let DeviceAddress::Usb {
            bus,
            address,
            product_id,
        } = descriptor.address
        else {
            return Err(CameraError::OpenFailed {
                device: descriptor.to_string(),
                reason: "not a usb device".to_owned(),
            });
        };
        let model = model_for(product_id).ok_or_else(|| CameraError::OpenFailed {
            device: descriptor.to_string(),
            reason: format!("unsupported product id {product_id:04x}"),
        })?;
        let bus = UsbRegisterBus::open(bus, address)?;
        log::info!("opened {} at {}", model.name, descriptor.address);
        Ok(Box::new(AsiBackend::new(bus, model)?))
    }
}

/// A camera driven through its sensor registers.
pub struct AsiBackend<B: RegisterBus> {
    bus: B,
    model: &'static SensorModel,
    info: SensorInfo,
    descriptors: Vec<ControlDescriptor>,
    values: BTreeMap<ControlId, ControlValue>,
    pending: RegisterBatch,
    read_mode: u16,
    ae_ctrl: u16,
    format: Option<ActualFormat>,
    last_request: Option<FormatRequest>,
    streaming: bool,
    sequence: u32,
    started_at: Instant,
}

impl<B: RegisterBus> AsiBackend<B> {
    /// Program default control values and idle the sensor.
    pub fn new(bus: B, model: &'static SensorModel) -> Result<Self> {
        let info = SensorInfo {
            name: model.name.to_owned(),
            colour: model.colour,
            max_width: model.width,
            max_height: model.height,
            binning_factors: model.binning_factors(),
            pixel_formats: vec![PixelFormat::Grey8, PixelFormat::Grey16Le],
            frame_rate_support: false,
            programmable_roi: true,
        };
        let descriptors = descriptors_for(model);
        let mut backend = Self {
            bus,
            model,
            info,
            descriptors,
            values: BTreeMap::new(),
            pending: RegisterBatch::new(),
            read_mode: 0,
            ae_ctrl: 0,
            format: None,
            last_request: None,
            streaming: false,
            sequence: 0,
            started_at: Instant::now(),
        };
        backend.pending.push(reg::RESET, RESET_IDLE);
        let defaults: Vec<_> = backend
            .descriptors
            .iter()
            .filter(|d| !d.id.is_geometry())
            .map(|d| (d.id, ControlValue::manual(d.default)))
            .collect();
        for (id, value) in defaults {
            backend.queue(id, value)?;
        }
        backend.values.insert(ControlId::Binning, ControlValue::manual(1));
        backend.values.insert(ControlId::Roi, ControlValue::manual(1));
        backend.commit_controls()?;
        Ok(backend)
    }

    /// The underlying register transport.
    pub const fn bus(&self) -> &B {
        &self.bus
    }

    fn descriptor(&self, id: ControlId) -> Result<&ControlDescriptor> {
        self.descriptors
            .iter()
            .find(|d| d.id == id)
            .ok_or(CameraError::UnsupportedControl(id))
    }

    fn set_flag(word: &mut u16, bit: u16, on: bool) {
        if on {
            *word |= bit;
        } else {
            *word &= !bit;
        }
    }

    /// Translate a control into pending register writes.
    fn queue(&mut self, id: ControlId, value: ControlValue) -> Result<()> {
        let raw = self.descriptor(id)?.clamp(value.value);
        match id {
            ControlId::Gain => {
                Self::set_flag(&mut self.ae_ctrl, AUTO_GAIN_ENABLE, value.auto);
                self.pending.push(reg::AE_CTRL, self.ae_ctrl);
                self.pending
                    .push(reg::GLOBAL_GAIN, GAIN_BASE.saturating_add(to_register(raw)));
            }
            ControlId::Exposure => {
                Self::set_flag(&mut self.ae_ctrl, AE_ENABLE, value.auto);
                self.pending.push(reg::AE_CTRL, self.ae_ctrl);
                let (line_length, lines, actual) = exposure_timing(raw);
                self.pending.push(reg::LINE_LENGTH, line_length);
                self.pending.push(reg::COARSE_INTEGRATION, lines);
                if actual != raw {
                    log::debug!("{id} {raw} us programmed as {actual} us");
                }
                self.values.insert(id, ControlValue::new(actual, value.auto));
                return Ok(());
            }
            ControlId::Gamma => self.pending.push(reg::GAMMA, to_register(raw)),
            ControlId::RedBalance => self.pending.push(reg::RED_GAIN, to_register(raw)),
            ControlId::BlueBalance => self.pending.push(reg::BLUE_GAIN, to_register(raw)),
            ControlId::Brightness => self.pending.push(reg::DATA_PEDESTAL, to_register(raw)),
            ControlId::FlipHorizontal => {
                Self::set_flag(&mut self.read_mode, READ_MODE_HFLIP, raw != 0);
                self.pending.push(reg::READ_MODE, self.read_mode);
            }
            ControlId::FlipVertical => {
                Self::set_flag(&mut self.read_mode, READ_MODE_VFLIP, raw != 0);
                self.pending.push(reg::READ_MODE, self.read_mode);
            }
            ControlId::UsbTraffic => self.pending.push(reg::USB_TRAFFIC, to_register(raw)),
            ControlId::Binning => {
                let factor = u32::try_from(value.value).unwrap_or(0);
                if !self.info.has_binning(factor) {
                    return Err(CameraError::InvalidControl {
                        id,
                        reason: format!("binning {} not supported", value.value),
                    });
                }
            }
            ControlId::Roi => {
                return Err(CameraError::InvalidControl {
                    id,
                    reason: "region of interest is set through set_roi".to_owned(),
                });
            }
        }
        self.values.insert(id, ControlValue::new(raw, value.auto));
        Ok(())
    }

    fn window_registers(&mut self, format: &ActualFormat) {
        let bin = format.binning;
        let x_start = format.origin_x * bin;
        let y_start = format.origin_y * bin;
        let x_end = x_start + format.width * bin - 1;
        let y_end = y_start + format.height * bin - 1;
        let binning = match bin {
            1 => 0x0000,
            2 => 0x0022,
            _ => 0x0033,
        };
        let data_format = if format.pixel_format.bit_depth() > 8 {
            DATA_FORMAT_12BIT
        } else {
            DATA_FORMAT_8BIT
        };
        for (address, value) in [
            (reg::X_ADDR_START, x_start),
            (reg::Y_ADDR_START, y_start),
            (reg::X_ADDR_END, x_end),
            (reg::Y_ADDR_END, y_end),
        ] {
            self.pending
                .push(address, u16::try_from(value).unwrap_or(u16::MAX));
        }
        self.pending.push(reg::DIGITAL_BINNING, binning);
        self.pending.push(reg::DATA_FORMAT, data_format);
    }

    fn read_temperature(&mut self) -> Result<Option<f32>> {
        let raw = self.bus.read_register(reg::TEMPERATURE)?;
        let cal70 = self.bus.read_register(reg::TEMPERATURE_CAL_70)?;
        let cal55 = self.bus.read_register(reg::TEMPERATURE_CAL_55)?;
        if cal70 == cal55 {
            return Ok(None);
        }
        let span = f32::from(cal70) - f32::from(cal55);
        Ok(Some(55.0 + (f32::from(raw) - f32::from(cal55)) * 15.0 / span))
    }
}

impl<B: RegisterBus> Backend for AsiBackend<B> {
    fn info(&self) -> &SensorInfo {
        &self.info
    }

    fn query_controls(&mut self) -> Result<Vec<ControlDescriptor>> {
        Ok(self.descriptors.clone())
    }

    fn frame_sizes(&self, binning: u32) -> Vec<FrameSize> {
        self.model
            .sizes
            .iter()
            .filter(|(bin, _, _)| *bin == binning)
            .map(|(_, w, h)| FrameSize::new(*w, *h))
            .collect()
    }

    fn frame_rates(&self, _size: FrameSize) -> Vec<FrameRate> {
        Vec::new()
    }

    fn negotiate_format(&mut self, request: &FormatRequest) -> Result<ActualFormat> {
        let bin = request.binning;
        if !self.info.has_binning(bin) {
            return Err(CameraError::FormatRejected(format!(
                "binning {bin} not supported by {}",
                self.model.name
            )));
        }
        if !self.info.pixel_formats.contains(&request.pixel_format) {
            return Err(CameraError::FormatRejected(format!(
                "{} not supported by {}",
                request.pixel_format, self.model.name
            )));
        }
        if request.frame_rate.is_some() {
            return Err(CameraError::FormatRejected(
                "frame interval is fixed on this camera".to_owned(),
            ));
        }
        let max_w = self.model.width / bin;
        let max_h = self.model.height / bin;
        // Window width must be a multiple of 8 and height even.
        let width = request.width.min(max_w) & !7;
        let height = request.height.min(max_h) & !1;
        if width == 0 || height == 0 {
            return Err(CameraError::FormatRejected(format!(
                "window {}x{} too small",
                request.width, request.height
            )));
        }
        let mut adjusted = *request;
        adjusted.origin_x = request.origin_x.min(max_w - width) & !1;
        adjusted.origin_y = request.origin_y.min(max_h - height) & !1;

        let actual = ActualFormat::packed(&adjusted, width, height);
        self.window_registers(&actual);
        self.commit_controls()?;
        self.format = Some(actual);
        self.last_request = Some(*request);
        log::debug!(
            "{} window {}x{} at ({}, {}) bin {bin} {}",
            self.model.name,
            width,
            height,
            actual.origin_x,
            actual.origin_y,
            actual.pixel_format
        );
        Ok(actual)
    }

    fn set_control(&mut self, id: ControlId, value: ControlValue) -> Result<()> {
        self.queue(id, value)
    }

    fn get_control(&mut self, id: ControlId) -> Result<ControlValue> {
        self.values
            .get(&id)
            .copied()
            .ok_or(CameraError::UnsupportedControl(id))
    }

    fn commit_controls(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let batch = self.pending.take();
        log::debug!("writing {} register(s)", batch.len());
        self.bus.write_batch(&batch)
    }

    fn start(&mut self) -> Result<()> {
        if self.format.is_none() {
            return Err(CameraError::FormatRejected(
                "no window negotiated".to_owned(),
            ));
        }
        self.pending.push(reg::RESET, RESET_STREAMING);
        self.commit_controls()?;
        self.bus.start_stream()?;
        self.streaming = true;
        self.sequence = 0;
        self.started_at = Instant::now();
        Ok(())
    }

    fn stop(&mut self) {
        if !self.streaming {
            return;
        }
        self.streaming = false;
        if let Err(err) = self.bus.stop_stream() {
            log::warn!("{}: stop stream failed: {err}", self.model.name);
        }
        if let Err(err) = self.bus.write_register(reg::RESET, RESET_IDLE) {
            log::warn!("{}: idle sensor failed: {err}", self.model.name);
        }
    }

    fn read_frame(&mut self, buf: &mut [u8], timeout: FrameTimeout) -> Result<ReadOutcome> {
        self.commit_controls()?;
        let (true, Some(format)) = (self.streaming, self.format) else {
            return Err(CameraError::NotAvailable("camera is not streaming"));
        };
        let frame_bytes = format.frame_bytes();
        let buf_len = buf.len();
        let target = buf.get_mut(..frame_bytes).ok_or_else(|| {
            CameraError::TransientIo(format!(
                "buffer of {buf_len} bytes cannot hold a {frame_bytes} byte frame"
            ))
        })?;
        let n = match self.bus.read_frame(target, timeout.duration()) {
            Ok(n) => n,
            Err(CameraError::Timeout) => return Ok(ReadOutcome::Timeout),
            Err(err) => return Err(err),
        };
        if n < frame_bytes {
            return Err(CameraError::TransientIo(format!(
                "short frame: {n} of {frame_bytes} bytes"
            )));
        }
        let metadata = FrameMetadata {
            sequence: self.sequence,
            timestamp: self.started_at.elapsed(),
            bytes_used: n,
        };
        self.sequence = self.sequence.wrapping_add(1);
        Ok(ReadOutcome::Frame(metadata))
    }

    fn reset(&mut self) -> Result<()> {
        let was_streaming = self.streaming;
        self.stop();
        self.bus.reopen()?;
        self.pending.push(reg::RESET, RESET_IDLE);
        let values: Vec<_> = self
            .values
            .iter()
            .filter(|(id, _)| !id.is_geometry())
            .map(|(id, value)| (*id, *value))
            .collect();
        for (id, value) in values {
            self.queue(id, value)?;
        }
        if let Some(request) = self.last_request {
            self.negotiate_format(&request)?;
        }
        self.commit_controls()?;
        if was_streaming {
            self.start()?;
        }
        Ok(())
    }

    fn temperature(&mut self) -> Option<f32> {
        match self.read_temperature() {
            Ok(reading) => reading,
            Err(err) => {
                log::debug!("{}: temperature unavailable: {err}", self.model.name);
                None
            }
        }
    }
}
