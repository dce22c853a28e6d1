//! Mock hardware for testing without a camera.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::backend::register::{RegisterBatch, RegisterBus};
use crate::control::{ControlDescriptor, ControlId, ControlValue};
use crate::error::{CameraError, Result};
use crate::format::{ActualFormat, FormatRequest, FrameRate, FrameSize, FrameTimeout, PixelFormat};
use crate::traits::{
    Backend, DeviceAddress, DeviceDescriptor, Driver, FrameMetadata, InterfaceKind, ReadOutcome,
    SensorInfo,
};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Test pattern types for mock frame generation.
#[derive(Debug, Clone, Copy)]
pub enum TestPattern {
    /// 100% colour bars: white, yellow, cyan, green, magenta, red, blue, black.
    ColorBars,
    /// Horizontal gradient from dark to light.
    Gradient,
    /// Solid colour with the given R, G, B values.
    Solid(u8, u8, u8),
}

/// What the next `read_frame` call does.
#[derive(Debug, Clone)]
pub enum ScriptedRead {
    /// Deliver a frame.
    Frame,
    /// Report no frame before the deadline.
    Timeout,
    /// Fail with a transient error.
    Transient,
    /// Fail with device loss.
    DeviceLost,
}

/// Calls observed by a [`MockBackend`], shared with the test.
#[derive(Debug, Default)]
pub struct MockCalls {
    /// Every `set_control` call, in order.
    pub set_calls: Vec<(ControlId, ControlValue)>,
    /// Number of `commit_controls` calls.
    pub commits: usize,
    /// Every negotiated request.
    pub negotiations: Vec<FormatRequest>,
    /// Number of `start` calls.
    pub starts: usize,
    /// Number of `stop` calls.
    pub stops: usize,
    /// Number of `reset` calls.
    pub resets: usize,
    /// Number of `read_frame` calls.
    pub reads: usize,
}

/// Scriptable in-memory backend.
pub struct MockBackend {
    info: SensorInfo,
    descriptors: Vec<ControlDescriptor>,
    values: BTreeMap<ControlId, ControlValue>,
    snaps: HashMap<FrameSize, FrameSize>,
    rejected: Vec<FrameSize>,
    control_failures: HashMap<ControlId, VecDeque<CameraError>>,
    script: VecDeque<ScriptedRead>,
    idle_when_done: bool,
    pattern: TestPattern,
    frame_delay: Duration,
    format: Option<ActualFormat>,
    streaming: bool,
    sequence: u32,
    calls: Arc<Mutex<MockCalls>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    /// Mono 1280x1024 camera with gain `[0, 100]` and exposure `[1, 1000]` µs.
    #[must_use]
    pub fn new() -> Self {
        let descriptors = vec![
            ControlDescriptor::new(ControlId::Gain, 0, 100, 1, 50).with_auto(),
            ControlDescriptor::new(ControlId::Exposure, 1, 1000, 1, 100),
            ControlDescriptor::toggle(ControlId::FlipHorizontal),
            ControlDescriptor::new(ControlId::Binning, 1, 2, 1, 1),
            ControlDescriptor::new(ControlId::Roi, 1, 1, 1, 1),
        ];
        let values = descriptors
            .iter()
            .map(|d| (d.id, ControlValue::manual(d.default)))
            .collect();
        Self {
            info: SensorInfo {
                name: "Mock Camera".to_owned(),
                colour: false,
                max_width: 1280,
                max_height: 1024,
                binning_factors: vec![1, 2],
                pixel_formats: vec![PixelFormat::Grey8, PixelFormat::Grey16Le],
                frame_rate_support: true,
                programmable_roi: true,
            },
            descriptors,
            values,
            snaps: HashMap::new(),
            rejected: Vec::new(),
            control_failures: HashMap::new(),
            script: VecDeque::new(),
            idle_when_done: false,
            pattern: TestPattern::Gradient,
            frame_delay: Duration::from_millis(1),
            format: None,
            streaming: false,
            sequence: 0,
            calls: Arc::new(Mutex::new(MockCalls::default())),
        }
    }

    /// Colour variant delivering RGB24.
    #[must_use]
    pub fn colour(mut self) -> Self {
        self.info.colour = true;
        self.info.pixel_formats.insert(0, PixelFormat::Rgb24);
        self
    }

    /// Start-up value returned by `get_control` at open.
    #[must_use]
    pub fn with_value(mut self, id: ControlId, value: i64) -> Self {
        self.values.insert(id, ControlValue::manual(value));
        self
    }

    /// Make `negotiate_format` answer `from` with `to`.
    #[must_use]
    pub fn snapping(mut self, from: FrameSize, to: FrameSize) -> Self {
        self.snaps.insert(from, to);
        self
    }

    /// Make `negotiate_format` refuse a size.
    #[must_use]
    pub fn rejecting(mut self, size: FrameSize) -> Self {
        self.rejected.push(size);
        self
    }

    /// Fail the next `set_control` for `id` with `error`. Repeatable.
    #[must_use]
    pub fn failing_set(mut self, id: ControlId, error: CameraError) -> Self {
        self.control_failures.entry(id).or_default().push_back(error);
        self
    }

    /// Time every `read_frame` call takes.
    #[must_use]
    pub const fn with_frame_delay(mut self, delay: Duration) -> Self {
        self.frame_delay = delay;
        self
    }

    /// Queue read outcomes; frames are delivered once the script runs out.
    #[must_use]
    pub fn with_script<I>(mut self, reads: I) -> Self
    where
        I: IntoIterator<Item = ScriptedRead>,
    {
        self.script.extend(reads);
        self
    }

    /// Time out forever once the script runs out.
    #[must_use]
    pub const fn idle_when_done(mut self) -> Self {
        self.idle_when_done = true;
        self
    }

    /// Pattern drawn into delivered frames.
    #[must_use]
    pub const fn with_pattern(mut self, pattern: TestPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Handle for inspecting calls after the backend is moved away.
    pub fn calls(&self) -> Arc<Mutex<MockCalls>> {
        Arc::clone(&self.calls)
    }

    fn next_read(&mut self) -> ScriptedRead {
        self.script.pop_front().unwrap_or(if self.idle_when_done {
            ScriptedRead::Timeout
        } else {
            ScriptedRead::Frame
        })
    }
}

impl Backend for MockBackend {
    fn info(&self) -> &SensorInfo {
        &self.info
    }

    fn query_controls(&mut self) -> Result<Vec<ControlDescriptor>> {
        Ok(self.descriptors.clone())
    }

    fn frame_sizes(&self, binning: u32) -> Vec<FrameSize> {
        if !self.info.has_binning(binning) {
            return Vec::new();
        }
        let (w, h) = (self.info.max_width / binning, self.info.max_height / binning);
        vec![
            FrameSize::new(w, h),
            FrameSize::new(w / 2, h / 2),
            FrameSize::new(w / 4, h / 4),
        ]
    }

    fn frame_rates(&self, _size: FrameSize) -> Vec<FrameRate> {
        vec![FrameRate::new(1, 30), FrameRate::new(1, 15)]
    }

    fn negotiate_format(&mut self, request: &FormatRequest) -> Result<ActualFormat> {
        lock(&self.calls).negotiations.push(*request);
        if !self.info.pixel_formats.contains(&request.pixel_format) {
            return Err(CameraError::FormatRejected(format!(
                "{} not supported",
                request.pixel_format
            )));
        }
        if !self.info.has_binning(request.binning) {
            return Err(CameraError::FormatRejected(format!(
                "binning {} not supported",
                request.binning
            )));
        }
        if self.rejected.contains(&request.size()) {
            return Err(CameraError::FormatRejected(format!(
                "{} not supported",
                request.size()
            )));
        }
        let size = self
            .snaps
            .get(&request.size())
            .copied()
            .unwrap_or_else(|| request.size());
        let actual = ActualFormat::packed(request, size.width, size.height);
        self.format = Some(actual);
        Ok(actual)
    }

    fn set_control(&mut self, id: ControlId, value: ControlValue) -> Result<()> {
        lock(&self.calls).set_calls.push((id, value));
        if let Some(err) = self
            .control_failures
            .get_mut(&id)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }
        if !self.descriptors.iter().any(|d| d.id == id) {
            return Err(CameraError::UnsupportedControl(id));
        }
        self.values.insert(id, value);
        Ok(())
    }

    fn get_control(&mut self, id: ControlId) -> Result<ControlValue> {
        self.values
            .get(&id)
            .copied()
            .ok_or(CameraError::UnsupportedControl(id))
    }

    fn commit_controls(&mut self) -> Result<()> {
        lock(&self.calls).commits += 1;
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        lock(&self.calls).starts += 1;
        self.streaming = true;
        Ok(())
    }

    fn stop(&mut self) {
        lock(&self.calls).stops += 1;
        self.streaming = false;
    }

    fn read_frame(&mut self, buf: &mut [u8], _timeout: FrameTimeout) -> Result<ReadOutcome> {
        lock(&self.calls).reads += 1;
        std::thread::sleep(self.frame_delay);
        let Some(format) = self.format.filter(|_| self.streaming) else {
            return Err(CameraError::NotAvailable("mock is not streaming"));
        };
        match self.next_read() {
            ScriptedRead::Frame => {
                let data = generate_test_frame(&format, self.pattern);
                let used = data.len().min(buf.len());
                if let (Some(dst), Some(src)) = (buf.get_mut(..used), data.get(..used)) {
                    dst.copy_from_slice(src);
                }
                let sequence = self.sequence;
                self.sequence += 1;
                Ok(ReadOutcome::Frame(FrameMetadata {
                    sequence,
                    timestamp: Duration::from_millis(u64::from(sequence) * 33),
                    bytes_used: used,
                }))
            }
            ScriptedRead::Timeout => Ok(ReadOutcome::Timeout),
            ScriptedRead::Transient => Err(CameraError::TransientIo("mock glitch".to_owned())),
            ScriptedRead::DeviceLost => Err(CameraError::DeviceLost("mock unplugged".to_owned())),
        }
    }

    fn reset(&mut self) -> Result<()> {
        lock(&self.calls).resets += 1;
        Ok(())
    }

    fn temperature(&mut self) -> Option<f32> {
        Some(21.5)
    }
}

/// Driver handing out [`MockBackend`]s.
pub struct MockDriver {
    kind: InterfaceKind,
    names: Vec<String>,
    fail: bool,
}

impl MockDriver {
    /// Driver that lists one device per name.
    pub fn new(kind: InterfaceKind, names: &[&str]) -> Self {
        Self {
            kind,
            names: names.iter().map(|n| (*n).to_owned()).collect(),
            fail: false,
        }
    }

    /// Driver whose enumeration always fails.
    pub const fn failing(kind: InterfaceKind) -> Self {
        Self {
            kind,
            names: Vec::new(),
            fail: true,
        }
    }
}

impl Driver for MockDriver {
    fn kind(&self) -> InterfaceKind {
        self.kind
    }

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        if self.fail {
            return Err(CameraError::TransientIo("bus scan failed".to_owned()));
        }
        Ok(self
            .names
            .iter()
            .zip(0u32..)
            .map(|(name, index)| DeviceDescriptor {
                kind: self.kind,
                name: name.clone(),
                address: DeviceAddress::Node(index),
            })
            .collect())
    }

    fn open(&self, descriptor: &DeviceDescriptor) -> Result<Box<dyn Backend>> {
        if !self.names.contains(&descriptor.name) {
            return Err(CameraError::OpenFailed {
                device: descriptor.to_string(),
                reason: "no such mock device".to_owned(),
            });
        }
        let mut backend = MockBackend::new();
        backend.info.name.clone_from(&descriptor.name);
        Ok(Box::new(backend))
    }
}

/// Register traffic seen by a [`MockRegisterBus`].
#[derive(Debug, Clone, Default)]
pub struct BusLog {
    /// Current register file.
    pub registers: HashMap<u16, u16>,
    /// Every batch written.
    pub batches: Vec<RegisterBatch>,
    /// Number of reconnects.
    pub reopens: usize,
    /// Whether the bridge is streaming.
    pub streaming: bool,
    frame_lens: VecDeque<Option<usize>>,
}

impl BusLog {
    /// Last value written to a register.
    pub fn register(&self, address: u16) -> Option<u16> {
        self.registers.get(&address).copied()
    }
}

/// In-memory register file.
#[derive(Debug, Clone, Default)]
pub struct MockRegisterBus {
    log: Arc<Mutex<BusLog>>,
}

impl MockRegisterBus {
    /// Empty register file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the traffic so far.
    pub fn log(&self) -> BusLog {
        lock(&self.log).clone()
    }

    /// Preload a register, e.g. a calibration value.
    pub fn set_register(&self, address: u16, value: u16) {
        lock(&self.log).registers.insert(address, value);
    }

    /// Next frame read returns only `len` bytes.
    pub fn push_frame_len(&self, len: usize) {
        lock(&self.log).frame_lens.push_back(Some(len));
    }

    /// Next frame read times out.
    pub fn push_timeout(&self) {
        lock(&self.log).frame_lens.push_back(None);
    }
}

impl RegisterBus for MockRegisterBus {
    fn read_register(&mut self, address: u16) -> Result<u16> {
        Ok(lock(&self.log).register(address).unwrap_or(0))
    }

    fn write_register(&mut self, address: u16, value: u16) -> Result<()> {
        lock(&self.log).registers.insert(address, value);
        Ok(())
    }

    fn write_batch(&mut self, batch: &RegisterBatch) -> Result<()> {
        let mut log = lock(&self.log);
        for (address, value) in batch.iter() {
            log.registers.insert(address, value);
        }
        log.batches.push(batch.clone());
        Ok(())
    }

    fn start_stream(&mut self) -> Result<()> {
        lock(&self.log).streaming = true;
        Ok(())
    }

    fn stop_stream(&mut self) -> Result<()> {
        lock(&self.log).streaming = false;
        Ok(())
    }

    fn read_frame(&mut self, buf: &mut [u8], _timeout: Option<Duration>) -> Result<usize> {
        match lock(&self.log).frame_lens.pop_front() {
            Some(None) => Err(CameraError::Timeout),
            Some(Some(len)) => Ok(len.min(buf.len())),
            None => {
                buf.fill(0x80);
                Ok(buf.len())
            }
        }
    }

    fn reopen(&mut self) -> Result<()> {
        lock(&self.log).reopens += 1;
        Ok(())
    }
}

/// Draw a test pattern for the given format.
pub fn generate_test_frame(format: &ActualFormat, pattern: TestPattern) -> Vec<u8> {
    let mut data = vec![0u8; format.frame_bytes()];
    let width = format.width.max(1);
    for y in 0..format.height {
        for x in 0..format.width {
            let rgb = match pattern {
                TestPattern::ColorBars => COLOR_BARS
                    .get(((x * 8) / width) as usize)
                    .copied()
                    .unwrap_or((0, 0, 0)),
                TestPattern::Gradient => {
                    #[allow(clippy::cast_possible_truncation)]
                    let v = ((x * 255) / width) as u8;
                    (v, v, v)
                }
                TestPattern::Solid(r, g, b) => (r, g, b),
            };
            write_pixel(&mut data, format, x, y, rgb);
        }
    }
    data
}

const COLOR_BARS: [(u8, u8, u8); 8] = [
    (255, 255, 255),
    (255, 255, 0),
    (0, 255, 255),
    (0, 255, 0),
    (255, 0, 255),
    (255, 0, 0),
    (0, 0, 255),
    (0, 0, 0),
];

fn write_pixel(data: &mut [u8], format: &ActualFormat, x: u32, y: u32, (r, g, b): (u8, u8, u8)) {
    let bpp = format.pixel_format.bytes_per_pixel() as usize;
    let offset = y as usize * format.stride as usize + x as usize * bpp;
    let Some(px) = data.get_mut(offset..offset + bpp) else {
        return;
    };
    #[allow(clippy::cast_possible_truncation)]
    let luma = ((u32::from(r) * 299 + u32::from(g) * 587 + u32::from(b) * 114) / 1000) as u8;
    match (format.pixel_format, px) {
        (PixelFormat::Grey8, [v]) => *v = luma,
        (PixelFormat::Grey16Le, [lo, hi]) | (PixelFormat::Grey16Be, [hi, lo]) => {
            *hi = luma;
            *lo = 0;
        }
        (PixelFormat::Rgb24, [pr, pg, pb]) | (PixelFormat::Bgr24, [pb, pg, pr]) => {
            *pr = r;
            *pg = g;
            *pb = b;
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::Frame;

    fn frame(width: u32, height: u32, pixel_format: PixelFormat, pattern: TestPattern) -> Frame {
        let request = FormatRequest::new(width, height, pixel_format);
        let format = ActualFormat::packed(&request, width, height);
        Frame {
            data: generate_test_frame(&format, pattern),
            format,
            metadata: FrameMetadata::default(),
        }
    }

    #[test]
    fn test_mock_backend_negotiate_snaps() {
        let mut backend = MockBackend::new().snapping(FrameSize::new(640, 480), FrameSize::new(640, 512));
        let actual = backend
            .negotiate_format(&FormatRequest::new(640, 480, PixelFormat::Grey8))
            .expect("negotiate should succeed");
        assert_eq!(actual.size(), FrameSize::new(640, 512));
    }

    #[test]
    fn test_mock_backend_follows_script() {
        let mut backend = MockBackend::new()
            .with_script([ScriptedRead::Timeout, ScriptedRead::Transient])
            .idle_when_done();
        backend
            .negotiate_format(&FormatRequest::new(64, 64, PixelFormat::Grey8))
            .expect("negotiate should succeed");
        backend.start().expect("start should succeed");
        let mut buf = vec![0; 64 * 64];
        assert_eq!(
            backend
                .read_frame(&mut buf, FrameTimeout::NonBlocking)
                .expect("timeout"),
            ReadOutcome::Timeout
        );
        assert!(matches!(
            backend.read_frame(&mut buf, FrameTimeout::NonBlocking),
            Err(CameraError::TransientIo(_))
        ));
        assert_eq!(
            backend
                .read_frame(&mut buf, FrameTimeout::NonBlocking)
                .expect("idle"),
            ReadOutcome::Timeout
        );
        assert_eq!(backend.calls().lock().expect("calls").reads, 3);
    }

    #[test]
    fn test_color_bars_pattern() {
        let frame = frame(640, 480, PixelFormat::Rgb24, TestPattern::ColorBars);
        assert_eq!(frame.data.len(), 640 * 480 * 3);
        assert_eq!(frame.pixel_at(0, 0), Some((255, 255, 255)));
        assert_eq!(frame.pixel_at(639, 479), Some((0, 0, 0)));
    }

    #[test]
    fn test_gradient_pattern() {
        let frame = frame(640, 480, PixelFormat::Grey8, TestPattern::Gradient);
        let (left, _, _) = frame.pixel_at(0, 0).expect("left pixel");
        let (right, _, _) = frame.pixel_at(639, 479).expect("right pixel");
        assert!(left < 10);
        assert!(right > 200);
    }

    #[test]
    fn test_solid_pattern_sixteen_bit() {
        let frame = frame(8, 8, PixelFormat::Grey16Le, TestPattern::Solid(128, 128, 128));
        assert_eq!(frame.data.first(), Some(&0));
        assert_eq!(frame.data.get(1), Some(&128));
        assert_eq!(frame.pixel_at(7, 7), Some((128, 128, 128)));
    }
}
