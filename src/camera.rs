//! The camera handle: one open backend, its controls and its geometry.
//!
//! A handle is either stopped, in which case the caller's thread owns the
//! backend, or started, in which case the capture thread does. Geometry
//! changes while started go through a full stop/reconfigure/reset/start
//! cycle; control changes are only staged and picked up by the capture
//! thread on its next iteration.

use std::collections::{BTreeMap, HashMap};

use crate::buffer::{FramePool, PoolStatus};
use crate::config::CaptureConfig;
use crate::control::{ControlDescriptor, ControlId, ControlRegistry, ControlTable, ControlValue};
use crate::engine::{self, CaptureEngine, CaptureStats, EngineSettings, FrameConsumer, Parked};
use crate::error::{CameraError, Result};
use crate::format::{ActualFormat, FormatRequest, FormatState, FrameRate, FrameSize, PixelFormat};
use crate::traits::{Backend, DeviceDescriptor, SensorInfo};

/// An open camera.
pub struct CameraHandle {
    descriptor: DeviceDescriptor,
    info: SensorInfo,
    registry: ControlRegistry,
    format: FormatState,
    sizes: BTreeMap<u32, Vec<FrameSize>>,
    rates: HashMap<FrameSize, Vec<FrameRate>>,
    backend: Option<Box<dyn Backend>>,
    consumer: Option<Box<dyn FrameConsumer>>,
    engine: CaptureEngine,
    config: CaptureConfig,
}

impl CameraHandle {
    /// Wrap an opened backend: read its controls and negotiate the full
    /// sensor window in the preferred pixel format.
    pub fn open(
        descriptor: DeviceDescriptor,
        mut backend: Box<dyn Backend>,
        config: CaptureConfig,
    ) -> Result<Self> {
        let info = backend.info().clone();
        let registry = ControlRegistry::from_descriptors(backend.query_controls()?);

        let mut values = Vec::with_capacity(registry.len());
        for control in registry.iter() {
            let value = match backend.get_control(control.id) {
                Ok(value) => ControlValue::new(control.clamp(value.value), value.auto),
                Err(err) => {
                    log::debug!("{}: no readback ({err}), using default", control.id);
                    ControlValue::manual(control.default)
                }
            };
            values.push((control.id, value));
        }

        let sizes: BTreeMap<u32, Vec<FrameSize>> = info
            .binning_factors
            .iter()
            .map(|bin| (*bin, backend.frame_sizes(*bin)))
            .collect();
        let rates = sizes
            .get(&1)
            .into_iter()
            .flatten()
            .map(|size| (*size, backend.frame_rates(*size)))
            .collect();

        let binning = values
            .iter()
            .find(|(id, _)| *id == ControlId::Binning)
            .and_then(|(_, v)| u32::try_from(v.value).ok())
            .filter(|bin| info.has_binning(*bin))
            .unwrap_or(1);
        let pixel_format = info
            .pixel_formats
            .first()
            .copied()
            .ok_or_else(|| CameraError::FormatRejected("no pixel format offered".to_owned()))?;
        let full = sizes
            .get(&binning)
            .and_then(|list| list.first().copied())
            .unwrap_or_else(|| {
                FrameSize::new(info.max_width / binning, info.max_height / binning)
            });
        let mut request = FormatRequest::new(full.width, full.height, pixel_format);
        request.binning = binning;
        let actual = backend.negotiate_format(&request)?;

        let buffer_bytes = info.max_frame_bytes().max(actual.frame_bytes());
        let pool = FramePool::new(config.buffer_count, buffer_bytes);
        let engine = CaptureEngine::new(pool, ControlTable::with_values(values), actual);
        log::info!(
            "opened {descriptor}: {} controls, {} {}",
            registry.len(),
            actual.size(),
            actual.pixel_format
        );

        Ok(Self {
            descriptor,
            info,
            registry,
            format: FormatState::negotiated(request, actual),
            sizes,
            rates,
            backend: Some(backend),
            consumer: None,
            engine,
            config,
        })
    }

    /// Descriptor this handle was opened from.
    pub const fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    /// Fixed sensor facts.
    pub const fn info(&self) -> &SensorInfo {
        &self.info
    }

    /// Camera name.
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Whether the sensor delivers colour.
    pub const fn is_colour(&self) -> bool {
        self.info.colour
    }

    /// Whether a binning factor is supported.
    pub fn has_binning(&self, factor: u32) -> bool {
        self.info.has_binning(factor)
    }

    /// Whether a 16-bit pixel format is available.
    pub fn has_16bit(&self) -> bool {
        self.info.has_16bit()
    }

    /// Whether `set_frame_interval` can work.
    pub const fn has_frame_rate_support(&self) -> bool {
        self.info.frame_rate_support
    }

    /// Offered controls.
    pub const fn controls(&self) -> &ControlRegistry {
        &self.registry
    }

    /// Whether a control is offered.
    pub fn has_control(&self, id: ControlId) -> bool {
        self.registry.has(id)
    }

    /// `(min, max, step, default)` of an offered control.
    pub fn control_range(&self, id: ControlId) -> Option<(i64, i64, i64, i64)> {
        self.registry.get(id).map(ControlDescriptor::range)
    }

    /// Frame sizes at the current binning factor, largest first.
    pub fn frame_sizes(&self) -> Vec<FrameSize> {
        self.frame_sizes_at(self.format.requested.binning)
    }

    /// Frame sizes at a binning factor, largest first.
    pub fn frame_sizes_at(&self, binning: u32) -> Vec<FrameSize> {
        self.sizes.get(&binning).cloned().unwrap_or_default()
    }

    /// Frame intervals available for a size at binning 1.
    pub fn frame_rates(&self, size: FrameSize) -> Vec<FrameRate> {
        self.rates.get(&size).cloned().unwrap_or_default()
    }

    /// Geometry the backend actually configured.
    pub const fn current_format(&self) -> ActualFormat {
        self.format.actual
    }

    /// Geometry last asked for (may be staged for the next start).
    pub const fn requested_format(&self) -> FormatRequest {
        self.format.requested
    }

    /// Pixel encoding of delivered frames.
    pub const fn pixel_format(&self) -> PixelFormat {
        self.format.actual.pixel_format
    }

    /// Whether the capture thread is delivering frames.
    pub fn is_started(&self) -> bool {
        self.engine.is_running()
    }

    /// Capture counters.
    pub fn stats(&self) -> CaptureStats {
        self.engine.stats()
    }

    /// Buffer ownership snapshot.
    pub fn pool_status(&self) -> PoolStatus {
        self.engine.pool_status()
    }

    /// Terminal error that stopped capture, if any.
    pub fn capture_error(&self) -> Option<CameraError> {
        self.engine.terminal_error()
    }

    /// Register the frame consumer. Replacing it while started takes effect
    /// on the next start.
    pub fn set_frame_consumer<C>(&mut self, consumer: C)
    where
        C: FrameConsumer + 'static,
    {
        self.consumer = Some(Box::new(consumer));
    }

    /// Last value applied to the hardware. A staged change shows up after the
    /// capture iteration that applies it.
    pub fn get_control(&self, id: ControlId) -> Result<ControlValue> {
        if !self.registry.has(id) {
            return Err(CameraError::UnsupportedControl(id));
        }
        self.engine
            .shared()
            .lock()
            .controls
            .applied(id)
            .ok_or(CameraError::UnsupportedControl(id))
    }

    /// Stage a control change. Out-of-range values are clamped.
    ///
    /// Binning is the exception: it is applied synchronously, restarting
    /// capture if it was running.
    pub fn set_control(&mut self, id: ControlId, value: ControlValue) -> Result<()> {
        if id == ControlId::Roi {
            return Err(CameraError::InvalidControl {
                id,
                reason: "use set_roi to change the region of interest".to_owned(),
            });
        }
        let value = self.registry.normalise(id, value)?;
        if id == ControlId::Binning {
            let factor = u32::try_from(value.value).unwrap_or(0);
            return self.set_binning(factor);
        }
        self.engine.shared().lock().controls.stage(id, value);
        log::debug!("staged {id}={} auto={}", value.value, value.auto);
        Ok(())
    }

    /// Select a centred capture window of `width` x `height` binned pixels.
    pub fn set_roi(&mut self, width: u32, height: u32) -> Result<()> {
        let bin = self.format.requested.binning;
        let (max_w, max_h) = (self.info.max_width / bin, self.info.max_height / bin);
        if width == 0 || height == 0 || width > max_w || height > max_h {
            return Err(CameraError::FormatRejected(format!(
                "window {width}x{height} outside {max_w}x{max_h}"
            )));
        }
        let mut request = self.format.requested;
        request.width = width;
        request.height = height;
        self.centre(&mut request);
        self.reconfigure(request)
    }

    /// Switch sample depth (8, 12 or 16 bits).
    pub fn set_bit_depth(&mut self, depth: u8) -> Result<()> {
        let pixel_format = self.info.pixel_format_for_bit_depth(depth).ok_or_else(|| {
            CameraError::FormatRejected(format!("{depth}-bit samples not supported"))
        })?;
        let mut request = self.format.requested;
        request.pixel_format = pixel_format;
        self.reconfigure(request)
    }

    /// Ask for a frame interval.
    pub fn set_frame_interval(&mut self, rate: FrameRate) -> Result<()> {
        if !self.info.frame_rate_support {
            return Err(CameraError::FormatRejected(
                "camera has no frame-rate control".to_owned(),
            ));
        }
        let mut request = self.format.requested;
        request.frame_rate = Some(rate);
        self.reconfigure(request)
    }

    /// Start delivering frames to the registered consumer. Starting an
    /// already started handle does nothing.
    pub fn start(&mut self) -> Result<()> {
        self.reap();
        if self.engine.is_running() {
            log::debug!("{}: already started", self.info.name);
            return Ok(());
        }
        if let Some(err) = self.engine.terminal_error() {
            return Err(err);
        }
        if self.consumer.is_none() {
            return Err(CameraError::NoConsumer);
        }

        if self.format.pending {
            self.negotiate(self.format.requested)?;
        }
        let dirty = self.engine.shared().lock().controls.take_dirty();
        let Some(backend) = self.backend.as_deref_mut() else {
            return Err(CameraError::NotAvailable("backend is owned by the capture thread"));
        };
        engine::flush_controls(backend, self.engine.shared(), dirty)?;
        backend.start()?;

        let (Some(backend), Some(consumer)) = (self.backend.take(), self.consumer.take()) else {
            return Err(CameraError::NotAvailable("backend or consumer missing"));
        };
        let settings = EngineSettings {
            name: self.info.name.clone(),
            timeout: self.config.frame_timeout(),
            temperature_interval: self.config.temperature_interval(),
        };
        self.engine.spawn(Parked { backend, consumer }, settings)?;
        log::info!(
            "{}: capture started at {} {}",
            self.info.name,
            self.format.actual.size(),
            self.format.actual.pixel_format
        );
        Ok(())
    }

    /// Stop capture and join the capture thread. Returns the terminal error
    /// if capture had already died.
    pub fn stop(&mut self) -> Result<()> {
        let was_running = self.halt()?;
        if was_running {
            log::info!("{}: capture stopped", self.info.name);
        }
        self.engine.terminal_error().map_or(Ok(()), Err)
    }

    /// Reconnect to the device, keeping configuration, and resume capture if
    /// it was running. A successful reset clears a stored terminal error.
    pub fn reset(&mut self) -> Result<()> {
        let was_running = self.halt()?;
        self.backend_mut()?.reset()?;
        self.engine.shared().lock().terminal = None;
        if was_running {
            self.start()?;
        }
        Ok(())
    }

    /// Sensor temperature in degrees Celsius, if reported.
    pub fn temperature(&mut self) -> Option<f32> {
        if self.engine.is_running() {
            return self.engine.shared().lock().temperature;
        }
        self.reap();
        self.backend.as_mut().and_then(|backend| backend.temperature())
    }

    fn backend_mut(&mut self) -> Result<&mut dyn Backend> {
        match self.backend.as_deref_mut() {
            Some(backend) => Ok(backend),
            None => Err(CameraError::NotAvailable("backend is owned by the capture thread")),
        }
    }

    /// Join the capture thread, if any, and take back backend and consumer.
    /// Returns whether the thread was still capturing.
    fn halt(&mut self) -> Result<bool> {
        let was_running = self.engine.is_running();
        if let Some(parked) = self.engine.join()? {
            self.backend = Some(parked.backend);
            if self.consumer.is_none() {
                self.consumer = Some(parked.consumer);
            }
        }
        Ok(was_running)
    }

    /// Collect a capture thread that ended on its own.
    fn reap(&mut self) {
        if self.engine.has_worker() && !self.engine.is_running() {
            if let Err(err) = self.halt() {
                log::error!("{}: {err}", self.info.name);
            }
        }
    }

    fn centre(&self, request: &mut FormatRequest) {
        if !self.info.programmable_roi {
            return;
        }
        let bin = request.binning.max(1);
        let (max_w, max_h) = (self.info.max_width / bin, self.info.max_height / bin);
        request.origin_x = (max_w.saturating_sub(request.width) / 2) & !1;
        request.origin_y = (max_h.saturating_sub(request.height) / 2) & !1;
    }

    fn negotiate(&mut self, request: FormatRequest) -> Result<ActualFormat> {
        let actual = self.backend_mut()?.negotiate_format(&request)?;
        if actual.size() != request.size() {
            log::info!(
                "{}: asked for {}, camera chose {}",
                self.info.name,
                request.size(),
                actual.size()
            );
        }
        self.format = FormatState::negotiated(request, actual);
        let mut state = self.engine.shared().lock();
        state.format = actual;
        state.pool.ensure_capacity(actual.frame_bytes());
        Ok(actual)
    }

    /// Apply a geometry change now if capturing, otherwise stage it.
    fn reconfigure(&mut self, request: FormatRequest) -> Result<()> {
        self.reap();
        if !self.engine.is_running() {
            self.format.stage(request);
            log::debug!("{}: staged {} for next start", self.info.name, request.size());
            return Ok(());
        }
        let previous = self.format.requested;
        self.halt()?;
        let result = self
            .negotiate(request)
            .and_then(|_| self.backend_mut()?.reset());
        if result.is_err() {
            self.restore(previous);
        }
        self.resume(true, result)
    }

    fn set_binning(&mut self, factor: u32) -> Result<()> {
        if !self.info.has_binning(factor) {
            return Err(CameraError::InvalidControl {
                id: ControlId::Binning,
                reason: format!("binning {factor} not supported"),
            });
        }
        self.reap();
        let previous = self.format.requested;
        let was_running = self.halt()?;

        let result = self.write_binning(factor).and_then(|()| {
            let full = self
                .frame_sizes_at(factor)
                .first()
                .copied()
                .unwrap_or_else(|| {
                    FrameSize::new(self.info.max_width / factor, self.info.max_height / factor)
                });
            let mut request = self.format.requested;
            request.binning = factor;
            request.width = full.width;
            request.height = full.height;
            self.centre(&mut request);
            self.negotiate(request)?;
            self.backend_mut()?.reset()
        });
        match &result {
            Ok(()) => log::debug!("{}: binning {factor} applied", self.info.name),
            Err(_) => {
                if let Err(err) = self.write_binning(previous.binning) {
                    log::warn!("{}: binning {} not restored: {err}", self.info.name, previous.binning);
                }
                self.restore(previous);
            }
        }
        self.resume(was_running, result)
    }

    fn write_binning(&mut self, factor: u32) -> Result<()> {
        let value = ControlValue::manual(i64::from(factor));
        let backend = self.backend_mut()?;
        backend.set_control(ControlId::Binning, value)?;
        backend.commit_controls()?;
        self.engine
            .shared()
            .lock()
            .controls
            .record_applied(ControlId::Binning, value);
        Ok(())
    }

    /// Put back the geometry that was active before a failed change.
    fn restore(&mut self, previous: FormatRequest) {
        let restored = self
            .negotiate(previous)
            .and_then(|_| self.backend_mut()?.reset());
        match restored {
            Ok(()) => log::info!("{}: kept {}", self.info.name, previous.size()),
            Err(err) => log::warn!(
                "{}: could not restore {}: {err}",
                self.info.name,
                previous.size()
            ),
        }
    }

    /// Restart capture if it was running before a geometry change. A failed
    /// change still restarts, then reports its own error.
    fn resume(&mut self, was_running: bool, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) if was_running => self.start(),
            Ok(()) => Ok(()),
            Err(err) => {
                if was_running {
                    if let Err(restart) = self.start() {
                        log::error!("{}: capture not resumed: {restart}", self.info.name);
                    }
                }
                Err(err)
            }
        }
    }
}

impl Drop for CameraHandle {
    fn drop(&mut self) {
        if let Err(err) = self.halt() {
            log::error!("{}: {err}", self.info.name);
        }
    }
}
