//! Pixel formats, frame geometry and the negotiated format state.

use std::fmt;
use std::time::Duration;

/// Four-character pixel format code as used by video-capture drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// 8-bit greyscale.
    pub const GREY: Self = Self::new(b"GREY");
    /// 16-bit greyscale, little-endian.
    pub const Y16: Self = Self::new(b"Y16 ");
    /// 16-bit greyscale, big-endian (driver sets the high bit of the last byte).
    pub const Y16_BE: Self = Self([b'Y', b'1', b'6', b' ' | 0x80]);
    /// 24-bit packed RGB.
    pub const RGB3: Self = Self::new(b"RGB3");
    /// 24-bit packed BGR.
    pub const BGR3: Self = Self::new(b"BGR3");
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            let c = byte & 0x7f;
            if c.is_ascii_graphic() || c == b' ' {
                write!(f, "{}", char::from(c))?;
            } else {
                write!(f, "\\x{byte:02x}")?;
            }
        }
        if self.0[3] & 0x80 != 0 {
            write!(f, "-BE")?;
        }
        Ok(())
    }
}

/// Frame pixel encoding delivered to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 8-bit greyscale.
    Grey8,
    /// 16-bit greyscale, little-endian.
    Grey16Le,
    /// 16-bit greyscale, big-endian.
    Grey16Be,
    /// 24-bit RGB, R first.
    Rgb24,
    /// 24-bit BGR, B first.
    Bgr24,
}

impl PixelFormat {
    /// All formats, in the order device-file backends prefer them.
    pub const ALL: [Self; 5] = [
        Self::Rgb24,
        Self::Bgr24,
        Self::Grey8,
        Self::Grey16Le,
        Self::Grey16Be,
    ];

    /// Bytes per pixel.
    pub const fn bytes_per_pixel(self) -> u32 {
        match self {
            Self::Grey8 => 1,
            Self::Grey16Le | Self::Grey16Be => 2,
            Self::Rgb24 | Self::Bgr24 => 3,
        }
    }

    /// Significant bits per pixel sample.
    pub const fn bit_depth(self) -> u8 {
        match self {
            Self::Grey16Le | Self::Grey16Be => 16,
            Self::Grey8 | Self::Rgb24 | Self::Bgr24 => 8,
        }
    }

    /// Whether the format carries colour.
    pub const fn is_colour(self) -> bool {
        matches!(self, Self::Rgb24 | Self::Bgr24)
    }

    /// Driver code for this format.
    pub const fn fourcc(self) -> FourCC {
        match self {
            Self::Grey8 => FourCC::GREY,
            Self::Grey16Le => FourCC::Y16,
            Self::Grey16Be => FourCC::Y16_BE,
            Self::Rgb24 => FourCC::RGB3,
            Self::Bgr24 => FourCC::BGR3,
        }
    }

    /// Reverse of [`PixelFormat::fourcc`].
    pub fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        Self::ALL.into_iter().find(|format| format.fourcc() == fourcc)
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Grey8 => "GREY8",
            Self::Grey16Le => "GREY16LE",
            Self::Grey16Be => "GREY16BE",
            Self::Rgb24 => "RGB24",
            Self::Bgr24 => "BGR24",
        };
        f.write_str(name)
    }
}

/// Frame dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameSize {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl FrameSize {
    /// Create a frame size.
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Pixel count.
    pub const fn area(self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl fmt::Display for FrameSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Frame interval as a fraction of a second (1/30 means 30 frames per second).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameRate {
    /// Numerator of the interval.
    pub numerator: u32,
    /// Denominator of the interval.
    pub denominator: u32,
}

impl FrameRate {
    /// Create a frame interval.
    pub const fn new(numerator: u32, denominator: u32) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    /// Duration of one frame, `None` for a zero denominator.
    pub fn interval(self) -> Option<Duration> {
        if self.denominator == 0 {
            return None;
        }
        let micros = u64::from(self.numerator) * 1_000_000 / u64::from(self.denominator);
        Some(Duration::from_micros(micros))
    }
}

impl fmt::Display for FrameRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}s", self.numerator, self.denominator)
    }
}

/// What the camera handle asks a backend to negotiate.
///
/// Device-file backends need the full capture size on every negotiate and
/// ignore the origin; direct-register backends program the origin and window
/// size into the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatRequest {
    /// Requested width after binning.
    pub width: u32,
    /// Requested height after binning.
    pub height: u32,
    /// Binning factor (1 = none).
    pub binning: u32,
    /// Requested pixel encoding.
    pub pixel_format: PixelFormat,
    /// ROI start column, in binned pixels.
    pub origin_x: u32,
    /// ROI start row, in binned pixels.
    pub origin_y: u32,
    /// Requested frame interval, if any.
    pub frame_rate: Option<FrameRate>,
}

impl FormatRequest {
    /// Request a full window of the given size.
    pub const fn new(width: u32, height: u32, pixel_format: PixelFormat) -> Self {
        Self {
            width,
            height,
            binning: 1,
            pixel_format,
            origin_x: 0,
            origin_y: 0,
            frame_rate: None,
        }
    }

    /// Requested size.
    pub const fn size(&self) -> FrameSize {
        FrameSize::new(self.width, self.height)
    }
}

/// What the backend actually configured. May differ from the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActualFormat {
    /// Negotiated width.
    pub width: u32,
    /// Negotiated height.
    pub height: u32,
    /// Binning factor in effect.
    pub binning: u32,
    /// Pixel encoding in effect.
    pub pixel_format: PixelFormat,
    /// ROI start column.
    pub origin_x: u32,
    /// ROI start row.
    pub origin_y: u32,
    /// Bytes per line.
    pub stride: u32,
}

impl ActualFormat {
    /// Build an actual format with a tightly packed stride.
    pub const fn packed(request: &FormatRequest, width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            binning: request.binning,
            pixel_format: request.pixel_format,
            origin_x: request.origin_x,
            origin_y: request.origin_y,
            stride: width * request.pixel_format.bytes_per_pixel(),
        }
    }

    /// Negotiated size.
    pub const fn size(&self) -> FrameSize {
        FrameSize::new(self.width, self.height)
    }

    /// Bytes needed for one frame.
    pub const fn frame_bytes(&self) -> usize {
        self.stride as usize * self.height as usize
    }
}

/// Geometry owned by the camera handle: the last request, what the backend
/// made of it, and whether a staged request still has to be negotiated.
#[derive(Debug, Clone, Copy)]
pub struct FormatState {
    /// Last requested geometry.
    pub requested: FormatRequest,
    /// Geometry the backend reported back.
    pub actual: ActualFormat,
    /// A request was staged while stopped and is applied on the next start.
    pub pending: bool,
}

impl FormatState {
    /// Record a freshly negotiated format.
    pub const fn negotiated(requested: FormatRequest, actual: ActualFormat) -> Self {
        Self {
            requested,
            actual,
            pending: false,
        }
    }

    /// Stage a new request for the next start.
    pub fn stage(&mut self, requested: FormatRequest) {
        self.requested = requested;
        self.pending = true;
    }
}

/// Deadline for a single `read_frame`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameTimeout {
    /// Block until a frame arrives.
    Infinite,
    /// Return immediately if no frame is ready.
    NonBlocking,
    /// Wait at most this long.
    After(Duration),
}

impl FrameTimeout {
    /// Interpret a millisecond count: `-1` (or any negative) is infinite, `0`
    /// is non-blocking.
    pub fn from_millis(ms: i64) -> Self {
        match ms {
            0 => Self::NonBlocking,
            ms if ms < 0 => Self::Infinite,
            ms => Self::After(Duration::from_millis(ms.unsigned_abs())),
        }
    }

    /// Stretch a finite timeout so that a long exposure cannot time out.
    #[must_use]
    pub fn for_exposure(self, exposure_us: Option<i64>) -> Self {
        match (self, exposure_us) {
            (Self::After(base), Some(us)) if us > 0 => {
                let exposure = Duration::from_micros(us.unsigned_abs().saturating_mul(2));
                Self::After(base.max(exposure))
            }
            (timeout, _) => timeout,
        }
    }

    /// Finite deadline, if any.
    pub const fn duration(self) -> Option<Duration> {
        match self {
            Self::Infinite => None,
            Self::NonBlocking => Some(Duration::ZERO),
            Self::After(d) => Some(d),
        }
    }
}
