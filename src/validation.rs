//! Frame validation for test-pattern captures.
//!
//! Used by the integration tests against virtual cameras and by the CLI's
//! `--check` option. Bars are compared relative to the frame's own white and
//! black levels, so full-range, limited-range and 75% bars all pass.

use crate::error::{CameraError, Result};
use crate::traits::Frame;

/// Bar colours at full intensity, left to right:
/// white, yellow, cyan, green, magenta, red, blue, black.
const BAR_COLOURS: [(bool, bool, bool); 8] = [
    (true, true, true),
    (true, true, false),
    (false, true, true),
    (false, true, false),
    (true, false, true),
    (true, false, false),
    (false, false, true),
    (false, false, false),
];

/// Per-channel tolerance for bar colours.
const COLOR_TOLERANCE: u8 = 20;

/// Minimum left-to-right luminance rise for a gradient.
const MIN_GRADIENT_RISE: f32 = 50.0;

fn pixel(frame: &Frame, x: u32, y: u32) -> Result<(u8, u8, u8)> {
    frame.pixel_at(x, y).ok_or_else(|| {
        CameraError::TransientIo(format!(
            "pixel ({x}, {y}) outside {} frame of {} bytes",
            frame.format.size(),
            frame.data.len()
        ))
    })
}

/// Check that the frame holds all the bytes its format promises.
pub fn validate_frame_size(frame: &Frame) -> Result<()> {
    let expected = frame.format.frame_bytes();
    if frame.data.len() < expected {
        return Err(CameraError::TransientIo(format!(
            "short frame: {} of {expected} bytes",
            frame.data.len()
        )));
    }
    Ok(())
}

/// Check a colour frame for eight vertical colour bars.
///
/// Samples the centre of each bar on the middle row.
pub fn validate_color_bars(frame: &Frame) -> Result<()> {
    if !frame.format.pixel_format.is_colour() {
        return Err(CameraError::FormatRejected(format!(
            "colour bars need a colour format, got {}",
            frame.format.pixel_format
        )));
    }
    let bar_width = frame.format.width / 8;
    let centre_y = frame.format.height / 2;
    let sample_x = |bar: u32| bar * bar_width + bar_width / 2;

    let (white, _, _) = pixel(frame, sample_x(0), centre_y)?;
    let (black, _, _) = pixel(frame, sample_x(7), centre_y)?;
    if white <= black.saturating_add(COLOR_TOLERANCE) {
        return Err(CameraError::TransientIo(format!(
            "no contrast between white ({white}) and black ({black}) bars"
        )));
    }

    let level = |on: bool| if on { white } else { black };
    for (bar, (r, g, b)) in (0u32..).zip(BAR_COLOURS) {
        let x = sample_x(bar);
        let expected = (level(r), level(g), level(b));
        let actual = pixel(frame, x, centre_y)?;
        if !colors_match(actual, expected, COLOR_TOLERANCE) {
            return Err(CameraError::TransientIo(format!(
                "bar {bar} at ({x}, {centre_y}): expected RGB{expected:?}, got RGB{actual:?}"
            )));
        }
    }
    Ok(())
}

/// Check that luminance rises from left to right along the middle row.
pub fn validate_gradient(frame: &Frame) -> Result<()> {
    let centre_y = frame.format.height / 2;
    let mut first: Option<f32> = None;
    let mut prev: Option<f32> = None;

    for x in (0..frame.format.width).step_by(10) {
        let (r, g, b) = pixel(frame, x, centre_y)?;
        // Rec. 601 luma
        let luminance = 0.114f32.mul_add(
            f32::from(b),
            0.587f32.mul_add(f32::from(g), 0.299 * f32::from(r)),
        );
        if let Some(prev) = prev {
            if luminance < prev - 1.0 {
                return Err(CameraError::TransientIo(format!(
                    "gradient falls at x={x}: {luminance} < {prev}"
                )));
            }
        }
        first.get_or_insert(luminance);
        prev = Some(luminance);
    }

    if let (Some(first), Some(last)) = (first, prev) {
        if last - first < MIN_GRADIENT_RISE {
            return Err(CameraError::TransientIo(format!(
                "gradient rises only {} (need {MIN_GRADIENT_RISE})",
                last - first
            )));
        }
    }
    Ok(())
}

/// Check that sequence numbers increase by exactly one.
pub fn validate_frame_sequence(frames: &[Frame]) -> Result<()> {
    if frames.is_empty() {
        return Err(CameraError::TransientIo("no frames to check".to_owned()));
    }
    for (index, pair) in frames.windows(2).enumerate() {
        let [prev, curr] = pair else {
            continue;
        };
        let expected = prev.metadata.sequence.wrapping_add(1);
        if curr.metadata.sequence != expected {
            return Err(CameraError::TransientIo(format!(
                "sequence gap after frame {index}: expected {expected}, got {}",
                curr.metadata.sequence
            )));
        }
    }
    Ok(())
}

fn colors_match(actual: (u8, u8, u8), expected: (u8, u8, u8), tolerance: u8) -> bool {
    actual.0.abs_diff(expected.0) <= tolerance
        && actual.1.abs_diff(expected.1) <= tolerance
        && actual.2.abs_diff(expected.2) <= tolerance
}
