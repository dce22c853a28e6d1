//! Integration tests using the vivid virtual camera.
//!
//! These tests require:
//! - The `integration` feature flag: `cargo test --features integration`
//! - The vivid kernel module loaded with two instances:
//!   `sudo modprobe vivid n_devs=2 node_types=0x1,0x1`
//! - Access to /dev/video* devices (may require video group membership)
//!
//! Expected vivid configuration:
//! - First device: Gray Ramp pattern (`v4l2-ctl -d <dev> -c test_pattern=20`)
//! - Second device: 100% Colorbar pattern (`test_pattern=1`)
//!
//! Tests fail rather than skip when vivid is missing.

#![cfg(feature = "integration")]

use std::sync::mpsc;
use std::time::Duration;

use astro_cam::validation::{
    validate_color_bars, validate_frame_sequence, validate_frame_size, validate_gradient,
};
use astro_cam::{
    CameraHandle, CameraSession, CaptureConfig, ControlId, ControlValue, DeviceDescriptor, Frame,
    FrameLease, FrameSize, InterfaceKind,
};
use serial_test::serial;

const FRAME_WAIT: Duration = Duration::from_secs(5);

fn session() -> CameraSession {
    CameraSession::new(CaptureConfig::default())
}

/// Every vivid node found by the device-file driver, in index order.
fn find_vivid_devices(session: &CameraSession) -> Vec<DeviceDescriptor> {
    session
        .enumerate()
        .into_iter()
        .filter(|d| d.kind == InterfaceKind::DeviceFile)
        .filter(|d| d.name.to_lowercase().contains("vivid"))
        .collect()
}

/// Fail the test if vivid is not available; returns the first vivid node.
macro_rules! require_vivid {
    ($session:expr) => {
        find_vivid_devices(&$session).into_iter().next().expect(
            "vivid virtual camera not available.\n\
             Load vivid with: sudo modprobe vivid n_devs=2 node_types=0x1,0x1\n\
             Or run unit tests only: cargo test --lib",
        )
    };
}

/// Returns (gradient node, colour-bar node).
macro_rules! require_vivid_pair {
    ($session:expr) => {{
        let mut devices = find_vivid_devices(&$session).into_iter();
        match (devices.next(), devices.next()) {
            (Some(gradient), Some(bars)) => (gradient, bars),
            _ => unreachable!(
                "two vivid devices required.\n\
                 Load vivid with: sudo modprobe vivid n_devs=2 node_types=0x1,0x1"
            ),
        }
    }};
}

/// Start capture with a consumer that copies frames out to the test thread.
fn start_collecting(camera: &mut CameraHandle) -> mpsc::Receiver<Frame> {
    let (tx, rx) = mpsc::channel();
    camera.set_frame_consumer(move |lease: FrameLease| {
        let _ = tx.send(lease.to_frame());
    });
    camera.start().expect("Failed to start capture");
    rx
}

fn collect(rx: &mpsc::Receiver<Frame>, count: usize) -> Vec<Frame> {
    (0..count)
        .map(|_| rx.recv_timeout(FRAME_WAIT).expect("Timed out waiting for frame"))
        .collect()
}

#[test]
#[serial]
fn test_vivid_open() {
    let session = session();
    let descriptor = require_vivid!(session);
    let camera = session.open(&descriptor).expect("Failed to open vivid device");

    println!("Opened {descriptor}");
    println!("  Sensor: {}x{}", camera.info().max_width, camera.info().max_height);
    println!("  Format: {} {}", camera.current_format().size(), camera.pixel_format());

    assert!(camera.name().to_lowercase().contains("vivid"));
    assert!(!camera.frame_sizes().is_empty(), "vivid lists frame sizes");
    assert!(!camera.is_started());
}

#[test]
#[serial]
fn test_vivid_controls() {
    let session = session();
    let descriptor = require_vivid!(session);
    let mut camera = session.open(&descriptor).expect("Failed to open vivid device");

    for descriptor in camera.controls().iter() {
        let value = camera.get_control(descriptor.id).expect("Failed to read control");
        println!("  {} = {} [{}, {}]", descriptor.id, value.value, descriptor.min, descriptor.max);
        assert!(value.value >= descriptor.min && value.value <= descriptor.max);
    }

    assert!(camera.has_control(ControlId::Brightness), "vivid offers brightness");
    let (min, max, _, _) = camera
        .control_range(ControlId::Brightness)
        .expect("brightness range");
    let target = (min + max) / 2 + 1;
    camera
        .set_control(ControlId::Brightness, ControlValue::manual(target))
        .expect("Failed to stage brightness");

    let rx = start_collecting(&mut camera);
    collect(&rx, 1);
    assert_eq!(
        camera
            .get_control(ControlId::Brightness)
            .expect("brightness")
            .value,
        target
    );
    camera.stop().expect("Failed to stop");
}

#[test]
#[serial]
fn test_vivid_roi() {
    let session = session();
    let descriptor = require_vivid!(session);
    let mut camera = session.open(&descriptor).expect("Failed to open vivid device");

    camera.set_roi(640, 480).expect("Failed to set window");
    let rx = start_collecting(&mut camera);
    let frame = collect(&rx, 1).remove(0);
    camera.stop().expect("Failed to stop");

    println!("Requested 640x480, got {}", camera.current_format().size());
    assert_eq!(camera.current_format().size(), FrameSize::new(640, 480));
    assert_eq!(frame.format.size(), FrameSize::new(640, 480));
    validate_frame_size(&frame).expect("Frame should be complete");
}

#[test]
#[serial]
fn test_vivid_capture_multiple_frames() {
    let session = session();
    let descriptor = require_vivid!(session);
    let mut camera = session.open(&descriptor).expect("Failed to open vivid device");

    let rx = start_collecting(&mut camera);
    let frames = collect(&rx, 10);
    camera.stop().expect("Failed to stop");

    for frame in &frames {
        println!(
            "Frame seq={} ts={:?} bytes={}",
            frame.metadata.sequence, frame.metadata.timestamp, frame.metadata.bytes_used
        );
        validate_frame_size(frame).expect("Frame should be complete");
    }
    let result = validate_frame_sequence(&frames);
    assert!(result.is_ok(), "Frame sequence validation failed: {result:?}");

    let stats = camera.stats();
    assert!(stats.frames_delivered >= 10);
    assert!(camera.capture_error().is_none());
}

#[test]
#[serial]
fn test_vivid_restart() {
    let session = session();
    let descriptor = require_vivid!(session);
    let mut camera = session.open(&descriptor).expect("Failed to open vivid device");

    let rx = start_collecting(&mut camera);
    collect(&rx, 2);
    camera.stop().expect("Failed to stop");
    assert!(!camera.is_started());

    let rx = start_collecting(&mut camera);
    collect(&rx, 2);
    camera.stop().expect("Failed to stop after restart");
}

#[test]
#[serial]
fn test_vivid_gradient_pattern() {
    let session = session();
    let (gradient, _) = require_vivid_pair!(session);
    let mut camera = session.open(&gradient).expect("Failed to open gradient device");

    let rx = start_collecting(&mut camera);
    let frame = collect(&rx, 1).remove(0);
    camera.stop().expect("Failed to stop");

    let result = validate_gradient(&frame);
    assert!(
        result.is_ok(),
        "Gradient validation failed on first vivid device.\n\
         Expected Gray Ramp pattern (test_pattern=20).\n\
         Error: {result:?}"
    );
}

#[test]
#[serial]
fn test_vivid_colorbar_pattern() {
    let session = session();
    let (_, bars) = require_vivid_pair!(session);
    let mut camera = session.open(&bars).expect("Failed to open colour-bar device");
    assert!(camera.is_colour(), "vivid delivers RGB");

    let rx = start_collecting(&mut camera);
    let frame = collect(&rx, 1).remove(0);
    camera.stop().expect("Failed to stop");

    let result = validate_color_bars(&frame);
    assert!(
        result.is_ok(),
        "Color bars validation failed on second vivid device.\n\
         Expected 100% Colorbar pattern (test_pattern=1).\n\
         Error: {result:?}"
    );
}
