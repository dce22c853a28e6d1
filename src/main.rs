//! astro-cam binary: list cameras, show their controls and capture frames.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use astro_cam::validation::{validate_color_bars, validate_frame_sequence, validate_gradient};
use astro_cam::{
    CameraError, CameraHandle, CameraSession, CaptureConfig, ConfigError, ControlId, ControlValue,
    Frame, FrameLease,
};
use clap::{Parser, Subcommand, ValueEnum};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Camera(#[from] CameraError),
    #[error("failed to install Ctrl-C handler: {0}")]
    Signal(#[from] ctrlc::Error),
    #[error("no camera at index {0} (run `astro-cam list`)")]
    NoSuchDevice(usize),
    #[error("control {0} not offered by this camera")]
    MissingControl(ControlId),
}

/// Astronomy camera capture tool
#[derive(Parser, Debug)]
#[command(name = "astro-cam")]
#[command(version, about = "Capture frames from V4L2 and USB astronomy cameras", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Config file path
    #[arg(long, short, global = true, env = "ASTRO_CAM_CONFIG")]
    config: Option<PathBuf>,

    /// More log output (-v debug, -vv trace)
    #[arg(long, short, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List attached cameras
    List,
    /// Show sensor facts, controls and frame sizes
    Info {
        /// Camera index from `list`
        #[arg(long, short, default_value = "0", env = "ASTRO_CAM_DEVICE")]
        device: usize,
    },
    /// Capture frames and print their metadata
    Capture {
        /// Camera index from `list`
        #[arg(long, short, default_value = "0", env = "ASTRO_CAM_DEVICE")]
        device: usize,

        /// Frames to capture before stopping
        #[arg(long, short, default_value = "10")]
        frames: usize,

        /// Centred window, WIDTHxHEIGHT in binned pixels
        #[arg(long, value_parser = parse_roi)]
        roi: Option<(u32, u32)>,

        /// Sample depth: 8, 12 or 16
        #[arg(long)]
        bit_depth: Option<u8>,

        /// Control to set, NAME=VALUE or NAME=VALUE:auto (repeatable)
        #[arg(long = "control", value_parser = parse_control)]
        controls: Vec<(ControlId, ControlValue)>,

        /// Check captured frames against a test pattern
        #[arg(long)]
        check: Option<Pattern>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Pattern {
    Bars,
    Gradient,
}

fn parse_roi(s: &str) -> Result<(u32, u32), String> {
    let (w, h) = s
        .split_once('x')
        .ok_or_else(|| format!("invalid window '{s}', use WIDTHxHEIGHT (e.g. 640x480)"))?;
    let width: u32 = w.parse().map_err(|_| format!("invalid width '{w}'"))?;
    let height: u32 = h.parse().map_err(|_| format!("invalid height '{h}'"))?;
    if width == 0 || height == 0 {
        return Err("window width and height must be greater than 0".to_owned());
    }
    Ok((width, height))
}

fn parse_control(s: &str) -> Result<(ControlId, ControlValue), String> {
    let (name, rest) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid control '{s}', use NAME=VALUE"))?;
    let id = ControlId::from_name(name).ok_or_else(|| {
        let names: Vec<&str> = ControlId::ALL.iter().map(|id| id.name()).collect();
        format!("unknown control '{name}', expected one of: {}", names.join(", "))
    })?;
    let (value, auto) = match rest.split_once(':') {
        Some((value, "auto")) => (value, true),
        Some((_, mode)) => return Err(format!("unknown mode '{mode}', expected 'auto'")),
        None => (rest, false),
    };
    let value: i64 = value
        .parse()
        .map_err(|_| format!("invalid value '{value}' for {name}"))?;
    Ok((id, ControlValue::new(value, auto)))
}

fn main() {
    let args = Args::parse();
    let level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if let Err(err) = run(args) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), CliError> {
    let config = match &args.config {
        Some(path) => CaptureConfig::load(path)?,
        None => CaptureConfig::default(),
    };
    let session = CameraSession::new(config);

    match args.command {
        Command::List => {
            let devices = session.enumerate();
            if devices.is_empty() {
                println!("No cameras found");
            }
            for (index, device) in devices.iter().enumerate() {
                println!("{index}: {device}");
            }
            Ok(())
        }
        Command::Info { device } => {
            let mut camera = open(&session, device)?;
            print_info(&mut camera);
            Ok(())
        }
        Command::Capture {
            device,
            frames,
            roi,
            bit_depth,
            controls,
            check,
        } => {
            let mut camera = open(&session, device)?;
            if let Some(depth) = bit_depth {
                camera.set_bit_depth(depth)?;
            }
            if let Some((width, height)) = roi {
                camera.set_roi(width, height)?;
            }
            for (id, value) in controls {
                if !camera.has_control(id) {
                    return Err(CliError::MissingControl(id));
                }
                camera.set_control(id, value)?;
            }
            capture(&mut camera, frames, check)
        }
    }
}

fn open(session: &CameraSession, index: usize) -> Result<CameraHandle, CliError> {
    let devices = session.enumerate();
    let descriptor = devices.get(index).ok_or(CliError::NoSuchDevice(index))?;
    Ok(session.open(descriptor)?)
}

fn print_info(camera: &mut CameraHandle) {
    let info = camera.info().clone();
    println!("Camera: {}", info.name);
    println!("Interface: {}", camera.descriptor().kind);
    let kind = if info.colour { "colour" } else { "mono" };
    println!("Sensor: {}x{} {kind}", info.max_width, info.max_height);
    println!("Binning: {:?}", info.binning_factors);
    let formats: Vec<String> = info.pixel_formats.iter().map(ToString::to_string).collect();
    println!("Formats: {}", formats.join(", "));
    println!("Format: {} {}", camera.current_format().size(), camera.pixel_format());
    if let Some(celsius) = camera.temperature() {
        println!("Temperature: {celsius:.1} C");
    }

    println!("Controls:");
    for descriptor in camera.controls().iter() {
        let current = camera
            .get_control(descriptor.id)
            .map(|v| format!("{}{}", v.value, if v.auto { " (auto)" } else { "" }))
            .unwrap_or_else(|err| err.to_string());
        println!(
            "  {:<13} [{}, {}] step {} default {} = {current}",
            descriptor.id.name(),
            descriptor.min,
            descriptor.max,
            descriptor.step,
            descriptor.default
        );
    }

    for &binning in &info.binning_factors {
        let sizes: Vec<String> = camera
            .frame_sizes_at(binning)
            .iter()
            .map(ToString::to_string)
            .collect();
        println!("Sizes (bin {binning}): {}", sizes.join(", "));
    }
    if camera.has_frame_rate_support() {
        if let Some(size) = camera.frame_sizes_at(1).first().copied() {
            let rates: Vec<String> = camera
                .frame_rates(size)
                .iter()
                .map(ToString::to_string)
                .collect();
            println!("Rates ({size}): {}", rates.join(", "));
        }
    }
}

fn capture(
    camera: &mut CameraHandle,
    count: usize,
    check: Option<Pattern>,
) -> Result<(), CliError> {
    ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::SeqCst))?;

    let (tx, rx) = mpsc::channel::<Frame>();
    camera.set_frame_consumer(move |lease: FrameLease| {
        // Copy out so the buffer goes straight back to the capture thread.
        let _ = tx.send(lease.to_frame());
    });
    camera.start()?;
    log::info!(
        "capturing {count} frame(s) at {} {}",
        camera.current_format().size(),
        camera.pixel_format()
    );

    let mut frames = Vec::with_capacity(count);
    while frames.len() < count && !INTERRUPTED.load(Ordering::SeqCst) {
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(frame) => {
                println!(
                    "Frame {}: {} bytes, timestamp: {:?}",
                    frame.metadata.sequence, frame.metadata.bytes_used, frame.metadata.timestamp
                );
                frames.push(frame);
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if let Some(err) = camera.capture_error() {
                    return Err(err.into());
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    camera.stop()?;

    let stats = camera.stats();
    println!(
        "Delivered {}, dropped {}, timeouts {}",
        stats.frames_delivered, stats.frames_dropped, stats.timeouts
    );

    if let Some(pattern) = check {
        for frame in &frames {
            match pattern {
                Pattern::Bars => validate_color_bars(frame)?,
                Pattern::Gradient => validate_gradient(frame)?,
            }
        }
        if frames.len() > 1 {
            validate_frame_sequence(&frames)?;
        }
        println!("Pattern check passed for {} frame(s)", frames.len());
    }
    Ok(())
}
