//! mmap-capture binary: capture frames and report timing.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use mmap_capture::validation::{validate_frame_sequence, validate_timestamps_monotonic, TimingStats};
use mmap_capture::{Camera, CaptureConfig, FrameRate, PixelDimension, PixelFormat};
use serde::de::{value, DeserializeOwned, IntoDeserializer};
use serde::Deserialize;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "mmap-capture")]
#[command(about = "Zero-copy V4L2 capture with driver/host timestamp reporting")]
#[command(version)]
struct Cli {
    /// TOML configuration file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Device node
    #[arg(short, long)]
    device: Option<PathBuf>,

    /// Pixel encoding (MJPEG, YUYV)
    #[arg(short, long, value_parser = parse_named::<PixelFormat>)]
    format: Option<PixelFormat>,

    /// Resolution (HD, FHD, 2K, 4K)
    #[arg(short, long, value_parser = parse_named::<PixelDimension>)]
    resolution: Option<PixelDimension>,

    /// Frame rate (15, 30, 60)
    #[arg(long)]
    fps: Option<u32>,

    /// Number of mapped buffers to request
    #[arg(short, long)]
    buffers: Option<u32>,

    /// Frames to capture
    #[arg(short = 'n', long, default_value_t = 100)]
    frames: usize,

    /// Ask the driver for start-of-exposure timestamps
    #[arg(long)]
    start_of_exposure: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Parse an enumeration by its configuration-file name.
fn parse_named<T: DeserializeOwned>(name: &str) -> std::result::Result<T, String> {
    let deserializer: value::StrDeserializer<'_, value::Error> = name.into_deserializer();
    T::deserialize(deserializer).map_err(|err| err.to_string())
}

impl Cli {
    fn capture_config(&self) -> Result<CaptureConfig> {
        let mut config = match &self.config {
            Some(path) => CaptureConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => CaptureConfig::default(),
        };
        if let Some(device) = &self.device {
            config.device_path.clone_from(device);
        }
        if let Some(format) = self.format {
            config.format = format;
        }
        if let Some(dimension) = self.resolution {
            config.dimension = dimension;
        }
        if let Some(fps) = self.fps {
            config.fps = FrameRate::try_from(fps)?;
        }
        if let Some(buffers) = self.buffers {
            config.buffer_count = buffers;
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("mmap_capture=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mmap_capture=info"))
    };
    fmt().with_env_filter(filter).with_target(false).init();

    if let Err(err) = run(&cli) {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = cli.capture_config()?;
    let mut camera = Camera::new(config);

    camera.open()?;
    println!("Device: {}", camera.capabilities().card);
    println!("Driver: {}", camera.capabilities().driver);
    println!("Bus:    {}", camera.capabilities().bus_info);

    if cli.start_of_exposure && !camera.try_start_of_exposure() {
        warn!("start-of-exposure timestamps not available, using driver default");
    }

    camera.configure()?;
    let config = camera.config();
    println!(
        "Format: {} {} @ {} fps, {} buffers",
        config.dimension, config.format, config.fps, config.buffer_count
    );

    camera.start()?;
    let mut records = Vec::with_capacity(cli.frames);
    for _ in 0..cli.frames {
        let frame = camera.capture()?;
        info!(
            sequence = frame.sequence,
            index = frame.index,
            bytes = frame.len(),
            driver_us = frame.driver_timestamp_us,
            offset_us = frame.host_offset_us(),
            "frame"
        );
        records.push(frame.record());
        camera.release()?;
    }
    camera.stop()?;
    camera.close();

    if records.is_empty() {
        return Ok(());
    }
    if let Err(err) = validate_frame_sequence(&records) {
        warn!(error = %err, "dropped frames");
    }
    if let Err(err) = validate_timestamps_monotonic(&records) {
        warn!(error = %err, "driver timestamps are not monotonic");
    }
    if let Some(stats) = TimingStats::from_records(&records) {
        println!(
            "Frames: {}  interval min/avg/max: {}/{:.0}/{} us  jitter: {} us  host offset: {:.0} us",
            stats.frames,
            stats.interval_min_us,
            stats.interval_avg_us,
            stats.interval_max_us,
            stats.jitter_us(),
            stats.mean_host_offset_us
        );
    }
    Ok(())
}
