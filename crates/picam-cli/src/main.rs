use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use picam_core::{CcdChip, ExposureController, FrameType, Roi, StreamingWorker};
use picam_hw::sensor::list_sensors;
use picam_hw::{
    decode, pack, DecodedFrame, PipeCapture, RawBlock, SensorGeometry, SensorProfile,
};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod driver;
mod sinks;

use config::Config;
use driver::{spawn_driver, ControllerFactory, DriverError, DriverHandle, ExposeRequest};
use sinks::{save_png, FrameStats, LatestFrameSink};

#[derive(Parser)]
#[command(name = "picam", about = "Raw10 camera exposures and live streaming")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Take one timed exposure and save it as a 16-bit PNG
    Expose {
        /// Exposure length in seconds
        #[arg(short, long, default_value_t = 1.0)]
        duration: f64,
        /// light, bias, dark or flat
        #[arg(short = 't', long, default_value = "light")]
        frame_type: FrameType,
        /// Sub-frame as x,y,w,h in sensor pixels
        #[arg(long)]
        roi: Option<Roi>,
        /// Horizontal binning factor
        #[arg(long, default_value_t = 1)]
        bin_x: u32,
        /// Vertical binning factor
        #[arg(long, default_value_t = 1)]
        bin_y: u32,
        /// Output file (default: <output dir>/<frame type>-<timestamp>.png)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Stream live frames, keeping the latest on disk
    Stream {
        /// Stop after this many seconds (default: until Ctrl-C)
        #[arg(short, long)]
        seconds: Option<u64>,
        /// Target frames per second
        #[arg(long, default_value_t = 1.0)]
        fps: f64,
        /// Directory for latest.png; frames are only logged if unset
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    /// List the built-in sensor profiles
    Sensors,
    /// Decode a raw dump and print frame statistics
    Decode {
        /// File of concatenated raw blocks
        file: PathBuf,
        /// Zero-based block to decode
        #[arg(long, default_value_t = 0)]
        frame: usize,
        /// Also save the decoded frame as PNG
        #[arg(long)]
        png: Option<PathBuf>,
    },
    /// Write synthetic raw blocks to stdout, standing in for the camera
    Synth {
        /// Blocks per second
        #[arg(long, default_value_t = 1.0)]
        fps: f64,
        /// Stop after this many blocks (default: run forever)
        #[arg(long)]
        frames: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Commands::Expose {
            duration,
            frame_type,
            roi,
            bin_x,
            bin_y,
            output,
        } => {
            let profile = config.load_profile()?;
            let handle = start_driver(&config, &profile, 1.0, None)?;
            let request = ExposeRequest {
                duration,
                frame_type,
                roi,
                binning: (bin_x, bin_y),
            };

            let exposure = {
                let expose = handle.expose(request);
                tokio::pin!(expose);
                tokio::select! {
                    result = &mut expose => result,
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("interrupted; aborting exposure");
                        handle.abort().await?;
                        expose.await
                    }
                }
            };
            let exposure = match exposure {
                Err(DriverError::Aborted(reason)) => bail!("exposure aborted: {reason}"),
                other => other?,
            };

            let path = output.unwrap_or_else(|| {
                config.output_dir.join(format!(
                    "{}-{}.png",
                    exposure.frame_type,
                    exposure.started_at.format("%Y%m%dT%H%M%S")
                ))
            });
            save_png(&path, exposure.width, exposure.height, &exposure.pixels)?;

            let mut summary = serde_json::to_value(&exposure)?;
            summary["path"] = serde_json::json!(path);
            summary["stats"] = serde_json::json!(FrameStats::of(&exposure.pixels));
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Stream {
            seconds,
            fps,
            output_dir,
        } => {
            if let Some(dir) = &output_dir {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("cannot create {}", dir.display()))?;
            }
            let profile = config.load_profile()?;
            let handle = start_driver(&config, &profile, fps, output_dir.as_deref())?;
            handle.start_streaming().await?;

            match seconds {
                Some(secs) => {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                        _ = tokio::signal::ctrl_c() => {}
                    }
                }
                None => tokio::signal::ctrl_c().await?,
            }

            handle.stop_streaming().await?;
            let status = handle.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Sensors => {
            println!("{}", serde_json::to_string_pretty(list_sensors())?);
        }
        Commands::Decode { file, frame, png } => {
            let profile = config.load_profile()?;
            let geometry = profile.geometry();
            let data =
                std::fs::read(&file).with_context(|| format!("cannot read {}", file.display()))?;

            let block_size = geometry.raw_block_size();
            let blocks = data.len() / block_size;
            let block = block_offset(frame, block_size)
                .and_then(|start| data.get(start..))
                .map(|tail| RawBlock::from_bytes(geometry, tail))
                .filter(RawBlock::is_complete);
            let Some(block) = block else {
                bail!(
                    "{} holds {blocks} complete {} block(s); frame {frame} requested",
                    file.display(),
                    profile.name()
                );
            };
            let decoded = decode(block.as_bytes(), geometry)?;

            if let Some(path) = &png {
                save_png(path, decoded.width, decoded.height, &decoded.pixels)?;
            }
            let report = serde_json::json!({
                "sensor": profile.name(),
                "width": decoded.width,
                "height": decoded.height,
                "block_size": block_size,
                "blocks": blocks,
                "trailing_bytes": data.len() % block_size,
                "frame": frame,
                "stats": FrameStats::of(&decoded.pixels),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Synth { fps, frames } => {
            let profile = config.load_profile()?;
            run_synth(profile.geometry(), fps, frames).await?;
        }
    }

    Ok(())
}

/// Build both capture sessions and hand them to the driver thread.
fn start_driver(
    config: &Config,
    profile: &SensorProfile,
    fps: f64,
    stream_dir: Option<&std::path::Path>,
) -> Result<DriverHandle> {
    let geometry = profile.geometry();
    tracing::info!(
        sensor = profile.name(),
        width = geometry.width,
        height = geometry.height,
        block = geometry.raw_block_size(),
        "sensor profile loaded"
    );

    let command = profile.capture.command.clone();
    let chip = CcdChip::new(profile);
    let exposure_config = config.exposure_config();
    let build: ControllerFactory<PipeCapture> = Box::new(move |sink| {
        ExposureController::new(
            PipeCapture::new(command),
            geometry,
            chip,
            sink,
            exposure_config,
        )
    });

    let worker = StreamingWorker::spawn(
        PipeCapture::new(profile.capture.command.clone()),
        geometry,
        LatestFrameSink::new(fps, stream_dir),
    )?;

    Ok(spawn_driver(
        build,
        worker,
        profile.capture.init_command.as_deref(),
    )?)
}

/// Byte offset of block `frame`, `None` if it cannot be addressed.
fn block_offset(frame: usize, block_size: usize) -> Option<usize> {
    frame
        .checked_mul(block_size)
        .filter(|start| start.checked_add(block_size).is_some())
}

/// Horizontal ramp covering the full 10-bit range, left-justified.
fn synth_frame(geometry: SensorGeometry) -> DecodedFrame {
    let mut frame = DecodedFrame::new(geometry);
    let span = geometry.width.saturating_sub(1).max(1);
    for row in frame.pixels.chunks_exact_mut(geometry.width as usize) {
        for (x, px) in row.iter_mut().enumerate() {
            *px = ((x as u32 * 1023 / span) as u16) << 6;
        }
    }
    frame
}

async fn run_synth(geometry: SensorGeometry, fps: f64, frames: Option<u64>) -> Result<()> {
    if !(fps.is_finite() && fps > 0.0) {
        bail!("--fps must be positive");
    }
    let block = pack(&synth_frame(geometry), geometry)?;
    let mut ticker = tokio::time::interval(Duration::from_secs_f64(1.0 / fps));
    let mut stdout = std::io::stdout().lock();
    let mut written = 0u64;

    while frames.map_or(true, |n| written < n) {
        ticker.tick().await;
        match stdout.write_all(&block).and_then(|()| stdout.flush()) {
            Ok(()) => written += 1,
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                tracing::info!(written, "reader closed the pipe");
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synth_frame_round_trips_through_codec() {
        let geometry = SensorGeometry::new(8, 2, 4);
        let frame = synth_frame(geometry);
        assert_eq!(frame.get(0, 0), Some(0));
        assert_eq!(frame.get(7, 1), Some(1023 << 6));

        let raw = pack(&frame, geometry).unwrap();
        assert_eq!(raw.len(), geometry.raw_block_size());
        assert_eq!(decode(&raw, geometry).unwrap(), frame);
    }

    #[test]
    fn test_block_offset_rejects_overflow() {
        assert_eq!(block_offset(3, 36), Some(108));
        assert_eq!(block_offset(usize::MAX, 36), None);
        assert_eq!(block_offset(usize::MAX / 36, 36), None);
    }

    #[test]
    fn test_cli_parses_expose() {
        let cli = Cli::try_parse_from([
            "picam", "expose", "-d", "2.5", "-t", "dark", "--roi", "0,0,64,32", "--bin-x", "2",
        ])
        .unwrap();
        match cli.command {
            Commands::Expose {
                duration,
                frame_type,
                roi,
                bin_x,
                bin_y,
                ..
            } => {
                assert_eq!(duration, 2.5);
                assert_eq!(frame_type, FrameType::Dark);
                assert_eq!(roi, Some(Roi::new(0, 0, 64, 32)));
                assert_eq!((bin_x, bin_y), (2, 1));
            }
            _ => panic!("expected expose"),
        }
    }
}
