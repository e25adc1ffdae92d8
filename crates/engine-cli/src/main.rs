//! engine-play: decode a file and play it through the audio engine.
//!
//! ## Pipeline
//! 1. **Decode**: a background thread pulls PCM from the Symphonia decoder into the ring buffer.
//! 2. **Graph**: the CPAL callback pulls the ring buffer through the peak limiter.
//! 3. **Control**: the main thread logs status until the track drains or Ctrl-C.

mod cli;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use audio_engine::decode::{Region, RepeatCount, SymphoniaKind};
use audio_engine::{CpalOutput, DecoderRegistry, EngineConfig, Player, device};
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,audio_engine=info")
        }))
        .init();

    let config = resolve_config(&args)?;
    let registry = DecoderRegistry::builder()
        .register(SymphoniaKind)
        .auto_open(config.auto_open_decoders)
        .build();

    match &args.cmd {
        cli::Command::Devices => {
            for (i, name) in device::list_devices()?.iter().enumerate() {
                println!("#{i}: {name}");
            }
        }
        cli::Command::Formats => {
            println!("extensions: {}", registry.supported_file_extensions().join(", "));
            println!("mime types: {}", registry.supported_mime_types().join(", "));
        }
        cli::Command::Play {
            path,
            mime,
            start,
            frames,
            repeat,
            forever,
            status_interval,
            json,
        } => {
            let region = start.map(|start| {
                let region = match frames {
                    Some(n) => Region::new(start, *n),
                    None => Region::starting_at(start),
                };
                let repeat = if *forever {
                    RepeatCount::Forever
                } else {
                    RepeatCount::Times(repeat.unwrap_or(0))
                };
                region.repeating(repeat)
            });
            let decoder = match region {
                Some(region) => {
                    registry.create_decoder_for_url_region(path, region, mime.as_deref())
                }
                None => registry.create_decoder_for_url(path, mime.as_deref()),
            }
            .with_context(|| format!("open {path}"))?;

            let output = CpalOutput::new(config.device.as_deref()).context("open output device")?;
            let mut player = Player::new(Box::new(output), &config)?;
            player.play_decoder(decoder)?;
            player.play()?;

            let interrupted = Arc::new(AtomicBool::new(false));
            let flag = interrupted.clone();
            ctrlc::set_handler(move || flag.store(true, Ordering::Relaxed))
                .context("install Ctrl-C handler")?;

            let interval = Duration::from_secs_f32(status_interval.max(0.1));
            run_until_done(&player, &interrupted, interval);

            if !interrupted.load(Ordering::Relaxed) {
                // Let the limiter release before the stream stops.
                thread::sleep(Duration::from_secs_f64(player.graph_tail_time()));
            }
            player.stop()?;

            let status = player.status();
            if *json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            }
            tracing::info!(
                frames = status.frames_rendered,
                underruns = status.underrun_events,
                decode_failed = status.decode_failed,
                interrupted = interrupted.load(Ordering::Relaxed),
                "playback ended"
            );
        }
    }
    Ok(())
}

fn resolve_config(args: &cli::Args) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(device) = &args.device {
        config.device = Some(device.clone());
    }
    if let Some(frames) = args.ring_buffer_frames {
        config.ring_buffer_frames = frames;
    }
    if let Some(frames) = args.decode_chunk_frames {
        config.decode_chunk_frames = frames;
    }
    if let Some(volume) = args.volume {
        config.volume = volume;
    }
    if let Some(db) = args.pre_gain {
        config.pre_gain_db = Some(db);
    }
    config.validate().context("invalid engine config")?;
    Ok(config)
}

fn run_until_done(player: &Player, interrupted: &AtomicBool, interval: Duration) {
    let mut last_report = Instant::now();
    while !interrupted.load(Ordering::Relaxed) && !player.is_finished() {
        thread::sleep(Duration::from_millis(50));
        if last_report.elapsed() >= interval {
            last_report = Instant::now();
            let status = player.status();
            tracing::info!(
                elapsed_ms = status.elapsed_ms.unwrap_or(0),
                duration_ms = ?status.duration_ms,
                buffered = status.buffered_frames,
                underruns = status.underrun_events,
                "playing"
            );
        }
    }
}
