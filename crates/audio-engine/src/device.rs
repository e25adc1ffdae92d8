//! CPAL output backend.
//!
//! - selects either the default device or a device by substring match
//! - negotiates a device config at exactly the client sample rate (no resampling)
//! - pulls the render chain from the CPAL callback, mapping channels
//!   (mono↔stereo, best-effort otherwise) and converting to the device sample format

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tracing::{debug, info, warn};

use crate::error::GraphError;
use crate::format::AudioFormat;
use crate::graph::{OutputBackend, RenderChain};

/// Pick the first output device whose name contains `needle` (case-insensitive),
/// or the host default device.
pub fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    if let Some(needle) = needle {
        let mut devices = host.output_devices().context("No output devices")?;
        return devices
            .find(|d| {
                d.description()
                    .map(|n| matches_device_name(&n.name(), needle))
                    .unwrap_or(false)
            })
            .ok_or_else(|| anyhow!("No output device matched: {needle}"));
    }

    host.default_output_device()
        .ok_or_else(|| anyhow!("No default output device"))
}

/// Choose the best output config for a target sample rate.
///
/// Prefers the highest supported rate that is <= `target_rate`, then the
/// lowest rate above it; among equal rates, float formats win.
pub fn pick_output_config(
    device: &cpal::Device,
    target_rate: Option<u32>,
) -> Result<cpal::SupportedStreamConfig> {
    let mut best: Option<(bool, u32, u8, cpal::SupportedStreamConfig)> = None;

    for range in device.supported_output_configs()? {
        let rate = pick_rate_for_range(range.min_sample_rate(), range.max_sample_rate(), target_rate);
        let below = target_rate.map(|t| rate <= t).unwrap_or(true);
        let format_rank = sample_format_rank(range.sample_format());
        let replace = match &best {
            None => true,
            Some((b_below, b_rate, b_rank, _)) => {
                is_better_candidate(below, rate, format_rank, *b_below, *b_rate, *b_rank)
            }
        };
        if replace {
            best = Some((below, rate, format_rank, range.with_sample_rate(rate)));
        }
    }

    best.map(|(_, _, _, cfg)| cfg)
        .ok_or_else(|| anyhow!("No supported output configs"))
}

/// Names of the default host's output devices.
pub fn list_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices = host.output_devices().context("No output devices")?;
    let mut names = Vec::new();
    for d in devices {
        names.push(d.description()?.name().to_string());
    }
    Ok(names)
}

fn pick_rate_for_range(min: u32, max: u32, target_rate: Option<u32>) -> u32 {
    match target_rate {
        Some(target) => target.clamp(min, max.max(min)),
        None => max,
    }
}

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::F32 => 0,
        cpal::SampleFormat::I32 => 1,
        cpal::SampleFormat::I16 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => 10,
    }
}

fn is_better_candidate(
    below: bool,
    rate: u32,
    format_rank: u8,
    best_below: bool,
    best_rate: u32,
    best_rank: u8,
) -> bool {
    if below != best_below {
        below && !best_below
    } else if rate != best_rate {
        rate > best_rate
    } else {
        format_rank < best_rank
    }
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() {
        return false;
    }
    name.to_lowercase().contains(&needle.to_lowercase())
}

/// Output sample for `dst_ch` given a reader over the source frame.
///
/// - mono → stereo: duplicate channel 0
/// - stereo → mono: average L/R
/// - other layouts: clamp to the available channels
fn map_channel(
    src: impl Fn(usize) -> f32,
    src_channels: usize,
    dst_channels: usize,
    dst_ch: usize,
) -> f32 {
    match (src_channels, dst_channels) {
        (2, 1) => 0.5 * (src(0) + src(1)),
        (1, _) => src(0),
        _ => src(dst_ch.min(src_channels.saturating_sub(1))),
    }
}

/// [`OutputBackend`] driving a CPAL output stream.
pub struct CpalOutput {
    device: cpal::Device,
    device_name: String,
    client_format: Option<AudioFormat>,
    config: Option<cpal::SupportedStreamConfig>,
    stream: Option<cpal::Stream>,
    volume: Arc<AtomicU32>,
}

impl CpalOutput {
    /// Open the default host's device matching `needle`, or its default output.
    pub fn new(needle: Option<&str>) -> Result<Self, GraphError> {
        let host = cpal::default_host();
        let device = pick_device(&host, needle)
            .map_err(|e| GraphError::hardware("open", format!("{e:#}")))?;
        Ok(Self::with_device(device))
    }

    pub fn with_device(device: cpal::Device) -> Self {
        let device_name = device
            .description()
            .map(|d| d.name().to_string())
            .unwrap_or_else(|_| "unknown device".to_string());
        info!(device = %device_name, "output device selected");
        Self {
            device,
            device_name,
            client_format: None,
            config: None,
            stream: None,
            volume: Arc::new(AtomicU32::new(1f32.to_bits())),
        }
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Device-side config negotiated by the last client format change.
    pub fn stream_config(&self) -> Option<&cpal::SupportedStreamConfig> {
        self.config.as_ref()
    }

    fn build_stream<T>(
        &self,
        config: &cpal::StreamConfig,
        mut chain: RenderChain,
    ) -> Result<cpal::Stream, cpal::BuildStreamError>
    where
        T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
    {
        let channels_out = config.channels as usize;
        let src_channels = chain.format().channels() as usize;
        let volume = self.volume.clone();
        let err_fn = |err| warn!("stream error: {err}");

        self.device.build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let frames = data.len() / channels_out;
                let gain = f32::from_bits(volume.load(Ordering::Relaxed));
                let mut done = 0usize;
                while done < frames {
                    let (n, _) = chain.render((frames - done) as u32);
                    for f in 0..n as usize {
                        let base = (done + f) * channels_out;
                        for ch in 0..channels_out {
                            let s = map_channel(|c| chain.sample(f, c), src_channels, channels_out, ch);
                            data[base + ch] = <T as cpal::Sample>::from_sample::<f32>(s * gain);
                        }
                    }
                    done += n as usize;
                }
            },
            err_fn,
            None,
        )
    }
}

impl OutputBackend for CpalOutput {
    fn name(&self) -> &str {
        &self.device_name
    }

    fn set_client_format(&mut self, format: &AudioFormat) -> Result<(), GraphError> {
        if self.stream.is_some() {
            return Err(GraphError::hardware("set_client_format", "stream is running"));
        }
        let rate = format.sample_rate().round() as u32;
        let config = pick_output_config(&self.device, Some(rate))
            .map_err(|e| GraphError::hardware("set_client_format", format!("{e:#}")))?;
        if config.sample_rate() != rate {
            return Err(GraphError::hardware(
                "set_client_format",
                format!("{} does not support {rate} Hz", self.device_name),
            ));
        }
        debug!(
            device = %self.device_name,
            rate_hz = rate,
            sample_format = ?config.sample_format(),
            "client format accepted"
        );
        self.client_format = Some(*format);
        self.config = Some(config);
        Ok(())
    }

    fn client_format(&self) -> Option<AudioFormat> {
        self.client_format
    }

    fn start(&mut self, chain: RenderChain) -> Result<(), GraphError> {
        let supported = self
            .config
            .clone()
            .ok_or_else(|| GraphError::hardware("start", "no client format"))?;
        let config = supported.config();
        let built = match supported.sample_format() {
            cpal::SampleFormat::F32 => self.build_stream::<f32>(&config, chain),
            cpal::SampleFormat::I16 => self.build_stream::<i16>(&config, chain),
            cpal::SampleFormat::I32 => self.build_stream::<i32>(&config, chain),
            cpal::SampleFormat::U16 => self.build_stream::<u16>(&config, chain),
            other => {
                return Err(GraphError::hardware(
                    "start",
                    format!("unsupported sample format: {other:?}"),
                ));
            }
        };
        let stream = built.map_err(|e| GraphError::hardware("start", e))?;
        stream.play().map_err(|e| GraphError::hardware("start", e))?;
        info!(
            device = %self.device_name,
            rate_hz = config.sample_rate,
            channels = config.channels,
            "output stream started"
        );
        self.stream = Some(stream);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), GraphError> {
        if let Some(stream) = self.stream.take() {
            if let Err(err) = stream.pause() {
                debug!(error = %err, "pause before drop failed");
            }
            drop(stream);
            info!(device = %self.device_name, "output stream stopped");
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.stream.is_some()
    }

    fn set_volume(&mut self, volume: f32) -> Result<(), GraphError> {
        self.volume.store(volume.to_bits(), Ordering::Relaxed);
        Ok(())
    }

    fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }

    fn latency(&self) -> f64 {
        let Some(config) = &self.config else {
            return 0.0;
        };
        match config.buffer_size() {
            cpal::SupportedBufferSize::Range { min, .. } => {
                *min as f64 / config.sample_rate() as f64
            }
            cpal::SupportedBufferSize::Unknown => 0.0,
        }
    }
}
