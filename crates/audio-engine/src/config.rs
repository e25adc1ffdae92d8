//! Engine configuration loading and validation.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Largest ring buffer the engine will allocate, in frames.
pub const MAX_RING_BUFFER_FRAMES: u32 = 1 << 24;

/// Playback tuning loaded from TOML. Missing keys take their defaults.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Ring buffer capacity in frames (rounded up to a power of two).
    pub ring_buffer_frames: u32,
    /// Frames decoded per producer iteration.
    pub decode_chunk_frames: u32,
    /// Largest slice the output may pull in one render call.
    pub max_frames_per_slice: u32,
    /// Open decoders while creating them.
    pub auto_open_decoders: bool,
    /// Pre-gain in dB; unset or 0 leaves the limiter bypassed.
    pub pre_gain_db: Option<f32>,
    /// Output volume in 0.0..=1.0.
    pub volume: f32,
    /// Output device name substring; unset uses the host default.
    pub device: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ring_buffer_frames: 16_384,
            decode_chunk_frames: 2_048,
            max_frames_per_slice: 4_096,
            auto_open_decoders: true,
            pre_gain_db: None,
            volume: 1.0,
            device: None,
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        let cfg = toml::from_str::<EngineConfig>(&raw)
            .with_context(|| format!("parse config {:?}", path))?;
        cfg.validate()
            .with_context(|| format!("validate config {:?}", path))?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ring_buffer_frames == 0 || self.ring_buffer_frames > MAX_RING_BUFFER_FRAMES {
            return Err(ConfigError {
                field: "ring_buffer_frames",
                expected: "between 1 and 16777216",
                value: self.ring_buffer_frames.to_string(),
            });
        }
        if self.decode_chunk_frames == 0 || self.decode_chunk_frames > self.ring_buffer_frames {
            return Err(ConfigError {
                field: "decode_chunk_frames",
                expected: "non-zero and no larger than ring_buffer_frames",
                value: self.decode_chunk_frames.to_string(),
            });
        }
        if self.max_frames_per_slice == 0 || self.max_frames_per_slice > self.ring_buffer_frames {
            return Err(ConfigError {
                field: "max_frames_per_slice",
                expected: "non-zero and no larger than ring_buffer_frames",
                value: self.max_frames_per_slice.to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.volume) {
            return Err(ConfigError {
                field: "volume",
                expected: "within 0.0..=1.0",
                value: self.volume.to_string(),
            });
        }
        if let Some(db) = self.pre_gain_db {
            if !db.is_finite() {
                return Err(ConfigError {
                    field: "pre_gain_db",
                    expected: "a finite number",
                    value: db.to_string(),
                });
            }
        }
        Ok(())
    }
}
