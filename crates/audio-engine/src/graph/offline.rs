//! Output backend without a device: the caller drives the clock.
//!
//! Useful for rendering to memory and for exercising the graph and player
//! without audio hardware. An [`OfflineHandle`] pulls frames from the running
//! chain and can inject failures.

use std::sync::Arc;

use parking_lot::Mutex;

use super::chain::RenderChain;
use super::node::{RenderActionFlags, RenderStatus};
use super::output::OutputBackend;
use crate::error::GraphError;
use crate::format::AudioFormat;

#[derive(Default)]
struct OfflineState {
    chain: Option<RenderChain>,
    client_format: Option<AudioFormat>,
    supported_rates: Option<Vec<f64>>,
    reject_formats: bool,
    fail_start: bool,
    volume: f32,
    rendered_frames: u64,
}

/// One pull from an [`OfflineHandle`].
#[derive(Clone, Debug, PartialEq)]
pub struct OfflineRender {
    /// Interleaved samples after volume, `frames * channels` long.
    pub samples: Vec<f32>,
    pub frames: u32,
    /// `RenderStatus::Underrun` if any slice underran.
    pub status: RenderStatus,
    /// Every slice was flagged as silence.
    pub silent: bool,
}

pub struct OfflineOutput {
    state: Arc<Mutex<OfflineState>>,
}

/// Control side of an [`OfflineOutput`] kept by the caller.
#[derive(Clone)]
pub struct OfflineHandle {
    state: Arc<Mutex<OfflineState>>,
}

impl OfflineOutput {
    /// A backend accepting every format, plus the handle that drives it.
    pub fn new() -> (Self, OfflineHandle) {
        let state = Arc::new(Mutex::new(OfflineState {
            volume: 1.0,
            ..OfflineState::default()
        }));
        (
            Self {
                state: state.clone(),
            },
            OfflineHandle { state },
        )
    }

    /// Restrict accepted client formats to these sample rates.
    pub fn with_supported_rates(self, rates: &[f64]) -> Self {
        self.state.lock().supported_rates = Some(rates.to_vec());
        self
    }
}

impl OutputBackend for OfflineOutput {
    fn name(&self) -> &str {
        "offline output"
    }

    fn set_client_format(&mut self, format: &AudioFormat) -> Result<(), GraphError> {
        let mut state = self.state.lock();
        if state.chain.is_some() {
            return Err(GraphError::hardware("set_client_format", "output is running"));
        }
        if state.reject_formats {
            return Err(GraphError::hardware("set_client_format", "format change refused"));
        }
        if let Some(rates) = &state.supported_rates {
            if !rates.contains(&format.sample_rate()) {
                return Err(GraphError::hardware(
                    "set_client_format",
                    format!("{} Hz is not supported", format.sample_rate()),
                ));
            }
        }
        state.client_format = Some(*format);
        Ok(())
    }

    fn client_format(&self) -> Option<AudioFormat> {
        self.state.lock().client_format
    }

    fn start(&mut self, chain: RenderChain) -> Result<(), GraphError> {
        let mut state = self.state.lock();
        if state.fail_start {
            return Err(GraphError::hardware("start", "device unavailable"));
        }
        state.chain = Some(chain);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), GraphError> {
        self.state.lock().chain = None;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.state.lock().chain.is_some()
    }

    fn set_volume(&mut self, volume: f32) -> Result<(), GraphError> {
        self.state.lock().volume = volume;
        Ok(())
    }

    fn volume(&self) -> f32 {
        self.state.lock().volume
    }
}

impl OfflineHandle {
    /// Render `frames` frames, or `None` if the output is not running.
    pub fn render(&self, frames: u32) -> Option<OfflineRender> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let volume = state.volume;
        let chain = state.chain.as_mut()?;
        let channels = chain.format().channels() as usize;

        let mut out = OfflineRender {
            samples: Vec::with_capacity(frames as usize * channels),
            frames: 0,
            status: RenderStatus::Ok,
            silent: true,
        };
        while out.frames < frames {
            let (n, status) = chain.render(frames - out.frames);
            if status != RenderStatus::Ok {
                out.status = status;
            }
            if !chain.last_flags().contains(RenderActionFlags::OUTPUT_IS_SILENCE) {
                out.silent = false;
            }
            for f in 0..n as usize {
                for ch in 0..channels {
                    out.samples.push(chain.sample(f, ch) * volume);
                }
            }
            out.frames += n;
        }
        state.rendered_frames += frames as u64;
        Some(out)
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().chain.is_some()
    }

    pub fn client_format(&self) -> Option<AudioFormat> {
        self.state.lock().client_format
    }

    /// Frames pulled through this handle so far.
    pub fn rendered_frames(&self) -> u64 {
        self.state.lock().rendered_frames
    }

    /// Make every subsequent client format change fail.
    pub fn set_reject_formats(&self, reject: bool) {
        self.state.lock().reject_formats = reject;
    }

    /// Make subsequent starts fail.
    pub fn set_fail_start(&self, fail: bool) {
        self.state.lock().fail_start = fail;
    }
}
