//! Pre-gain plus peak limiting effect node.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use super::Scope;
use super::node::{AudioNode, FormatSlots, RenderStage};
use crate::buffer::AudioBufferList;
use crate::error::GraphError;
use crate::format::AudioFormat;

const ATTACK_SECONDS: f64 = 0.012;
const DECAY_SECONDS: f64 = 0.024;
const CEILING: f32 = 1.0;

/// Parameters shared between the node, its render stage and the player.
#[derive(Clone, Debug)]
pub struct LimiterParams {
    inner: Arc<ParamsInner>,
}

#[derive(Debug)]
struct ParamsInner {
    pre_gain_db: AtomicU32,
    bypass: AtomicBool,
}

impl Default for LimiterParams {
    fn default() -> Self {
        Self {
            inner: Arc::new(ParamsInner {
                pre_gain_db: AtomicU32::new(0f32.to_bits()),
                bypass: AtomicBool::new(true),
            }),
        }
    }
}

impl LimiterParams {
    pub fn pre_gain_db(&self) -> f32 {
        f32::from_bits(self.inner.pre_gain_db.load(Ordering::Relaxed))
    }

    pub fn set_pre_gain_db(&self, db: f32) {
        self.inner.pre_gain_db.store(db.to_bits(), Ordering::Relaxed);
    }

    pub fn is_bypassed(&self) -> bool {
        self.inner.bypass.load(Ordering::Relaxed)
    }

    pub fn set_bypass(&self, bypass: bool) {
        self.inner.bypass.store(bypass, Ordering::Relaxed);
    }
}

/// Applies a pre-gain and keeps peaks under full scale. Bypassed by default.
pub struct PeakLimiter {
    params: LimiterParams,
    formats: FormatSlots,
    initialized: bool,
}

impl PeakLimiter {
    pub fn new(params: LimiterParams) -> Self {
        Self {
            params,
            formats: FormatSlots::default(),
            initialized: false,
        }
    }

    pub fn params(&self) -> &LimiterParams {
        &self.params
    }
}

impl AudioNode for PeakLimiter {
    fn name(&self) -> &str {
        "peak limiter"
    }

    fn set_stream_format(
        &mut self,
        scope: Scope,
        element: u32,
        format: &AudioFormat,
    ) -> Result<(), GraphError> {
        if self.initialized {
            return Err(GraphError::FormatRejected {
                node: self.name().to_string(),
                scope,
                element,
                reason: "node is initialized".into(),
            });
        }
        self.formats.set("peak limiter", scope, element, format)
    }

    fn stream_format(&self, scope: Scope, element: u32) -> Option<AudioFormat> {
        self.formats.get(scope, element)
    }

    fn initialize(&mut self, _max_frames: u32) -> Result<(), GraphError> {
        let input = self.formats.get(Scope::Input, 0);
        let output = self.formats.get(Scope::Output, 0);
        if input.is_none() || input != output {
            return Err(GraphError::FormatRejected {
                node: self.name().to_string(),
                scope: Scope::Global,
                element: 0,
                reason: "input and output formats must match".into(),
            });
        }
        self.initialized = true;
        Ok(())
    }

    fn uninitialize(&mut self) {
        self.initialized = false;
    }

    fn latency(&self) -> f64 {
        0.0
    }

    fn tail_time(&self) -> f64 {
        DECAY_SECONDS
    }

    fn create_stage(&self) -> Option<Box<dyn RenderStage>> {
        let rate = self
            .formats
            .get(Scope::Input, 0)
            .map_or(44_100.0, |f| f.sample_rate());
        Some(Box::new(LimiterStage {
            params: self.params.clone(),
            envelope: 0.0,
            attack: smoothing(ATTACK_SECONDS, rate),
            decay: smoothing(DECAY_SECONDS, rate),
        }))
    }
}

fn smoothing(seconds: f64, rate: f64) -> f32 {
    (1.0 - (-1.0 / (seconds * rate)).exp()) as f32
}

pub fn db_to_gain(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

struct LimiterStage {
    params: LimiterParams,
    envelope: f32,
    attack: f32,
    decay: f32,
}

impl RenderStage for LimiterStage {
    fn process(&mut self, format: &AudioFormat, data: &mut AudioBufferList, frames: u32) {
        if self.params.is_bypassed() {
            self.envelope = 0.0;
            return;
        }
        let gain = db_to_gain(self.params.pre_gain_db());
        let channels = format.channels() as usize;

        for frame in 0..frames as usize {
            let mut peak = 0f32;
            for ch in 0..channels {
                peak = peak.max((data.sample(format, frame, ch) * gain).abs());
            }
            let coef = if peak > self.envelope { self.attack } else { self.decay };
            self.envelope += (peak - self.envelope) * coef;

            let reduction = if self.envelope > CEILING {
                CEILING / self.envelope
            } else {
                1.0
            };
            for ch in 0..channels {
                let v = data.sample(format, frame, ch) * gain * reduction;
                data.set_sample(format, frame, ch, v.clamp(-CEILING, CEILING));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt() -> AudioFormat {
        AudioFormat::float(48_000.0, 2, 32, true).unwrap()
    }

    fn filled(value: f32, frames: usize) -> AudioBufferList {
        let fmt = fmt();
        let mut list = AudioBufferList::for_format(&fmt, frames as u32);
        for f in 0..frames {
            list.set_sample(&fmt, f, 0, value);
            list.set_sample(&fmt, f, 1, -value);
        }
        list
    }

    fn stage(params: &LimiterParams) -> Box<dyn RenderStage> {
        let mut node = PeakLimiter::new(params.clone());
        node.set_stream_format(Scope::Input, 0, &fmt()).unwrap();
        node.set_stream_format(Scope::Output, 0, &fmt()).unwrap();
        node.initialize(512).unwrap();
        node.create_stage().unwrap()
    }

    #[test]
    fn bypass_leaves_samples_untouched() {
        let params = LimiterParams::default();
        params.set_pre_gain_db(12.0);
        let mut list = filled(0.5, 64);
        stage(&params).process(&fmt(), &mut list, 64);
        assert_eq!(list.sample(&fmt(), 63, 0), 0.5);
    }

    #[test]
    fn pre_gain_scales_quiet_signals() {
        let params = LimiterParams::default();
        params.set_bypass(false);
        params.set_pre_gain_db(-6.0);
        let mut list = filled(0.5, 64);
        stage(&params).process(&fmt(), &mut list, 64);
        let expected = 0.5 * db_to_gain(-6.0);
        assert!((list.sample(&fmt(), 10, 0) - expected).abs() < 1e-5);
        assert!((list.sample(&fmt(), 10, 1) + expected).abs() < 1e-5);
    }

    #[test]
    fn loud_signals_never_exceed_full_scale() {
        let params = LimiterParams::default();
        params.set_bypass(false);
        params.set_pre_gain_db(18.0);
        let mut list = filled(0.9, 4_800);
        stage(&params).process(&fmt(), &mut list, 4_800);
        for f in 0..4_800 {
            assert!(list.sample(&fmt(), f, 0) <= 1.0);
            assert!(list.sample(&fmt(), f, 1) >= -1.0);
        }
        // Once the envelope settles the output sits at the ceiling.
        assert!((list.sample(&fmt(), 4_799, 0) - 1.0).abs() < 1e-3);
    }

    #[test]
    fn initialize_requires_matching_formats() {
        let mut node = PeakLimiter::new(LimiterParams::default());
        assert!(node.initialize(512).is_err());
        node.set_stream_format(Scope::Input, 0, &fmt()).unwrap();
        node.set_stream_format(Scope::Output, 0, &AudioFormat::float(44_100.0, 2, 32, true).unwrap())
            .unwrap();
        assert!(node.initialize(512).is_err());
        node.set_stream_format(Scope::Output, 0, &fmt()).unwrap();
        node.initialize(512).unwrap();
        assert!(node.set_stream_format(Scope::Input, 0, &fmt()).is_err());
        assert_eq!(node.tail_time(), DECAY_SECONDS);
    }
}
