//! The render-thread view of a started graph.

use std::sync::Arc;
use std::time::Instant;

use super::node::{AudioTimeStamp, RenderActionFlags, RenderCallback, RenderStage, RenderStatus};
use crate::buffer::AudioBufferList;
use crate::format::AudioFormat;

/// Input callback plus the effect stages of a linear graph, ready to be pulled
/// by an output backend.
///
/// Everything is allocated up front; [`RenderChain::render`] only touches
/// preallocated buffers.
pub struct RenderChain {
    callback: Option<Arc<dyn RenderCallback>>,
    bus: u32,
    stages: Vec<Box<dyn RenderStage>>,
    format: AudioFormat,
    buffers: AudioBufferList,
    max_frames: u32,
    sample_time: f64,
    started: Instant,
    last_flags: RenderActionFlags,
}

impl RenderChain {
    pub fn new(
        callback: Option<Arc<dyn RenderCallback>>,
        bus: u32,
        stages: Vec<Box<dyn RenderStage>>,
        format: AudioFormat,
        max_frames: u32,
    ) -> Self {
        let max_frames = max_frames.max(1);
        Self {
            callback,
            bus,
            stages,
            format,
            buffers: AudioBufferList::for_format(&format, max_frames),
            max_frames,
            sample_time: 0.0,
            started: Instant::now(),
            last_flags: RenderActionFlags::empty(),
        }
    }

    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    /// Largest slice a single [`RenderChain::render`] call produces.
    pub fn max_frames(&self) -> u32 {
        self.max_frames
    }

    /// Pull up to `max_frames` frames through the chain. Returns the frames
    /// rendered and the callback status.
    pub fn render(&mut self, frames: u32) -> (u32, RenderStatus) {
        let frames = frames.min(self.max_frames);
        let mut flags = RenderActionFlags::empty();
        let timestamp = AudioTimeStamp {
            sample_time: self.sample_time,
            host_time: self.started.elapsed().as_nanos() as u64,
        };

        let status = match &self.callback {
            Some(callback) => callback.render(&mut flags, &timestamp, self.bus, frames, &mut self.buffers),
            None => {
                self.buffers.silence(frames as usize);
                flags.insert(RenderActionFlags::OUTPUT_IS_SILENCE);
                RenderStatus::Ok
            }
        };

        for stage in &mut self.stages {
            stage.process(&self.format, &mut self.buffers, frames);
        }

        self.sample_time += frames as f64;
        self.last_flags = flags;
        (frames, status)
    }

    /// Flags reported by the most recent render.
    pub fn last_flags(&self) -> RenderActionFlags {
        self.last_flags
    }

    pub fn buffers(&self) -> &AudioBufferList {
        &self.buffers
    }

    /// Sample from the most recent render, converted to `f32`.
    pub fn sample(&self, frame: usize, channel: usize) -> f32 {
        self.buffers.sample(&self.format, frame, channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::node::render_callback;

    struct Halve;

    impl RenderStage for Halve {
        fn process(&mut self, format: &AudioFormat, data: &mut AudioBufferList, frames: u32) {
            for f in 0..frames as usize {
                for ch in 0..format.channels() as usize {
                    let v = data.sample(format, f, ch);
                    data.set_sample(format, f, ch, v * 0.5);
                }
            }
        }
    }

    #[test]
    fn renders_callback_through_stages() {
        let fmt = AudioFormat::float(48_000.0, 2, 32, false).unwrap();
        let cb = render_callback(|_, ts, bus, frames, data| {
            assert_eq!(bus, 0);
            let fmt = AudioFormat::float(48_000.0, 2, 32, false).unwrap();
            for f in 0..frames as usize {
                data.set_sample(&fmt, f, 0, 0.8);
                data.set_sample(&fmt, f, 1, ts.sample_time as f32);
            }
            RenderStatus::Ok
        });
        let mut chain = RenderChain::new(Some(cb), 0, vec![Box::new(Halve)], fmt, 64);

        assert_eq!(chain.render(100), (64, RenderStatus::Ok));
        assert!((chain.sample(10, 0) - 0.4).abs() < 1e-6);
        chain.render(16);
        assert_eq!(chain.sample(0, 1), 32.0);
    }

    #[test]
    fn missing_callback_renders_flagged_silence() {
        let fmt = AudioFormat::pcm(44_100.0, 1, 16, true).unwrap();
        let mut chain = RenderChain::new(None, 0, Vec::new(), fmt, 32);
        assert_eq!(chain.render(8), (8, RenderStatus::Ok));
        assert!(chain.last_flags().contains(RenderActionFlags::OUTPUT_IS_SILENCE));
        assert_eq!(chain.sample(3, 0), 0.0);
    }
}
