//! Playback counters shared between threads, and the status snapshot built from them.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;

use crate::format::{AudioFormat, ChannelLayout};
use crate::graph::GraphState;

/// Counters written by the decode thread and the render callback.
#[derive(Debug, Default)]
pub struct PlaybackCounters {
    /// Frames stored by the producer.
    pub frames_decoded: AtomicU64,
    /// Frames handed to the output. Only the render callback advances it.
    pub frames_rendered: AtomicU64,
    /// Render calls that had to output silence.
    pub underrun_events: AtomicU64,
    /// Frames replaced by silence.
    pub underrun_frames: AtomicU64,
    /// The decoder reached end of stream or gave up.
    pub decode_finished: AtomicBool,
    /// The decoder stopped on an error rather than at end of stream.
    pub decode_failed: AtomicBool,
}

impl PlaybackCounters {
    /// Zero everything for a new track.
    pub fn reset(&self) {
        self.frames_decoded.store(0, Ordering::Release);
        self.frames_rendered.store(0, Ordering::Release);
        self.underrun_events.store(0, Ordering::Relaxed);
        self.underrun_frames.store(0, Ordering::Relaxed);
        self.decode_finished.store(false, Ordering::Release);
        self.decode_failed.store(false, Ordering::Release);
    }

    /// Every decoded frame has been rendered and the decoder is done.
    pub fn is_drained(&self) -> bool {
        self.decode_finished.load(Ordering::Acquire)
            && self.frames_rendered.load(Ordering::Acquire)
                >= self.frames_decoded.load(Ordering::Acquire)
    }

    /// Decoded frames not yet rendered.
    pub fn buffered_frames(&self) -> u64 {
        self.frames_decoded
            .load(Ordering::Acquire)
            .saturating_sub(self.frames_rendered.load(Ordering::Acquire))
    }
}

/// Description of the loaded track.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TrackInfo {
    pub url: String,
    #[serde(skip)]
    pub format: AudioFormat,
    pub format_description: String,
    pub source_format: Option<String>,
    pub channel_layout: Option<String>,
    #[serde(skip)]
    pub layout: Option<ChannelLayout>,
    pub total_frames: Option<u64>,
}

/// Point-in-time view of the player for callers and log lines.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PlayerStatus {
    pub playing: bool,
    pub graph_state: GraphState,
    pub track: Option<TrackInfo>,
    pub frames_decoded: u64,
    pub frames_rendered: u64,
    pub buffered_frames: u64,
    pub ring_capacity_frames: u64,
    pub underrun_events: u64,
    pub underrun_frames: u64,
    pub end_of_stream: bool,
    pub decode_failed: bool,
    pub elapsed_ms: Option<u64>,
    pub duration_ms: Option<u64>,
    pub volume: f32,
    pub pre_gain_db: Option<f32>,
    pub latency_ms: f64,
}

impl PlayerStatus {
    pub(crate) fn new(
        counters: &PlaybackCounters,
        track: Option<TrackInfo>,
        graph_state: GraphState,
        ring_capacity_frames: u64,
    ) -> Self {
        let frames_rendered = counters.frames_rendered.load(Ordering::Acquire);
        let format = track.as_ref().map(|t| t.format);
        Self {
            playing: graph_state == GraphState::Running,
            graph_state,
            frames_decoded: counters.frames_decoded.load(Ordering::Acquire),
            frames_rendered,
            buffered_frames: counters.buffered_frames(),
            ring_capacity_frames,
            underrun_events: counters.underrun_events.load(Ordering::Relaxed),
            underrun_frames: counters.underrun_frames.load(Ordering::Relaxed),
            end_of_stream: counters.is_drained(),
            decode_failed: counters.decode_failed.load(Ordering::Acquire),
            elapsed_ms: format.map(|f| f.frames_to_ms(frames_rendered)),
            duration_ms: format
                .zip(track.as_ref().and_then(|t| t.total_frames))
                .map(|(f, total)| f.frames_to_ms(total)),
            track,
            volume: 1.0,
            pre_gain_db: None,
            latency_ms: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track() -> TrackInfo {
        let format = AudioFormat::pcm(48_000.0, 2, 16, true).unwrap();
        TrackInfo {
            url: "file:///a.flac".into(),
            format,
            format_description: format.to_string(),
            source_format: None,
            channel_layout: Some("Stereo".into()),
            layout: Some(ChannelLayout::for_channel_count(2)),
            total_frames: Some(480_000),
        }
    }

    #[test]
    fn snapshot_reports_elapsed_and_duration() {
        let counters = PlaybackCounters::default();
        counters.frames_decoded.store(120_000, Ordering::Relaxed);
        counters.frames_rendered.store(96_000, Ordering::Relaxed);

        let status = PlayerStatus::new(&counters, Some(track()), GraphState::Running, 16_384);
        assert!(status.playing);
        assert_eq!(status.elapsed_ms, Some(2_000));
        assert_eq!(status.duration_ms, Some(10_000));
        assert_eq!(status.buffered_frames, 24_000);
        assert!(!status.end_of_stream);
    }

    #[test]
    fn drained_only_after_decode_finishes() {
        let counters = PlaybackCounters::default();
        counters.frames_decoded.store(10, Ordering::Relaxed);
        counters.frames_rendered.store(10, Ordering::Relaxed);
        assert!(!counters.is_drained());
        counters.decode_finished.store(true, Ordering::Relaxed);
        assert!(counters.is_drained());

        counters.decode_failed.store(true, Ordering::Relaxed);
        counters.reset();
        assert!(!counters.is_drained());
        assert!(!counters.decode_failed.load(Ordering::Relaxed));
        assert_eq!(counters.buffered_frames(), 0);
    }

    #[test]
    fn snapshot_without_track_has_no_timing() {
        let counters = PlaybackCounters::default();
        let status = PlayerStatus::new(&counters, None, GraphState::Open, 0);
        assert!(!status.playing);
        assert_eq!(status.elapsed_ms, None);
        assert_eq!(status.duration_ms, None);
    }
}
