//! Playback controller.
//!
//! The player owns a [`RingBuffer`] and a [`ProcessingGraph`] shaped
//! `PeakLimiter → Output`. A decode thread fills the ring at increasing frame
//! positions; the output pulls [`PlayerRender`] on its own clock, which fetches
//! exactly the requested frames at `frames_rendered` and never blocks.
//!
//! ```text
//! Decoder ──► DecodeDriver ──► RingBuffer ──► render callback ──► limiter ──► output
//! ```

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::{debug, info, warn};

use crate::buffer::AudioBufferList;
use crate::config::EngineConfig;
use crate::decode::Decoder;
use crate::driver::{DecodeDriver, DriverHandle, DriverOutcome, FrameSink};
use crate::error::{DecoderError, GraphError, PlayerError, Rejected, RingBufferError};
use crate::format::{AudioFormat, is_join_compatible};
use crate::graph::{
    AudioTimeStamp, GraphState, LimiterParams, NodeId, OutputBackend, PeakLimiter,
    ProcessingGraph, RenderActionFlags, RenderCallback, RenderStatus,
};
use crate::ring_buffer::RingBuffer;
use crate::status::{PlaybackCounters, PlayerStatus, TrackInfo};

/// Shared between the control thread, the decode thread and the render callback.
pub struct PlayerRender {
    ring: RingBuffer,
    counters: PlaybackCounters,
}

impl PlayerRender {
    fn new() -> Self {
        Self {
            ring: RingBuffer::new(),
            counters: PlaybackCounters::default(),
        }
    }

    pub fn counters(&self) -> &PlaybackCounters {
        &self.counters
    }

    pub fn ring(&self) -> &RingBuffer {
        &self.ring
    }
}

impl RenderCallback for PlayerRender {
    fn render(
        &self,
        flags: &mut RenderActionFlags,
        _timestamp: &AudioTimeStamp,
        _bus: u32,
        frames: u32,
        data: &mut AudioBufferList,
    ) -> RenderStatus {
        let position = self.counters.frames_rendered.load(Ordering::Acquire);
        match self.ring.fetch(data.buffers_mut(), frames, position, false) {
            Ok(_) => {
                self.counters
                    .frames_rendered
                    .store(position + frames as u64, Ordering::Release);
                RenderStatus::Ok
            }
            Err(err) => {
                data.silence(frames as usize);
                flags.insert(RenderActionFlags::OUTPUT_IS_SILENCE);
                match err {
                    RingBufferError::NotAllocated => return RenderStatus::Ok,
                    RingBufferError::Underrun { valid_start, .. } if position < valid_start => {
                        // Overwritten before it was played: skip to the oldest retained frame.
                        self.counters
                            .frames_rendered
                            .store(valid_start, Ordering::Release);
                    }
                    _ => {}
                }
                if self.counters.is_drained() {
                    return RenderStatus::Ok;
                }
                self.counters.underrun_events.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .underrun_frames
                    .fetch_add(frames as u64, Ordering::Relaxed);
                RenderStatus::Underrun
            }
        }
    }
}

impl FrameSink for PlayerRender {
    fn writable_frames(&self, position: u64) -> u64 {
        let rendered = self.counters.frames_rendered.load(Ordering::Acquire);
        let in_flight = position.saturating_sub(rendered);
        self.ring.capacity_frames().saturating_sub(in_flight)
    }

    fn store(&self, data: &AudioBufferList, frames: u32, position: u64) -> Result<(), RingBufferError> {
        let result = self.ring.store(data.buffers(), frames, position);
        if matches!(result, Ok(()) | Err(RingBufferError::Overrun { .. })) {
            self.counters
                .frames_decoded
                .store(position + frames as u64, Ordering::Release);
        }
        result
    }

    fn finish(&self, _position: u64) {
        self.counters.decode_finished.store(true, Ordering::Release);
    }

    fn fail(&self, _position: u64) {
        self.counters.decode_failed.store(true, Ordering::Release);
        self.counters.decode_finished.store(true, Ordering::Release);
    }
}

/// Format used before the first track so the graph can start and render silence.
fn idle_format() -> Result<AudioFormat, PlayerError> {
    Ok(AudioFormat::float(44_100.0, 2, 32, false).map_err(GraphError::from)?)
}

pub struct Player {
    graph: ProcessingGraph,
    limiter: NodeId,
    limiter_params: LimiterParams,
    render: Arc<PlayerRender>,
    driver: Option<DriverHandle>,
    track: Option<TrackInfo>,
    ring_buffer_frames: u32,
    decode_chunk_frames: u32,
}

impl Player {
    /// Build the `PeakLimiter → Output` graph on `backend` and open it.
    pub fn new(backend: Box<dyn OutputBackend>, config: &EngineConfig) -> Result<Self, PlayerError> {
        config.validate()?;

        let render = Arc::new(PlayerRender::new());
        let limiter_params = LimiterParams::default();
        let mut graph = ProcessingGraph::new(config.max_frames_per_slice);
        let limiter = graph.add_node(Box::new(PeakLimiter::new(limiter_params.clone())))?;
        let output = graph.add_output(backend)?;
        graph.connect(limiter, 0, output, 0)?;
        graph.set_input_callback(limiter, 0, render.clone())?;
        graph.open()?;

        let mut player = Self {
            graph,
            limiter,
            limiter_params,
            render,
            driver: None,
            track: None,
            ring_buffer_frames: config.ring_buffer_frames,
            decode_chunk_frames: config.decode_chunk_frames,
        };

        player.set_volume(config.volume)?;
        if let Some(db) = config.pre_gain_db {
            player.set_pre_gain(db);
        }
        match player.graph.set_format(idle_format()?) {
            Ok(()) => player.graph.initialize()?,
            Err(err) => warn!(error = %err, "output refused the idle format"),
        }
        Ok(player)
    }

    // Playback control

    pub fn play(&mut self) -> Result<(), PlayerError> {
        if self.is_playing() {
            return Ok(());
        }
        self.graph.initialize()?;
        self.graph.start()?;
        info!("playback started");
        Ok(())
    }

    pub fn pause(&mut self) -> Result<(), PlayerError> {
        if !self.is_playing() {
            return Ok(());
        }
        self.graph.stop()?;
        info!("playback paused");
        Ok(())
    }

    /// Same as [`Player::pause`]: the position is kept.
    pub fn stop(&mut self) -> Result<(), PlayerError> {
        self.pause()
    }

    pub fn play_pause(&mut self) -> Result<(), PlayerError> {
        if self.is_playing() {
            self.pause()
        } else {
            self.play()
        }
    }

    pub fn is_playing(&self) -> bool {
        self.graph.is_running()
    }

    // Decoders

    /// Replace the current track with `decoder`, opening it if needed.
    ///
    /// The graph is reformatted to the decoder's format and the ring buffer
    /// reallocated; playback resumes if it was running. If the graph rejects
    /// the format, the previous track keeps playing.
    pub fn play_decoder(&mut self, mut decoder: Box<dyn Decoder>) -> Result<(), PlayerError> {
        if !decoder.is_open() {
            decoder.open()?;
        }
        let format = decoder.format().ok_or(DecoderError::NotOpen)?;
        let track = TrackInfo {
            url: decoder.url().to_string(),
            format,
            format_description: format.to_string(),
            source_format: decoder.source_format_description(),
            channel_layout: decoder.channel_layout_description(),
            layout: decoder.channel_layout(),
            total_frames: decoder.total_frames(),
        };
        let driver = DecodeDriver::new(decoder, self.render.clone(), self.decode_chunk_frames)?;

        let was_playing = self.is_playing();
        if was_playing {
            self.graph.stop()?;
        }

        if let Err(err) = self.graph.set_format(format) {
            warn!(url = %track.url, format = %format, error = %err, "graph rejected track format");
            if was_playing && self.graph.is_usable() {
                if let Err(resume_err) = self.play() {
                    warn!(error = %resume_err, "could not resume playback");
                }
            }
            return Err(err.into());
        }

        // From here on the previous track is gone.
        self.stop_driver();
        if let Err(err) = self.render.ring.allocate(
            format.buffer_count(),
            format.bytes_per_frame(),
            self.ring_buffer_frames,
        ) {
            self.abandon_track(was_playing);
            return Err(err.into());
        }
        self.render.counters.reset();

        info!(
            url = %track.url,
            format = %track.format_description,
            source = track.source_format.as_deref().unwrap_or("unknown"),
            ring_frames = self.render.ring.capacity_frames(),
            "track loaded"
        );

        match driver.spawn() {
            Ok(handle) => self.driver = Some(handle),
            Err(err) => {
                self.abandon_track(was_playing);
                return Err(err);
            }
        }
        self.track = Some(track);

        if was_playing {
            self.play()?;
        }
        Ok(())
    }

    /// Leave the player with no track after a load failed past the point of
    /// no return. Renders silence without counting underruns.
    fn abandon_track(&mut self, was_playing: bool) {
        self.track = None;
        self.render.ring.clear();
        let counters = &self.render.counters;
        counters.reset();
        counters.decode_failed.store(true, Ordering::Release);
        counters.decode_finished.store(true, Ordering::Release);
        if was_playing && self.graph.is_usable() {
            if let Err(err) = self.play() {
                warn!(error = %err, "could not resume playback");
            }
        }
    }

    /// Gapless joining is not implemented: always hands `decoder` back,
    /// reporting whether it could have been joined to the current track.
    pub fn enqueue(
        &mut self,
        mut decoder: Box<dyn Decoder>,
    ) -> Result<(), Rejected<Box<dyn Decoder>, PlayerError>> {
        if !decoder.is_open() {
            if let Err(err) = decoder.open() {
                return Err(Rejected::new(decoder, err.into()));
            }
        }
        let join_compatible = match (&self.track, decoder.format(), decoder.channel_layout()) {
            (Some(current), Some(format), Some(layout)) => current
                .layout
                .as_ref()
                .is_some_and(|l| is_join_compatible(&current.format, l, &format, &layout)),
            _ => false,
        };
        debug!(url = %decoder.url(), join_compatible, "enqueue refused");
        Err(Rejected::new(
            decoder,
            PlayerError::JoinUnsupported { join_compatible },
        ))
    }

    fn stop_driver(&mut self) {
        let Some(driver) = self.driver.take() else {
            return;
        };
        match driver.stop() {
            Ok(DriverOutcome::Failed(err)) => warn!(error = %err, "previous decode had failed"),
            Ok(outcome) => debug!(?outcome, "decode thread stopped"),
            Err(err) => warn!(error = %err, "decode thread ended abnormally"),
        }
    }

    // Parameters

    /// Output volume in `0.0..=1.0`.
    pub fn volume(&self) -> f32 {
        self.graph.output().map_or(0.0, |o| o.volume())
    }

    pub fn set_volume(&mut self, volume: f32) -> Result<(), PlayerError> {
        if !(0.0..=1.0).contains(&volume) {
            return Err(PlayerError::InvalidVolume(volume));
        }
        let output = self.graph.output_mut().ok_or(GraphError::NoOutput)?;
        output.set_volume(volume)?;
        Ok(())
    }

    /// Pre-gain in dB, 0 while disabled.
    pub fn pre_gain(&self) -> f32 {
        if self.is_pre_gain_enabled() {
            self.limiter_params.pre_gain_db()
        } else {
            0.0
        }
    }

    /// Set the limiter pre-gain. 0 dB disables the limiter.
    pub fn set_pre_gain(&mut self, db: f32) {
        if db == 0.0 {
            self.enable_pre_gain(false);
            return;
        }
        self.limiter_params.set_pre_gain_db(db);
        self.enable_pre_gain(true);
    }

    pub fn enable_pre_gain(&mut self, enabled: bool) {
        self.limiter_params.set_bypass(!enabled);
        debug!(enabled, pre_gain_db = self.limiter_params.pre_gain_db(), "pre-gain toggled");
    }

    pub fn is_pre_gain_enabled(&self) -> bool {
        !self.limiter_params.is_bypassed()
    }

    // Graph

    pub fn graph(&self) -> &ProcessingGraph {
        &self.graph
    }

    /// The graph, for inserting or removing effects.
    pub fn graph_mut(&mut self) -> &mut ProcessingGraph {
        &mut self.graph
    }

    pub fn limiter_id(&self) -> NodeId {
        self.limiter
    }

    /// Total graph latency in seconds.
    pub fn graph_latency(&self) -> f64 {
        self.graph.latency()
    }

    /// Total graph tail time in seconds.
    pub fn graph_tail_time(&self) -> f64 {
        self.graph.tail_time()
    }

    pub fn reset_graph(&mut self) -> Result<(), PlayerError> {
        Ok(self.graph.reset()?)
    }

    // Status

    pub fn format(&self) -> Option<AudioFormat> {
        self.track.as_ref().map(|t| t.format)
    }

    pub fn track(&self) -> Option<&TrackInfo> {
        self.track.as_ref()
    }

    pub fn frames_rendered(&self) -> u64 {
        self.render.counters.frames_rendered.load(Ordering::Acquire)
    }

    pub fn frames_decoded(&self) -> u64 {
        self.render.counters.frames_decoded.load(Ordering::Acquire)
    }

    /// The current track has been decoded and rendered completely.
    pub fn is_finished(&self) -> bool {
        self.track.is_some() && self.render.counters.is_drained()
    }

    pub fn status(&self) -> PlayerStatus {
        let mut status = PlayerStatus::new(
            &self.render.counters,
            self.track.clone(),
            self.graph.state(),
            self.render.ring.capacity_frames(),
        );
        status.volume = self.volume();
        status.pre_gain_db = self.is_pre_gain_enabled().then(|| self.pre_gain());
        status.latency_ms = self.graph_latency() * 1_000.0;
        status
    }

    pub fn graph_state(&self) -> GraphState {
        self.graph.state()
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.stop_driver();
        if let Err(err) = self.graph.close() {
            warn!(error = %err, "graph did not close cleanly");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::testing::{PatternKind, pattern_byte};
    use crate::graph::{OfflineHandle, OfflineOutput};
    use std::thread;
    use std::time::{Duration, Instant};

    fn player_with(output: OfflineOutput, config: EngineConfig) -> Player {
        Player::new(Box::new(output), &config).unwrap()
    }

    fn offline_player() -> (Player, OfflineHandle) {
        let (output, handle) = OfflineOutput::new();
        (player_with(output, EngineConfig::default()), handle)
    }

    fn mono_float() -> AudioFormat {
        AudioFormat::float(48_000.0, 1, 32, true).unwrap()
    }

    fn stereo_pcm() -> AudioFormat {
        AudioFormat::pcm(44_100.0, 2, 16, true).unwrap()
    }

    /// Channel 0 of pattern frame `frame` as rendered for 16-bit stereo.
    fn pattern_sample(frame: u64) -> f32 {
        let raw = [pattern_byte(frame, 0, 0), pattern_byte(frame, 0, 1)];
        crate::buffer::read_sample(&raw, &stereo_pcm())
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn starts_initialized_with_idle_format() {
        let (mut player, handle) = offline_player();
        assert_eq!(player.graph_state(), GraphState::Initialized);
        assert!(!player.is_playing());
        player.play().unwrap();
        let render = handle.render(64).unwrap();
        assert!(render.silent);
        assert_eq!(render.status, RenderStatus::Ok);
        assert_eq!(player.status().underrun_events, 0);
        player.play_pause().unwrap();
        assert!(!player.is_playing());
    }

    #[test]
    fn plays_decoder_frames_in_order() {
        let (mut player, handle) = offline_player();
        let kind = PatternKind::new("pattern").frames(20_000);
        player.play_decoder(kind.build("mem://tone.pat")).unwrap();
        assert_eq!(handle.client_format(), Some(stereo_pcm()));
        player.play().unwrap();

        let mut rendered = 0u64;
        while rendered < 20_000 {
            wait_for(|| player.frames_decoded() >= (rendered + 1_000).min(20_000));
            let render = handle.render(1_000).unwrap();
            assert_eq!(render.status, RenderStatus::Ok);
            assert_eq!(render.samples[0], pattern_sample(rendered));
            assert_eq!(render.samples[2 * 999], pattern_sample(rendered + 999));
            rendered += 1_000;
        }
        assert_eq!(player.frames_rendered(), 20_000);

        wait_for(|| player.is_finished());
        let render = handle.render(100).unwrap();
        assert!(render.silent);
        assert_eq!(render.status, RenderStatus::Ok);
        let status = player.status();
        assert_eq!(status.underrun_events, 0);
        assert!(status.end_of_stream);
        assert_eq!(status.track.unwrap().total_frames, Some(20_000));
    }

    #[test]
    fn producer_stops_at_ring_capacity() {
        let (mut player, handle) = offline_player();
        let kind = PatternKind::new("pattern").frames(1_000_000);
        player.play_decoder(kind.build("mem://long.pat")).unwrap();
        player.play().unwrap();
        wait_for(|| player.frames_decoded() >= 16_384);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(player.frames_decoded(), 16_384);

        let render = handle.render(4_096).unwrap();
        assert_eq!(render.status, RenderStatus::Ok);
        assert_eq!(player.frames_rendered(), 4_096);
        wait_for(|| player.frames_decoded() == 16_384 + 4_096);
        assert_eq!(player.status().ring_capacity_frames, 16_384);
    }

    #[test]
    fn underrun_outputs_silence_and_counts() {
        let render = PlayerRender::new();
        let fmt = mono_float();
        render.ring.allocate(1, 4, 1024).unwrap();
        let mut data = AudioBufferList::for_format(&fmt, 256);
        data.buffers_mut()[0].fill(0x7f);
        let mut flags = RenderActionFlags::empty();
        let ts = AudioTimeStamp::default();

        assert_eq!(render.render(&mut flags, &ts, 0, 256, &mut data), RenderStatus::Underrun);
        assert!(flags.contains(RenderActionFlags::OUTPUT_IS_SILENCE));
        assert!(data.buffers()[0].iter().all(|b| *b == 0));
        assert_eq!(render.counters.underrun_events.load(Ordering::Relaxed), 1);
        assert_eq!(render.counters.underrun_frames.load(Ordering::Relaxed), 256);
        assert_eq!(render.counters.frames_rendered.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn overwritten_frames_resync_to_oldest_retained() {
        let render = PlayerRender::new();
        render.ring.allocate(1, 4, 1024).unwrap();
        let fmt = mono_float();
        let mut chunk = AudioBufferList::for_format(&fmt, 1024);
        for (i, start) in [0u64, 1024, 2048].into_iter().enumerate() {
            chunk.buffers_mut()[0].fill(i as u8 + 1);
            let _ = FrameSink::store(&render, &chunk, 1024, start);
        }
        let mut data = AudioBufferList::for_format(&fmt, 128);
        let mut flags = RenderActionFlags::empty();
        let ts = AudioTimeStamp::default();

        assert_eq!(render.render(&mut flags, &ts, 0, 128, &mut data), RenderStatus::Underrun);
        assert_eq!(render.counters.frames_rendered.load(Ordering::Relaxed), 2048);

        let mut flags = RenderActionFlags::empty();
        assert_eq!(render.render(&mut flags, &ts, 0, 128, &mut data), RenderStatus::Ok);
        assert!(!flags.contains(RenderActionFlags::OUTPUT_IS_SILENCE));
        assert_eq!(data.buffers()[0][0], 3);
    }

    #[test]
    fn writable_frames_tracks_the_reader() {
        let render = PlayerRender::new();
        render.ring.allocate(1, 2, 1000).unwrap();
        assert_eq!(render.writable_frames(0), 1024);
        assert_eq!(render.writable_frames(1000), 24);
        render.counters.frames_rendered.store(500, Ordering::Relaxed);
        assert_eq!(render.writable_frames(1000), 524);
    }

    #[test]
    fn format_change_keeps_playing_state() {
        let (mut player, handle) = offline_player();
        player.play().unwrap();
        let stereo = PatternKind::new("a").frames(4_096);
        player.play_decoder(stereo.build("mem://a.pat")).unwrap();
        assert!(player.is_playing());
        assert_eq!(handle.client_format(), Some(stereo_pcm()));

        let mono = PatternKind::new("b").format(mono_float()).frames(4_096);
        player.play_decoder(mono.build("mem://b.pat")).unwrap();
        assert!(player.is_playing());
        assert_eq!(handle.client_format(), Some(mono_float()));
        assert_eq!(player.format(), Some(mono_float()));
        assert_eq!(player.frames_rendered(), 0);
    }

    #[test]
    fn rejected_format_keeps_previous_track_format() {
        let (output, handle) = OfflineOutput::new();
        let mut player = player_with(
            output.with_supported_rates(&[44_100.0]),
            EngineConfig::default(),
        );
        let first = PatternKind::new("a").frames(4_096);
        player.play_decoder(first.build("mem://a.pat")).unwrap();
        player.play().unwrap();

        let err = player
            .play_decoder(PatternKind::new("b").format(mono_float()).build("mem://b.pat"))
            .unwrap_err();
        assert!(matches!(err, PlayerError::Graph(_)));
        assert!(player.is_playing());
        assert_eq!(handle.client_format(), Some(stereo_pcm()));
        assert_eq!(player.track().unwrap().url, "mem://a.pat");
    }

    #[test]
    fn enqueue_hands_decoder_back() {
        let (mut player, _handle) = offline_player();
        let kind = PatternKind::new("pattern").frames(100);
        let rejected = player.enqueue(kind.build("mem://x.pat")).unwrap_err();
        assert!(matches!(
            rejected.error,
            PlayerError::JoinUnsupported {
                join_compatible: false
            }
        ));
        assert_eq!(rejected.resource.url(), "mem://x.pat");

        player.play_decoder(kind.build("mem://a.pat")).unwrap();
        let (decoder, error) = player.enqueue(kind.build("mem://b.pat")).unwrap_err().into_parts();
        assert!(matches!(error, PlayerError::JoinUnsupported { join_compatible: true }));
        assert!(decoder.is_open());

        let other = PatternKind::new("mono").format(mono_float());
        let rejected = player.enqueue(other.build("mem://c.pat")).unwrap_err();
        assert!(matches!(
            rejected.error,
            PlayerError::JoinUnsupported {
                join_compatible: false
            }
        ));
    }

    #[test]
    fn failed_open_is_reported() {
        let (mut player, _handle) = offline_player();
        let kind = PatternKind::new("broken").failing();
        assert!(matches!(
            player.play_decoder(kind.build("mem://x.pat")),
            Err(PlayerError::Decoder(DecoderError::Open { .. }))
        ));
        assert!(player.track().is_none());
    }

    #[test]
    fn volume_and_pre_gain() {
        let (mut player, handle) = offline_player();
        assert!(matches!(player.set_volume(1.5), Err(PlayerError::InvalidVolume(_))));
        player.set_volume(0.25).unwrap();
        assert_eq!(player.volume(), 0.25);

        assert!(!player.is_pre_gain_enabled());
        assert_eq!(player.pre_gain(), 0.0);
        player.set_pre_gain(-3.0);
        assert!(player.is_pre_gain_enabled());
        assert_eq!(player.pre_gain(), -3.0);
        assert_eq!(player.status().pre_gain_db, Some(-3.0));
        player.set_pre_gain(0.0);
        assert!(!player.is_pre_gain_enabled());

        player.play_decoder(PatternKind::new("p").frames(8_192).build("mem://p.pat")).unwrap();
        player.play().unwrap();
        wait_for(|| player.frames_decoded() >= 512);
        let render = handle.render(512).unwrap();
        assert!((render.samples[20] - pattern_sample(10) * 0.25).abs() < 1e-6);
    }

    #[test]
    fn graph_properties_include_limiter_tail() {
        let (mut player, _handle) = offline_player();
        assert!(player.graph_tail_time() > 0.0);
        assert_eq!(player.graph_latency(), 0.0);
        player.reset_graph().unwrap();
        assert_eq!(player.graph().node_ids().len(), 2);
        assert!(player.graph().node(player.limiter_id()).is_some());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let (output, _handle) = OfflineOutput::new();
        let config = EngineConfig {
            volume: 2.0,
            ..EngineConfig::default()
        };
        assert!(matches!(
            Player::new(Box::new(output), &config),
            Err(PlayerError::Config(_))
        ));
    }

    #[test]
    fn decode_error_ends_the_track_without_underruns() {
        let (mut player, handle) = offline_player();
        let kind = PatternKind::new("pattern").frames(20_000).read_error_at(1_000);
        player.play_decoder(kind.build("mem://bad.pat")).unwrap();
        player.play().unwrap();

        wait_for(|| player.status().decode_failed);
        assert_eq!(player.frames_decoded(), 1_000);
        let render = handle.render(1_000).unwrap();
        assert_eq!(render.status, RenderStatus::Ok);
        assert_eq!(render.samples[0], pattern_sample(0));

        assert!(player.is_finished());
        for _ in 0..3 {
            let render = handle.render(256).unwrap();
            assert!(render.silent);
            assert_eq!(render.status, RenderStatus::Ok);
        }
        let status = player.status();
        assert_eq!(status.underrun_events, 0);
        assert!(status.end_of_stream);
    }

    #[test]
    fn abandoned_load_clears_track_and_restores_playback() {
        let (mut player, handle) = offline_player();
        player.play_decoder(PatternKind::new("a").frames(4_096).build("mem://a.pat")).unwrap();
        player.play().unwrap();
        player.stop_driver();
        player.graph.stop().unwrap();

        player.abandon_track(true);
        assert!(player.track().is_none());
        assert!(player.is_playing());
        assert!(player.status().decode_failed);
        assert_eq!(player.frames_decoded(), 0);

        let render = handle.render(128).unwrap();
        assert!(render.silent);
        assert_eq!(render.status, RenderStatus::Ok);
        assert_eq!(player.status().underrun_events, 0);
    }
}
