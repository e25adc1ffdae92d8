//! Decoder kind backed by Symphonia.
//!
//! Uses Symphonia to:
//! - probe the input container/codec through an [`InputSource`]
//! - decode packets into interleaved `f32` frames on demand
//! - seek by timestamp, discarding leading frames for sample accuracy

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use parking_lot::Mutex;
use symphonia::core::audio::{Channels, SampleBuffer};
use symphonia::core::codecs::{CODEC_TYPE_NULL, CodecParameters, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::TimeBase;
use tracing::{debug, info};

use super::{Decoder, DecoderKind, InputSource, OpenState, check_buffers};
use crate::error::DecoderError;
use crate::format::{AudioFormat, ChannelLayout};

const EXTENSIONS: &[&str] = &[
    "flac", "mp3", "m4a", "mp4", "aac", "wav", "wave", "aif", "aiff", "aifc", "ogg", "oga",
];

const MIME_TYPES: &[&str] = &[
    "audio/flac",
    "audio/x-flac",
    "audio/mpeg",
    "audio/mp3",
    "audio/mp4",
    "audio/aac",
    "audio/x-m4a",
    "audio/wav",
    "audio/x-wav",
    "audio/wave",
    "audio/aiff",
    "audio/x-aiff",
    "audio/ogg",
    "audio/vorbis",
];

/// FLAC, MP3, AAC/ALAC, WAV, AIFF and Ogg Vorbis through Symphonia.
#[derive(Clone, Copy, Debug, Default)]
pub struct SymphoniaKind;

impl DecoderKind for SymphoniaKind {
    fn name(&self) -> &'static str {
        "symphonia"
    }

    fn supported_file_extensions(&self) -> &[&'static str] {
        EXTENSIONS
    }

    fn supported_mime_types(&self) -> &[&'static str] {
        MIME_TYPES
    }

    fn create_decoder(&self, input: Box<dyn InputSource>) -> Box<dyn Decoder> {
        Box::new(SymphoniaDecoder::new(input))
    }
}

/// An [`InputSource`] shared between the decoder and Symphonia's reader.
///
/// Symphonia owns its `MediaSource`, so the decoder keeps one handle and gives
/// the other to the probe. Dropping the reader leaves the decoder's handle as
/// the only owner, which is how the input is handed back.
#[derive(Clone)]
struct SharedInput {
    url: String,
    inner: Arc<Mutex<Box<dyn InputSource>>>,
}

impl SharedInput {
    fn new(input: Box<dyn InputSource>) -> Self {
        Self {
            url: input.url().to_string(),
            inner: Arc::new(Mutex::new(input)),
        }
    }

    fn into_unshared(self) -> Box<dyn InputSource> {
        match Arc::try_unwrap(self.inner) {
            Ok(input) => input.into_inner(),
            Err(inner) => Box::new(SharedInput {
                url: self.url,
                inner,
            }),
        }
    }
}

impl InputSource for SharedInput {
    fn url(&self) -> &str {
        &self.url
    }

    fn open(&mut self) -> io::Result<()> {
        self.inner.lock().open()
    }

    fn close(&mut self) -> io::Result<()> {
        self.inner.lock().close()
    }

    fn is_open(&self) -> bool {
        self.inner.lock().is_open()
    }

    fn supports_seeking(&self) -> bool {
        self.inner.lock().supports_seeking()
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.lock().read(buf)
    }

    fn seek_to_offset(&mut self, offset: u64) -> io::Result<u64> {
        self.inner.lock().seek_to_offset(offset)
    }

    fn offset(&self) -> u64 {
        self.inner.lock().offset()
    }

    fn length(&self) -> Option<u64> {
        self.inner.lock().length()
    }
}

impl Read for SharedInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        InputSource::read(self, buf)
    }
}

impl Seek for SharedInput {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let mut input = self.inner.lock();
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => input.offset().checked_add_signed(delta),
            SeekFrom::End(delta) => input
                .length()
                .ok_or_else(|| io::Error::new(io::ErrorKind::Unsupported, "input length unknown"))?
                .checked_add_signed(delta),
        };
        let target = target
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "seek before start"))?;
        input.seek_to_offset(target)
    }
}

impl MediaSource for SharedInput {
    fn is_seekable(&self) -> bool {
        self.inner.lock().supports_seeking()
    }

    fn byte_len(&self) -> Option<u64> {
        self.inner.lock().length()
    }
}

struct Stream {
    reader: Box<dyn FormatReader>,
    codec: Box<dyn symphonia::core::codecs::Decoder>,
    track_id: u32,
    time_base: Option<TimeBase>,
    codec_name: Option<&'static str>,
    source_format: AudioFormat,
    format: AudioFormat,
    layout: ChannelLayout,
    total_frames: Option<u64>,
    pending: Vec<f32>,
    pending_pos: usize,
    position: u64,
    skip_frames: u64,
}

impl Stream {
    fn channels(&self) -> usize {
        self.format.channels() as usize
    }

    fn frame_to_ts(&self, frame: u64) -> u64 {
        let rate = self.format.sample_rate() as u128;
        match self.time_base {
            Some(tb) if tb.numer > 0 && rate > 0 => {
                (frame as u128 * tb.denom as u128 / (rate * tb.numer as u128)) as u64
            }
            _ => frame,
        }
    }

    fn ts_to_frame(&self, ts: u64) -> u64 {
        let rate = self.format.sample_rate() as u128;
        match self.time_base {
            Some(tb) if tb.denom > 0 => (ts as u128 * tb.numer as u128 * rate / tb.denom as u128) as u64,
            _ => ts,
        }
    }

    /// Decode the next packet of our track into `pending`. `false` at end of stream.
    fn decode_next(&mut self) -> Result<bool, DecoderError> {
        loop {
            let packet = match self.reader.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Ok(false);
                }
                Err(SymphoniaError::ResetRequired) => return Ok(false),
                Err(e) => return Err(DecoderError::Decode(e.to_string())),
            };
            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.codec.decode(&packet) {
                Ok(d) => d,
                Err(SymphoniaError::DecodeError(reason)) => {
                    debug!(reason, "skipping undecodable packet");
                    continue;
                }
                Err(e) => return Err(DecoderError::Decode(e.to_string())),
            };
            if decoded.frames() == 0 {
                continue;
            }
            if decoded.spec().channels.count() != self.format.channels() as usize {
                return Err(DecoderError::Decode(
                    "channel count changed mid-stream".into(),
                ));
            }

            let mut sample_buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, *decoded.spec());
            sample_buf.copy_interleaved_ref(decoded);

            self.pending.clear();
            self.pending.extend_from_slice(sample_buf.samples());
            let frames = (self.pending.len() / self.channels()) as u64;
            let skip = self.skip_frames.min(frames);
            self.skip_frames -= skip;
            self.pending_pos = skip as usize * self.channels();
            if self.pending_pos < self.pending.len() {
                return Ok(true);
            }
        }
    }
}

/// Decodes any container/codec Symphonia can probe into interleaved `f32`.
pub struct SymphoniaDecoder {
    input: SharedInput,
    state: OpenState,
    stream: Option<Stream>,
}

impl SymphoniaDecoder {
    pub fn new(input: Box<dyn InputSource>) -> Self {
        Self {
            input: SharedInput::new(input),
            state: OpenState::Closed,
            stream: None,
        }
    }

    fn open_error(&self, reason: impl ToString) -> DecoderError {
        DecoderError::Open {
            url: self.input.url.clone(),
            reason: reason.to_string(),
        }
    }

    fn open_stream(&mut self) -> Result<Stream, DecoderError> {
        if !self.input.is_open() {
            self.input.open().map_err(|source| DecoderError::Input {
                url: self.input.url.clone(),
                source,
            })?;
        }

        let mut hint = Hint::new();
        if let Some(ext) = self.input.file_extension() {
            hint.with_extension(ext);
        }

        let mss = MediaSourceStream::new(Box::new(self.input.clone()), Default::default());
        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|e| self.open_error(e))?;
        let reader = probed.format;

        let track = reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| self.open_error("no audio track"))?;
        let params = track.codec_params.clone();
        let track_id = track.id;

        let rate = params
            .sample_rate
            .ok_or_else(|| self.open_error("unknown sample rate"))?;
        let channels = params
            .channels
            .ok_or_else(|| self.open_error("unknown channel count"))?;

        let codec = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| self.open_error(e))?;

        let channel_count = channels.count() as u32;
        let format = AudioFormat::float(rate as f64, channel_count, 32, true)?;
        let source_format = source_format_from_params(&params, rate, channel_count)?;

        Ok(Stream {
            reader,
            codec,
            track_id,
            time_base: params.time_base,
            codec_name: codec_name_from_params(&params),
            source_format,
            format,
            layout: layout_from_channels(channels),
            total_frames: params.n_frames,
            pending: Vec::new(),
            pending_pos: 0,
            position: 0,
            skip_frames: 0,
        })
    }
}

impl Decoder for SymphoniaDecoder {
    fn input(&self) -> &dyn InputSource {
        &self.input
    }

    fn open(&mut self) -> Result<(), DecoderError> {
        if let Some(err) = self.state.open_error() {
            return Err(err);
        }
        match self.open_stream() {
            Ok(stream) => {
                info!(
                    url = %self.input.url,
                    codec = stream.codec_name.unwrap_or("unknown"),
                    rate_hz = stream.format.sample_rate(),
                    channels = stream.format.channels(),
                    frames = ?stream.total_frames,
                    "decoder open"
                );
                self.stream = Some(stream);
                self.state = OpenState::Open;
                Ok(())
            }
            Err(err) => {
                self.state = OpenState::Failed;
                Err(err)
            }
        }
    }

    fn close(&mut self) -> Result<(), DecoderError> {
        self.stream = None;
        if self.state == OpenState::Open {
            self.state = OpenState::Closed;
        }
        self.input.close().map_err(|source| DecoderError::Input {
            url: self.input.url.clone(),
            source,
        })
    }

    fn is_open(&self) -> bool {
        self.state == OpenState::Open
    }

    fn source_format(&self) -> Option<AudioFormat> {
        self.stream.as_ref().map(|s| s.source_format)
    }

    fn format(&self) -> Option<AudioFormat> {
        self.stream.as_ref().map(|s| s.format)
    }

    fn channel_layout(&self) -> Option<ChannelLayout> {
        self.stream.as_ref().map(|s| s.layout.clone())
    }

    fn total_frames(&self) -> Option<u64> {
        self.stream.as_ref().and_then(|s| s.total_frames)
    }

    fn current_frame(&self) -> u64 {
        self.stream.as_ref().map_or(0, |s| s.position)
    }

    fn supports_seeking(&self) -> bool {
        self.input.supports_seeking()
    }

    fn seek_to_frame(&mut self, frame: u64) -> Result<u64, DecoderError> {
        self.state.require_open()?;
        if !self.supports_seeking() {
            return Err(DecoderError::SeekingUnsupported);
        }
        let stream = self.stream.as_mut().ok_or(DecoderError::NotOpen)?;
        if let Some(total) = stream.total_frames {
            if frame > total {
                return Err(DecoderError::Seek {
                    frame,
                    reason: format!("stream has {total} frames"),
                });
            }
        }

        let ts = stream.frame_to_ts(frame);
        let seeked = stream
            .reader
            .seek(
                SeekMode::Accurate,
                SeekTo::TimeStamp {
                    ts,
                    track_id: stream.track_id,
                },
            )
            .map_err(|e| DecoderError::Seek {
                frame,
                reason: e.to_string(),
            })?;
        stream.codec.reset();

        stream.pending.clear();
        stream.pending_pos = 0;
        stream.skip_frames = frame.saturating_sub(stream.ts_to_frame(seeked.actual_ts));
        stream.position = frame;
        debug!(frame, actual_ts = seeked.actual_ts, skip = stream.skip_frames, "seeked");
        Ok(frame)
    }

    fn read_audio(&mut self, buffers: &mut [&mut [u8]], frames: u32) -> Result<u32, DecoderError> {
        self.state.require_open()?;
        let stream = self.stream.as_mut().ok_or(DecoderError::NotOpen)?;
        check_buffers(&stream.format, buffers, frames)?;

        let channels = stream.channels();
        let out = &mut buffers[0];
        let mut done = 0usize;
        while done < frames as usize {
            if stream.pending_pos >= stream.pending.len() && !stream.decode_next()? {
                break;
            }
            let available = (stream.pending.len() - stream.pending_pos) / channels;
            let n = available.min(frames as usize - done);
            let samples = &stream.pending[stream.pending_pos..stream.pending_pos + n * channels];
            let dst = &mut out[done * channels * 4..(done + n) * channels * 4];
            for (bytes, sample) in dst.chunks_exact_mut(4).zip(samples) {
                bytes.copy_from_slice(&sample.to_ne_bytes());
            }
            stream.pending_pos += n * channels;
            stream.position += n as u64;
            done += n;
        }
        Ok(done as u32)
    }

    fn into_input(self: Box<Self>) -> Box<dyn InputSource> {
        let SymphoniaDecoder { input, stream, .. } = *self;
        drop(stream);
        input.into_unshared()
    }

    fn source_format_description(&self) -> Option<String> {
        let stream = self.stream.as_ref()?;
        Some(match stream.codec_name {
            Some(codec) => format!("{codec}, {}", stream.source_format),
            None => stream.source_format.to_string(),
        })
    }
}

fn source_format_from_params(
    params: &CodecParameters,
    rate: u32,
    channels: u32,
) -> Result<AudioFormat, DecoderError> {
    let bits = params.bits_per_sample.or(params.bits_per_coded_sample);
    let format = match bits {
        Some(bits) => {
            let bits = match bits {
                0..=8 => 8,
                9..=16 => 16,
                17..=24 => 24,
                _ => 32,
            };
            AudioFormat::pcm(rate as f64, channels, bits, true)?
        }
        // Lossy codecs have no meaningful bit depth.
        None => AudioFormat::float(rate as f64, channels, 32, true)?,
    };
    Ok(format)
}

fn layout_from_channels(channels: Channels) -> ChannelLayout {
    match channels.count() {
        1 | 2 => ChannelLayout::for_channel_count(channels.count() as u32),
        _ => ChannelLayout::with_bitmap(channels.bits()),
    }
}

/// Best-effort codec label used in descriptions and logs.
fn codec_name_from_params(params: &CodecParameters) -> Option<&'static str> {
    use symphonia::core::codecs::*;
    let name = match params.codec {
        CODEC_TYPE_FLAC => "FLAC",
        CODEC_TYPE_MP3 => "MP3",
        CODEC_TYPE_AAC => "AAC",
        CODEC_TYPE_ALAC => "ALAC",
        CODEC_TYPE_VORBIS => "VORBIS",
        CODEC_TYPE_PCM_S16LE | CODEC_TYPE_PCM_S16BE => "PCM_S16",
        CODEC_TYPE_PCM_S24LE | CODEC_TYPE_PCM_S24BE => "PCM_S24",
        CODEC_TYPE_PCM_S32LE | CODEC_TYPE_PCM_S32BE => "PCM_S32",
        CODEC_TYPE_PCM_F32LE | CODEC_TYPE_PCM_F32BE => "PCM_F32",
        _ => return None,
    };
    Some(name)
}
