//! Deterministic in-memory decoder used by unit tests.

use super::input::MemoryInputSource;
use super::{Decoder, DecoderKind, InputSource, OpenState, check_buffers};
use crate::error::DecoderError;
use crate::format::{AudioFormat, ChannelLayout};

/// Byte `b` of frame `frame` for buffer `buffer`.
pub fn pattern_byte(frame: u64, buffer: usize, b: usize) -> u8 {
    (frame as u8)
        .wrapping_mul(13)
        .wrapping_add((frame >> 8) as u8)
        .wrapping_add(buffer as u8 * 29 + b as u8)
}

#[derive(Clone)]
pub struct PatternKind {
    name: &'static str,
    extensions: Vec<&'static str>,
    mime_types: Vec<&'static str>,
    format: AudioFormat,
    frames: u64,
    seekable: bool,
    fail_open: bool,
    read_error_at: Option<u64>,
}

impl PatternKind {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            extensions: vec!["pat"],
            mime_types: Vec::new(),
            format: AudioFormat::pcm(44_100.0, 2, 16, true).unwrap(),
            frames: 1024,
            seekable: true,
            fail_open: false,
            read_error_at: None,
        }
    }

    pub fn extensions(mut self, e: &[&'static str]) -> Self {
        self.extensions = e.to_vec();
        self
    }

    pub fn mime_types(mut self, m: &[&'static str]) -> Self {
        self.mime_types = m.to_vec();
        self
    }

    pub fn format(mut self, f: AudioFormat) -> Self {
        self.format = f;
        self
    }

    pub fn frames(mut self, n: u64) -> Self {
        self.frames = n;
        self
    }

    pub fn non_seekable(mut self) -> Self {
        self.seekable = false;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Reads stop short at `frame` and then fail.
    pub fn read_error_at(mut self, frame: u64) -> Self {
        self.read_error_at = Some(frame);
        self
    }

    pub fn build(&self, url: &str) -> Box<dyn Decoder> {
        self.create_decoder(Box::new(MemoryInputSource::new(url, Vec::new())))
    }
}

impl DecoderKind for PatternKind {
    fn name(&self) -> &'static str {
        self.name
    }

    fn supported_file_extensions(&self) -> &[&'static str] {
        &self.extensions
    }

    fn supported_mime_types(&self) -> &[&'static str] {
        &self.mime_types
    }

    fn create_decoder(&self, input: Box<dyn InputSource>) -> Box<dyn Decoder> {
        Box::new(PatternDecoder {
            kind: self.name,
            input,
            format: self.format,
            frames: self.frames,
            seekable: self.seekable,
            fail_open: self.fail_open,
            read_error_at: self.read_error_at,
            state: OpenState::Closed,
            position: 0,
        })
    }
}

pub struct PatternDecoder {
    pub kind: &'static str,
    input: Box<dyn InputSource>,
    format: AudioFormat,
    frames: u64,
    seekable: bool,
    fail_open: bool,
    read_error_at: Option<u64>,
    state: OpenState,
    position: u64,
}

impl Decoder for PatternDecoder {
    fn input(&self) -> &dyn InputSource {
        self.input.as_ref()
    }

    fn open(&mut self) -> Result<(), DecoderError> {
        if let Some(err) = self.state.open_error() {
            return Err(err);
        }
        if self.fail_open {
            self.state = OpenState::Failed;
            return Err(DecoderError::Open {
                url: self.url().to_string(),
                reason: format!("{} refuses to open", self.kind),
            });
        }
        self.state = OpenState::Open;
        Ok(())
    }

    fn close(&mut self) -> Result<(), DecoderError> {
        if self.state == OpenState::Open {
            self.state = OpenState::Closed;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state == OpenState::Open
    }

    fn source_format(&self) -> Option<AudioFormat> {
        self.format()
    }

    fn format(&self) -> Option<AudioFormat> {
        self.is_open().then_some(self.format)
    }

    fn channel_layout(&self) -> Option<ChannelLayout> {
        self.is_open()
            .then(|| ChannelLayout::for_channel_count(self.format.channels()))
    }

    fn total_frames(&self) -> Option<u64> {
        Some(self.frames)
    }

    fn current_frame(&self) -> u64 {
        self.position
    }

    fn supports_seeking(&self) -> bool {
        self.seekable
    }

    fn seek_to_frame(&mut self, frame: u64) -> Result<u64, DecoderError> {
        self.state.require_open()?;
        if !self.seekable {
            return Err(DecoderError::SeekingUnsupported);
        }
        if frame > self.frames {
            return Err(DecoderError::Seek {
                frame,
                reason: "past end of stream".into(),
            });
        }
        self.position = frame;
        Ok(frame)
    }

    fn read_audio(&mut self, buffers: &mut [&mut [u8]], frames: u32) -> Result<u32, DecoderError> {
        self.state.require_open()?;
        check_buffers(&self.format, buffers, frames)?;
        let limit = self.read_error_at.map_or(self.frames, |at| at.min(self.frames));
        if self.read_error_at.is_some_and(|at| self.position >= at) {
            return Err(DecoderError::Decode(format!("{}: corrupt packet", self.kind)));
        }
        let n = (frames as u64).min(limit - self.position);
        let bpf = self.format.bytes_per_frame() as usize;
        for (index, buf) in buffers.iter_mut().enumerate() {
            for f in 0..n as usize {
                for b in 0..bpf {
                    buf[f * bpf + b] = pattern_byte(self.position + f as u64, index, b);
                }
            }
        }
        self.position += n;
        Ok(n as u32)
    }

    fn into_input(mut self: Box<Self>) -> Box<dyn InputSource> {
        let _ = self.close();
        self.input
    }
}
