//! Decoder abstraction.
//!
//! Every codec is wrapped behind [`Decoder`], a pull-based source of PCM frames
//! in a fixed client format. [`DecoderKind`]s are registered with a
//! [`DecoderRegistry`](registry::DecoderRegistry), which picks one for an input
//! by MIME type or file extension.
//!
//! Lifecycle: a decoder is constructed closed, `open` either succeeds once or
//! leaves it permanently unusable, reads are only valid while open, and the input
//! source is released exactly once when the decoder is closed or dropped.

pub mod input;
pub mod region;
pub mod registry;
pub mod symphonia_decoder;

#[cfg(test)]
pub(crate) mod testing;

use crate::error::DecoderError;
use crate::format::{AudioFormat, ChannelLayout};

pub use input::{FileInputSource, InputSource, MemoryInputSource};
pub use region::{Region, RegionDecoder, RepeatCount};
pub use registry::DecoderRegistry;
pub use symphonia_decoder::{SymphoniaDecoder, SymphoniaKind};

/// Where a decoder is in its one-way lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenState {
    Closed,
    Open,
    /// `open` failed; the decoder can never be used.
    Failed,
}

impl OpenState {
    /// Error to return from `open` when not in `Closed`.
    pub fn open_error(self) -> Option<DecoderError> {
        match self {
            OpenState::Closed => None,
            OpenState::Open => Some(DecoderError::AlreadyOpen),
            OpenState::Failed => Some(DecoderError::Unusable),
        }
    }

    /// Error to return from reads and seeks when not `Open`.
    pub fn require_open(self) -> Result<(), DecoderError> {
        match self {
            OpenState::Open => Ok(()),
            OpenState::Closed => Err(DecoderError::NotOpen),
            OpenState::Failed => Err(DecoderError::Unusable),
        }
    }
}

/// A source of decoded PCM frames.
pub trait Decoder: Send {
    /// The input source this decoder reads from.
    fn input(&self) -> &dyn InputSource;

    fn url(&self) -> &str {
        self.input().url()
    }

    fn open(&mut self) -> Result<(), DecoderError>;

    fn close(&mut self) -> Result<(), DecoderError>;

    fn is_open(&self) -> bool;

    /// Format of the encoded stream, known once open.
    fn source_format(&self) -> Option<AudioFormat>;

    /// Format of the frames produced by [`Decoder::read_audio`], known once open.
    fn format(&self) -> Option<AudioFormat>;

    fn channel_layout(&self) -> Option<ChannelLayout>;

    /// Total frames in the stream, if the container says.
    fn total_frames(&self) -> Option<u64>;

    /// Frame the next read starts at.
    fn current_frame(&self) -> u64;

    fn supports_seeking(&self) -> bool;

    /// Reposition so the next read starts at `frame`. Returns the frame reached.
    fn seek_to_frame(&mut self, frame: u64) -> Result<u64, DecoderError>;

    /// Fill `buffers` (one per [`AudioFormat::buffer_count`]) with up to `frames`
    /// frames. Returns fewer only at end of stream, and 0 exactly there.
    fn read_audio(&mut self, buffers: &mut [&mut [u8]], frames: u32) -> Result<u32, DecoderError>;

    /// Give back the input source, closing the decoder first.
    fn into_input(self: Box<Self>) -> Box<dyn InputSource>;

    fn source_format_description(&self) -> Option<String> {
        self.source_format().map(|f| f.to_string())
    }

    fn format_description(&self) -> Option<String> {
        self.format().map(|f| f.to_string())
    }

    fn channel_layout_description(&self) -> Option<String> {
        self.channel_layout().map(|l| l.to_string())
    }
}

/// A codec family that can build [`Decoder`]s.
pub trait DecoderKind: Send + Sync {
    fn name(&self) -> &'static str;

    fn supported_file_extensions(&self) -> &[&'static str];

    fn supported_mime_types(&self) -> &[&'static str];

    fn handles_file_extension(&self, extension: &str) -> bool {
        self.supported_file_extensions()
            .iter()
            .any(|e| e.eq_ignore_ascii_case(extension))
    }

    fn handles_mime_type(&self, mime_type: &str) -> bool {
        self.supported_mime_types()
            .iter()
            .any(|m| m.eq_ignore_ascii_case(mime_type))
    }

    /// Wrap `input` in a new, closed decoder.
    fn create_decoder(&self, input: Box<dyn InputSource>) -> Box<dyn Decoder>;
}

/// Check that `buffers` can hold `frames` frames of `format`.
pub fn check_buffers(
    format: &AudioFormat,
    buffers: &[&mut [u8]],
    frames: u32,
) -> Result<(), DecoderError> {
    let needed = frames as usize * format.bytes_per_frame() as usize;
    if buffers.len() != format.buffer_count() as usize
        || buffers.iter().any(|b| b.len() < needed)
    {
        return Err(DecoderError::BufferMismatch);
    }
    Ok(())
}
