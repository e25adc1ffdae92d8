//! PCM stream shape and channel layout descriptions.
//!
//! [`AudioFormat`] describes how frames are laid out in memory; [`ChannelLayout`]
//! describes what each channel means. Together they decide whether two decoded
//! streams could be joined without reconfiguring the processing graph.

use std::fmt;

use serde::Serialize;

use crate::error::FormatError;

/// Shape of a linear PCM stream.
///
/// Interleaved formats carry every channel in one buffer, so
/// `bytes_per_frame = channels * bits / 8`. Non-interleaved formats carry one
/// buffer per channel and `bytes_per_frame` is the size of a single sample.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct AudioFormat {
    sample_rate: f64,
    channels: u32,
    bits_per_channel: u32,
    is_float: bool,
    interleaved: bool,
    bytes_per_frame: u32,
}

impl AudioFormat {
    /// Signed little-endian integer PCM.
    pub fn pcm(
        sample_rate: f64,
        channels: u32,
        bits_per_channel: u32,
        interleaved: bool,
    ) -> Result<Self, FormatError> {
        Self::build(sample_rate, channels, bits_per_channel, false, interleaved)
    }

    /// Native-endian IEEE float PCM (32 or 64 bit).
    pub fn float(
        sample_rate: f64,
        channels: u32,
        bits_per_channel: u32,
        interleaved: bool,
    ) -> Result<Self, FormatError> {
        Self::build(sample_rate, channels, bits_per_channel, true, interleaved)
    }

    fn build(
        sample_rate: f64,
        channels: u32,
        bits_per_channel: u32,
        is_float: bool,
        interleaved: bool,
    ) -> Result<Self, FormatError> {
        if !sample_rate.is_finite() || sample_rate <= 0.0 {
            return Err(FormatError::InvalidSampleRate(sample_rate));
        }
        if channels == 0 {
            return Err(FormatError::NoChannels);
        }
        let valid_bits = if is_float {
            matches!(bits_per_channel, 32 | 64)
        } else {
            matches!(bits_per_channel, 8 | 16 | 24 | 32)
        };
        if !valid_bits {
            return Err(FormatError::UnsupportedBitDepth {
                bits: bits_per_channel,
                is_float,
            });
        }

        let bytes_per_sample = bits_per_channel / 8;
        let bytes_per_frame = if interleaved {
            channels * bytes_per_sample
        } else {
            bytes_per_sample
        };

        Ok(Self {
            sample_rate,
            channels,
            bits_per_channel,
            is_float,
            interleaved,
            bytes_per_frame,
        })
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn channels(&self) -> u32 {
        self.channels
    }

    pub fn bits_per_channel(&self) -> u32 {
        self.bits_per_channel
    }

    pub fn is_float(&self) -> bool {
        self.is_float
    }

    pub fn is_interleaved(&self) -> bool {
        self.interleaved
    }

    /// Bytes per frame *per buffer*.
    pub fn bytes_per_frame(&self) -> u32 {
        self.bytes_per_frame
    }

    pub fn bytes_per_sample(&self) -> u32 {
        self.bits_per_channel / 8
    }

    /// Number of separate buffers a frame is spread across.
    pub fn buffer_count(&self) -> u32 {
        if self.interleaved { 1 } else { self.channels }
    }

    /// Channels carried by each buffer.
    pub fn channels_per_buffer(&self) -> u32 {
        if self.interleaved { self.channels } else { 1 }
    }

    /// Duration of `frames` in milliseconds.
    pub fn frames_to_ms(&self, frames: u64) -> u64 {
        ((frames as f64 * 1000.0) / self.sample_rate) as u64
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_float { "float" } else { "int" };
        let layout = if self.interleaved {
            "interleaved"
        } else {
            "deinterleaved"
        };
        write!(
            f,
            "{} ch, {} Hz, {}-bit {kind}, {layout}",
            self.channels, self.sample_rate, self.bits_per_channel
        )
    }
}

/// Channel layout tag. Values follow the Core Audio numbering so that layouts
/// read from container metadata can be carried through unchanged.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct LayoutTag(pub u32);

impl LayoutTag {
    pub const USE_CHANNEL_DESCRIPTIONS: LayoutTag = LayoutTag(0);
    pub const USE_CHANNEL_BITMAP: LayoutTag = LayoutTag(1 << 16);
    pub const MONO: LayoutTag = LayoutTag((100 << 16) | 1);
    pub const STEREO: LayoutTag = LayoutTag((101 << 16) | 2);
    pub const QUADRAPHONIC: LayoutTag = LayoutTag((108 << 16) | 4);
    pub const MPEG_5_1_A: LayoutTag = LayoutTag((121 << 16) | 6);
    pub const UNKNOWN: LayoutTag = LayoutTag(0xFFFF_0000);

    /// Channel count encoded in the low 16 bits of a predefined tag.
    pub fn channel_count(self) -> u32 {
        self.0 & 0xFFFF
    }
}

/// One entry of an explicit channel description list.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct ChannelDescription {
    pub label: u32,
    pub flags: u32,
    pub coordinates: [f32; 3],
}

impl ChannelDescription {
    pub fn new(label: u32) -> Self {
        Self {
            label,
            flags: 0,
            coordinates: [0.0; 3],
        }
    }
}

// Byte-exact comparison: two NaN coordinates with the same bits are equal.
impl PartialEq for ChannelDescription {
    fn eq(&self, other: &Self) -> bool {
        self.label == other.label
            && self.flags == other.flags
            && self
                .coordinates
                .iter()
                .zip(other.coordinates.iter())
                .all(|(a, b)| a.to_bits() == b.to_bits())
    }
}

/// Meaning of each channel in a stream.
#[derive(Clone, Debug, Serialize)]
pub struct ChannelLayout {
    tag: LayoutTag,
    bitmap: u32,
    descriptions: Vec<ChannelDescription>,
}

impl ChannelLayout {
    pub fn with_tag(tag: LayoutTag) -> Self {
        Self {
            tag,
            bitmap: 0,
            descriptions: Vec::new(),
        }
    }

    pub fn with_bitmap(bitmap: u32) -> Self {
        Self {
            tag: LayoutTag::USE_CHANNEL_BITMAP,
            bitmap,
            descriptions: Vec::new(),
        }
    }

    pub fn with_descriptions(descriptions: Vec<ChannelDescription>) -> Self {
        Self {
            tag: LayoutTag::USE_CHANNEL_DESCRIPTIONS,
            bitmap: 0,
            descriptions,
        }
    }

    /// Best-effort default layout for a bare channel count.
    pub fn for_channel_count(channels: u32) -> Self {
        let tag = match channels {
            1 => LayoutTag::MONO,
            2 => LayoutTag::STEREO,
            4 => LayoutTag::QUADRAPHONIC,
            6 => LayoutTag::MPEG_5_1_A,
            n => LayoutTag(LayoutTag::UNKNOWN.0 | (n & 0xFFFF)),
        };
        Self::with_tag(tag)
    }

    pub fn tag(&self) -> LayoutTag {
        self.tag
    }

    pub fn bitmap(&self) -> u32 {
        self.bitmap
    }

    pub fn descriptions(&self) -> &[ChannelDescription] {
        &self.descriptions
    }

    /// Number of channels described, when the layout says.
    pub fn channel_count(&self) -> u32 {
        match self.tag {
            LayoutTag::USE_CHANNEL_DESCRIPTIONS => self.descriptions.len() as u32,
            LayoutTag::USE_CHANNEL_BITMAP => self.bitmap.count_ones(),
            tag => tag.channel_count(),
        }
    }
}

impl PartialEq for ChannelLayout {
    fn eq(&self, other: &Self) -> bool {
        if self.tag != other.tag {
            return false;
        }
        match self.tag {
            LayoutTag::USE_CHANNEL_BITMAP => self.bitmap == other.bitmap,
            LayoutTag::USE_CHANNEL_DESCRIPTIONS => self.descriptions == other.descriptions,
            _ => true,
        }
    }
}

impl fmt::Display for ChannelLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tag {
            LayoutTag::MONO => f.write_str("Mono"),
            LayoutTag::STEREO => f.write_str("Stereo"),
            LayoutTag::QUADRAPHONIC => f.write_str("Quadraphonic"),
            LayoutTag::MPEG_5_1_A => f.write_str("5.1 (L R C LFE Ls Rs)"),
            LayoutTag::USE_CHANNEL_BITMAP => write!(f, "Bitmap {:#010x}", self.bitmap),
            LayoutTag::USE_CHANNEL_DESCRIPTIONS => {
                write!(f, "{} described channels", self.descriptions.len())
            }
            tag => write!(f, "{} channels", tag.channel_count()),
        }
    }
}

/// Whether two streams could be played back to back without touching the graph.
pub fn is_join_compatible(
    format: &AudioFormat,
    layout: &ChannelLayout,
    next_format: &AudioFormat,
    next_layout: &ChannelLayout,
) -> bool {
    format.sample_rate() == next_format.sample_rate()
        && format.channels() == next_format.channels()
        && layout == next_layout
}
