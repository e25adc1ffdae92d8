//! Streaming audio playback engine.
//!
//! Decoders produce PCM frames, a decode thread stores them in a lock-free
//! [`RingBuffer`], and a [`ProcessingGraph`] ending at a hardware output pulls
//! them on the device clock. The [`Player`] ties the three together and can
//! change the stream format between tracks without tearing the graph down.

pub mod buffer;
pub mod config;
pub mod decode;
pub mod device;
pub mod driver;
pub mod error;
pub mod format;
pub mod graph;
pub mod player;
pub mod ring_buffer;
pub mod status;

pub use buffer::AudioBufferList;
pub use config::EngineConfig;
pub use decode::{Decoder, DecoderKind, DecoderRegistry, InputSource, Region, RepeatCount};
pub use device::CpalOutput;
pub use error::{
    ConfigError, DecoderError, FormatError, GraphError, PlayerError, Rejected, RingBufferError,
};
pub use format::{AudioFormat, ChannelLayout};
pub use graph::{GraphState, ProcessingGraph};
pub use player::Player;
pub use ring_buffer::RingBuffer;
pub use status::PlayerStatus;
