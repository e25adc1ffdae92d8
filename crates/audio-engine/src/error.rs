//! Typed errors for each engine component.
//!
//! Hardware and decode failures are reported upward unchanged and never retried
//! at this layer. Ring buffer boundary violations are always one of these
//! errors, never an out-of-range access.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::graph::{GraphState, NodeId, Scope};

/// Invalid [`AudioFormat`](crate::format::AudioFormat) parameters.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FormatError {
    #[error("invalid sample rate: {0}")]
    InvalidSampleRate(f64),
    #[error("format must have at least one channel")]
    NoChannels,
    #[error("unsupported bit depth {bits} (float: {is_float})")]
    UnsupportedBitDepth { bits: u32, is_float: bool },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RingBufferError {
    #[error("invalid ring buffer allocation: {0}")]
    InvalidAllocation(&'static str),
    #[error("ring buffer has not been allocated")]
    NotAllocated,
    #[error("{requested} frames exceeds the ring buffer capacity of {capacity}")]
    TooMuch { requested: u64, capacity: u64 },
    #[error("buffer list does not match the ring buffer layout")]
    LayoutMismatch,
    #[error("underrun: requested [{start}, {end}) but [{valid_start}, {valid_end}) is valid")]
    Underrun {
        start: u64,
        end: u64,
        valid_start: u64,
        valid_end: u64,
    },
    /// The write was committed; `lost` frames the reader had not consumed are gone.
    #[error("overrun: writer passed the reader, {lost} unread frames overwritten")]
    Overrun { lost: u64 },
    #[error("ring buffer is being reallocated")]
    Reallocating,
}

#[derive(Debug, Error)]
pub enum DecoderError {
    #[error("decoder is not open")]
    NotOpen,
    #[error("decoder is already open")]
    AlreadyOpen,
    #[error("decoder failed to open earlier and cannot be used")]
    Unusable,
    #[error("unable to open {url}: {reason}")]
    Open { url: String, reason: String },
    #[error("seeking is not supported")]
    SeekingUnsupported,
    #[error("seek to frame {frame} failed: {reason}")]
    Seek { frame: u64, reason: String },
    #[error("invalid region: {0}")]
    InvalidRegion(String),
    #[error("the type of {url} could not be determined")]
    UnknownFileType { url: String },
    #[error("no registered decoder handles {0}")]
    NoDecoder(String),
    #[error("input {url}: {source}")]
    Input {
        url: String,
        #[source]
        source: io::Error,
    },
    #[error("decode error: {0}")]
    Decode(String),
    #[error("buffer list does not match the decoder format")]
    BufferMismatch,
    #[error(transparent)]
    Format(#[from] FormatError),
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("graph is {actual:?}; operation requires {required}")]
    InvalidState {
        actual: GraphState,
        required: &'static str,
    },
    #[error("unknown node {0}")]
    NodeNotFound(NodeId),
    #[error("invalid connection: {0}")]
    InvalidConnection(String),
    #[error("graph is not a linear chain ending at the output: {0}")]
    NotLinear(String),
    #[error("graph already has a hardware output node")]
    DuplicateOutput,
    #[error("graph has no hardware output node")]
    NoOutput,
    #[error("graph has no stream format")]
    NoFormat,
    #[error("{node} rejected the format on {scope:?} element {element}: {reason}")]
    FormatRejected {
        node: String,
        scope: Scope,
        element: u32,
        reason: String,
    },
    #[error("hardware {operation} failed: {message}")]
    Hardware {
        operation: &'static str,
        message: String,
    },
    #[error("format change failed ({original}) and the previous format could not be restored ({rollback})")]
    RollbackFailed {
        original: Box<GraphError>,
        rollback: Box<GraphError>,
    },
    #[error("graph is unusable until it is closed and rebuilt")]
    Unusable,
    #[error(transparent)]
    Format(#[from] FormatError),
}

impl GraphError {
    pub fn hardware(operation: &'static str, message: impl fmt::Display) -> Self {
        GraphError::Hardware {
            operation,
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PlayerError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Decoder(#[from] DecoderError),
    #[error(transparent)]
    RingBuffer(#[from] RingBufferError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("gapless joining is not supported (join compatible: {join_compatible})")]
    JoinUnsupported { join_compatible: bool },
    #[error("volume {0} is outside 0.0..=1.0")]
    InvalidVolume(f32),
    #[error("failed to start decode thread")]
    DriverSpawn(#[source] io::Error),
    #[error("decode thread panicked")]
    DriverPanicked,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{field} must be {expected} (got {value})")]
pub struct ConfigError {
    pub field: &'static str,
    pub expected: &'static str,
    pub value: String,
}

/// A failed hand-off that returns the caller's resource.
///
/// Creation helpers that take an input source or decoder by value return this
/// on failure, so ownership only moves on success. An input the helper opened
/// itself is closed again before it is handed back.
pub struct Rejected<T, E = DecoderError> {
    pub resource: T,
    pub error: E,
}

impl<T, E> Rejected<T, E> {
    pub fn new(resource: T, error: E) -> Self {
        Self { resource, error }
    }

    pub fn into_parts(self) -> (T, E) {
        (self.resource, self.error)
    }
}

impl<T, E: fmt::Debug> fmt::Debug for Rejected<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl<T, E: fmt::Display> fmt::Display for Rejected<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.error.fmt(f)
    }
}

impl<T, E> std::error::Error for Rejected<T, E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}
