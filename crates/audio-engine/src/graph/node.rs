//! Node, render-stage and render-callback contracts.

use std::sync::Arc;

use super::Scope;
use super::output::OutputNode;
use crate::buffer::AudioBufferList;
use crate::error::GraphError;
use crate::format::AudioFormat;

/// Action flags passed through a render call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenderActionFlags(u32);

impl RenderActionFlags {
    /// The callback produced silence; downstream may skip work.
    pub const OUTPUT_IS_SILENCE: RenderActionFlags = RenderActionFlags(1 << 4);

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

/// Position of a render call on the output clock.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct AudioTimeStamp {
    /// Frames rendered by this chain before this call.
    pub sample_time: f64,
    /// Nanoseconds since the chain started.
    pub host_time: u64,
}

/// Result of a render call. Neither variant stops the output clock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderStatus {
    Ok,
    /// The requested frames were unavailable and silence was substituted.
    Underrun,
}

/// Supplies frames to the head of the graph.
///
/// Called on the real-time thread: implementations must not block, allocate,
/// or log.
pub trait RenderCallback: Send + Sync {
    fn render(
        &self,
        flags: &mut RenderActionFlags,
        timestamp: &AudioTimeStamp,
        bus: u32,
        frames: u32,
        data: &mut AudioBufferList,
    ) -> RenderStatus;
}

/// The real-time half of a node: processes buffers in place.
pub trait RenderStage: Send {
    fn process(&mut self, format: &AudioFormat, data: &mut AudioBufferList, frames: u32);
}

/// A processing node owned by a [`ProcessingGraph`](super::ProcessingGraph).
///
/// The node itself lives on the control thread. When the graph starts, each
/// effect node hands out a [`RenderStage`] that runs on the render thread.
pub trait AudioNode {
    fn name(&self) -> &str;

    /// Number of elements (buses) in `scope`.
    fn element_count(&self, scope: Scope) -> u32 {
        match scope {
            Scope::Input | Scope::Output | Scope::Global => 1,
        }
    }

    fn set_stream_format(
        &mut self,
        scope: Scope,
        element: u32,
        format: &AudioFormat,
    ) -> Result<(), GraphError>;

    fn stream_format(&self, scope: Scope, element: u32) -> Option<AudioFormat>;

    fn open(&mut self) -> Result<(), GraphError> {
        Ok(())
    }

    fn close(&mut self) {}

    fn initialize(&mut self, _max_frames: u32) -> Result<(), GraphError> {
        Ok(())
    }

    fn uninitialize(&mut self) {}

    /// Clear any internal processing state.
    fn reset(&mut self) {}

    /// Processing latency in seconds.
    fn latency(&self) -> f64 {
        0.0
    }

    /// Seconds of output produced after the input goes silent.
    fn tail_time(&self) -> f64 {
        0.0
    }

    /// Render-thread half, or `None` for nodes that only consume the chain.
    fn create_stage(&self) -> Option<Box<dyn RenderStage>>;

    fn as_output(&self) -> Option<&OutputNode> {
        None
    }

    fn as_output_mut(&mut self) -> Option<&mut OutputNode> {
        None
    }
}

/// Per-scope stream formats for single-element nodes.
#[derive(Clone, Copy, Debug, Default)]
pub struct FormatSlots {
    input: Option<AudioFormat>,
    output: Option<AudioFormat>,
}

impl FormatSlots {
    pub fn set(
        &mut self,
        node: &str,
        scope: Scope,
        element: u32,
        format: &AudioFormat,
    ) -> Result<(), GraphError> {
        let slot = match (scope, element) {
            (Scope::Input, 0) => &mut self.input,
            (Scope::Output, 0) => &mut self.output,
            _ => {
                return Err(GraphError::FormatRejected {
                    node: node.to_string(),
                    scope,
                    element,
                    reason: "no such element".into(),
                });
            }
        };
        *slot = Some(*format);
        Ok(())
    }

    pub fn get(&self, scope: Scope, element: u32) -> Option<AudioFormat> {
        match (scope, element) {
            (Scope::Input, 0) => self.input,
            (Scope::Output, 0) => self.output,
            _ => None,
        }
    }
}

/// A [`RenderCallback`] built from a closure.
pub struct FnRenderCallback<F>(pub F);

impl<F> RenderCallback for FnRenderCallback<F>
where
    F: Fn(&mut RenderActionFlags, &AudioTimeStamp, u32, u32, &mut AudioBufferList) -> RenderStatus
        + Send
        + Sync,
{
    fn render(
        &self,
        flags: &mut RenderActionFlags,
        timestamp: &AudioTimeStamp,
        bus: u32,
        frames: u32,
        data: &mut AudioBufferList,
    ) -> RenderStatus {
        (self.0)(flags, timestamp, bus, frames, data)
    }
}

/// Wrap a closure as a shareable render callback.
pub fn render_callback<F>(f: F) -> Arc<dyn RenderCallback>
where
    F: Fn(&mut RenderActionFlags, &AudioTimeStamp, u32, u32, &mut AudioBufferList) -> RenderStatus
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnRenderCallback(f))
}
