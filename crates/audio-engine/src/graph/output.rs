//! Hardware output node and the backend contract behind it.

use super::Scope;
use super::chain::RenderChain;
use super::node::{AudioNode, RenderStage};
use crate::error::GraphError;
use crate::format::AudioFormat;

/// A device (or stand-in) that pulls a [`RenderChain`] on its own clock.
///
/// Only the client side is configurable; the device side is whatever the
/// backend negotiated.
pub trait OutputBackend {
    fn name(&self) -> &str;

    /// Accept or reject the format the chain will render in.
    fn set_client_format(&mut self, format: &AudioFormat) -> Result<(), GraphError>;

    fn client_format(&self) -> Option<AudioFormat>;

    /// Begin pulling `chain`. Errors carry the backend's message.
    fn start(&mut self, chain: RenderChain) -> Result<(), GraphError>;

    /// Returns once the backend has stopped calling into the chain.
    fn stop(&mut self) -> Result<(), GraphError>;

    fn is_running(&self) -> bool;

    fn set_volume(&mut self, volume: f32) -> Result<(), GraphError>;

    fn volume(&self) -> f32;

    /// Device-side latency in seconds.
    fn latency(&self) -> f64 {
        0.0
    }
}

/// Terminal node of every graph.
pub struct OutputNode {
    backend: Box<dyn OutputBackend>,
}

impl OutputNode {
    pub fn new(backend: Box<dyn OutputBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &dyn OutputBackend {
        self.backend.as_ref()
    }

    pub fn start(&mut self, chain: RenderChain) -> Result<(), GraphError> {
        self.backend.start(chain)
    }

    pub fn stop(&mut self) -> Result<(), GraphError> {
        self.backend.stop()
    }

    pub fn is_running(&self) -> bool {
        self.backend.is_running()
    }

    pub fn set_volume(&mut self, volume: f32) -> Result<(), GraphError> {
        self.backend.set_volume(volume)
    }

    pub fn volume(&self) -> f32 {
        self.backend.volume()
    }
}

impl AudioNode for OutputNode {
    fn name(&self) -> &str {
        self.backend.name()
    }

    fn set_stream_format(
        &mut self,
        scope: Scope,
        element: u32,
        format: &AudioFormat,
    ) -> Result<(), GraphError> {
        match (scope, element) {
            (Scope::Input, 0) => self.backend.set_client_format(format),
            _ => Err(GraphError::FormatRejected {
                node: self.backend.name().to_string(),
                scope,
                element,
                reason: "only the client side of an output is configurable".into(),
            }),
        }
    }

    fn stream_format(&self, scope: Scope, element: u32) -> Option<AudioFormat> {
        match (scope, element) {
            (Scope::Input, 0) => self.backend.client_format(),
            _ => None,
        }
    }

    fn latency(&self) -> f64 {
        self.backend.latency()
    }

    fn create_stage(&self) -> Option<Box<dyn RenderStage>> {
        None
    }

    fn as_output(&self) -> Option<&OutputNode> {
        Some(self)
    }

    fn as_output_mut(&mut self) -> Option<&mut OutputNode> {
        Some(self)
    }
}
