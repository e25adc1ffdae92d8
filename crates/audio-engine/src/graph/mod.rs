//! Processing graph: a linear chain of nodes ending at a hardware output.
//!
//! The graph moves through `Closed → Open → Initialized → Running` and back.
//! Topology (connections plus the single input callback) is kept as an ordered
//! list of [`Interaction`]s so that reconfiguration can tear the graph down and
//! rebuild it exactly as it was.
//!
//! ## Reconfiguration
//! [`ProcessingGraph::set_format`], [`ProcessingGraph::insert_node_before`] and
//! [`ProcessingGraph::remove_node`] all step the graph back to `Open`, change it,
//! and restore the previous run state. Rendering is excluded by the stop, not by
//! a lock on the render path.

pub mod chain;
pub mod limiter;
pub mod node;
pub mod offline;
pub mod output;

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::GraphError;
use crate::format::AudioFormat;

pub use chain::RenderChain;
pub use limiter::{LimiterParams, PeakLimiter};
pub use node::{
    AudioNode, AudioTimeStamp, RenderActionFlags, RenderCallback, RenderStage, RenderStatus,
    render_callback,
};
pub use offline::{OfflineHandle, OfflineOutput, OfflineRender};
pub use output::{OutputBackend, OutputNode};

/// Stable identity of a node within one graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node {}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    Input,
    Output,
    Global,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphState {
    Closed,
    Open,
    Initialized,
    Running,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Connection {
    pub source: NodeId,
    pub source_output: u32,
    pub dest: NodeId,
    pub dest_input: u32,
}

/// The externally supplied pull callback feeding one node input.
#[derive(Clone)]
pub struct InputCallback {
    pub dest: NodeId,
    pub dest_input: u32,
    pub callback: Arc<dyn RenderCallback>,
}

impl fmt::Debug for InputCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputCallback")
            .field("dest", &self.dest)
            .field("dest_input", &self.dest_input)
            .finish_non_exhaustive()
    }
}

impl PartialEq for InputCallback {
    fn eq(&self, other: &Self) -> bool {
        self.dest == other.dest
            && self.dest_input == other.dest_input
            && std::ptr::addr_eq(Arc::as_ptr(&self.callback), Arc::as_ptr(&other.callback))
    }
}

/// One edge into a node input: another node's output or the input callback.
#[derive(Clone, Debug, PartialEq)]
pub enum Interaction {
    Connection(Connection),
    InputCallback(InputCallback),
}

impl Interaction {
    fn dest(&self) -> (NodeId, u32) {
        match self {
            Interaction::Connection(c) => (c.dest, c.dest_input),
            Interaction::InputCallback(cb) => (cb.dest, cb.dest_input),
        }
    }

    fn retarget(&mut self, dest: NodeId, dest_input: u32) {
        match self {
            Interaction::Connection(c) => {
                c.dest = dest;
                c.dest_input = dest_input;
            }
            Interaction::InputCallback(cb) => {
                cb.dest = dest;
                cb.dest_input = dest_input;
            }
        }
    }
}

struct NodeEntry {
    id: NodeId,
    node: Box<dyn AudioNode>,
}

pub struct ProcessingGraph {
    nodes: Vec<NodeEntry>,
    next_id: u32,
    interactions: Vec<Interaction>,
    state: GraphState,
    format: Option<AudioFormat>,
    max_frames: u32,
    unusable: bool,
}

impl ProcessingGraph {
    /// An empty, closed graph rendering at most `max_frames_per_slice` per pull.
    pub fn new(max_frames_per_slice: u32) -> Self {
        Self {
            nodes: Vec::new(),
            next_id: 1,
            interactions: Vec::new(),
            state: GraphState::Closed,
            format: None,
            max_frames: max_frames_per_slice.max(1),
            unusable: false,
        }
    }

    pub fn state(&self) -> GraphState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state != GraphState::Closed
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.state, GraphState::Initialized | GraphState::Running)
    }

    pub fn is_running(&self) -> bool {
        self.state == GraphState::Running
    }

    /// `false` after a failed format rollback, until [`ProcessingGraph::close`].
    pub fn is_usable(&self) -> bool {
        !self.unusable
    }

    pub fn max_frames_per_slice(&self) -> u32 {
        self.max_frames
    }

    /// The active stream format, changed only by a successful `set_format`.
    pub fn format(&self) -> Option<AudioFormat> {
        self.format
    }

    fn check_usable(&self) -> Result<(), GraphError> {
        if self.unusable {
            return Err(GraphError::Unusable);
        }
        Ok(())
    }

    fn require_editable(&self) -> Result<(), GraphError> {
        self.check_usable()?;
        if self.is_initialized() {
            return Err(GraphError::InvalidState {
                actual: self.state,
                required: "closed or open",
            });
        }
        Ok(())
    }

    fn entry(&self, id: NodeId) -> Result<&NodeEntry, GraphError> {
        self.nodes
            .iter()
            .find(|e| e.id == id)
            .ok_or(GraphError::NodeNotFound(id))
    }

    // Nodes

    /// Add an unconnected node. Only allowed while closed or open.
    pub fn add_node(&mut self, node: Box<dyn AudioNode>) -> Result<NodeId, GraphError> {
        self.require_editable()?;
        self.push_node(node)
    }

    pub fn add_output(&mut self, backend: Box<dyn OutputBackend>) -> Result<NodeId, GraphError> {
        self.add_node(Box::new(OutputNode::new(backend)))
    }

    fn push_node(&mut self, mut node: Box<dyn AudioNode>) -> Result<NodeId, GraphError> {
        if node.as_output().is_some() && self.output_id().is_some() {
            return Err(GraphError::DuplicateOutput);
        }
        if self.is_open() {
            node.open()?;
        }
        let id = NodeId(self.next_id);
        self.next_id += 1;
        debug!(node = %id, name = node.name(), "node added");
        self.nodes.push(NodeEntry { id, node });
        Ok(id)
    }

    fn drop_node(&mut self, id: NodeId) -> Option<Box<dyn AudioNode>> {
        let pos = self.nodes.iter().position(|e| e.id == id)?;
        let mut entry = self.nodes.remove(pos);
        if self.is_open() {
            entry.node.close();
        }
        Some(entry.node)
    }

    pub fn node(&self, id: NodeId) -> Option<&dyn AudioNode> {
        self.entry(id).ok().map(|e| e.node.as_ref())
    }

    /// Node ids in insertion order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|e| e.id).collect()
    }

    pub fn output_id(&self) -> Option<NodeId> {
        self.nodes
            .iter()
            .find(|e| e.node.as_output().is_some())
            .map(|e| e.id)
    }

    pub fn output(&self) -> Option<&OutputNode> {
        self.nodes.iter().find_map(|e| e.node.as_output())
    }

    pub fn output_mut(&mut self) -> Option<&mut OutputNode> {
        self.nodes.iter_mut().find_map(|e| e.node.as_output_mut())
    }

    // Topology

    /// Connections and the input callback, in the order they were made.
    pub fn interactions(&self) -> &[Interaction] {
        &self.interactions
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.interactions.iter().filter_map(|i| match i {
            Interaction::Connection(c) => Some(c),
            Interaction::InputCallback(_) => None,
        })
    }

    pub fn input_callback(&self) -> Option<&InputCallback> {
        self.interactions.iter().find_map(|i| match i {
            Interaction::InputCallback(cb) => Some(cb),
            Interaction::Connection(_) => None,
        })
    }

    fn input_fed(&self, dest: NodeId, dest_input: u32) -> bool {
        self.interactions.iter().any(|i| i.dest() == (dest, dest_input))
    }

    fn check_element(&self, id: NodeId, scope: Scope, element: u32) -> Result<(), GraphError> {
        let entry = self.entry(id)?;
        if element >= entry.node.element_count(scope) {
            return Err(GraphError::InvalidConnection(format!(
                "{id} has no {scope:?} element {element}"
            )));
        }
        Ok(())
    }

    pub fn connect(
        &mut self,
        source: NodeId,
        source_output: u32,
        dest: NodeId,
        dest_input: u32,
    ) -> Result<(), GraphError> {
        self.require_editable()?;
        self.check_element(source, Scope::Output, source_output)?;
        self.check_element(dest, Scope::Input, dest_input)?;
        if source == dest {
            return Err(GraphError::InvalidConnection(format!("{source} cannot feed itself")));
        }
        if self.entry(source)?.node.as_output().is_some() {
            return Err(GraphError::InvalidConnection(format!(
                "{source} is the hardware output"
            )));
        }
        if self.input_fed(dest, dest_input) {
            return Err(GraphError::InvalidConnection(format!(
                "{dest} input {dest_input} is already fed"
            )));
        }
        if self
            .connections()
            .any(|c| c.source == source && c.source_output == source_output)
        {
            return Err(GraphError::InvalidConnection(format!(
                "{source} output {source_output} is already connected"
            )));
        }
        self.interactions.push(Interaction::Connection(Connection {
            source,
            source_output,
            dest,
            dest_input,
        }));
        Ok(())
    }

    pub fn disconnect(&mut self, dest: NodeId, dest_input: u32) -> Result<(), GraphError> {
        self.require_editable()?;
        let pos = self
            .interactions
            .iter()
            .position(|i| matches!(i, Interaction::Connection(c) if c.dest == dest && c.dest_input == dest_input))
            .ok_or_else(|| {
                GraphError::InvalidConnection(format!("{dest} input {dest_input} is not connected"))
            })?;
        self.interactions.remove(pos);
        Ok(())
    }

    /// Register the pull callback, replacing any previous one in place.
    pub fn set_input_callback(
        &mut self,
        dest: NodeId,
        dest_input: u32,
        callback: Arc<dyn RenderCallback>,
    ) -> Result<(), GraphError> {
        self.require_editable()?;
        self.check_element(dest, Scope::Input, dest_input)?;
        let fed_by_node = self
            .connections()
            .any(|c| c.dest == dest && c.dest_input == dest_input);
        if fed_by_node {
            return Err(GraphError::InvalidConnection(format!(
                "{dest} input {dest_input} is already fed"
            )));
        }
        let registration = Interaction::InputCallback(InputCallback {
            dest,
            dest_input,
            callback,
        });
        match self
            .interactions
            .iter()
            .position(|i| matches!(i, Interaction::InputCallback(_)))
        {
            Some(pos) => self.interactions[pos] = registration,
            None => self.interactions.push(registration),
        }
        Ok(())
    }

    pub fn clear_input_callback(&mut self) -> Result<(), GraphError> {
        self.require_editable()?;
        self.interactions
            .retain(|i| !matches!(i, Interaction::InputCallback(_)));
        Ok(())
    }

    /// Remove every connection and the input callback.
    pub fn clear_connections(&mut self) -> Result<(), GraphError> {
        self.require_editable()?;
        self.interactions.clear();
        Ok(())
    }

    /// Node ids from the head of the chain to the output.
    fn chain_order(&self) -> Result<Vec<NodeId>, GraphError> {
        let output = self.output_id().ok_or(GraphError::NoOutput)?;
        let mut order = vec![output];
        let mut current = output;
        loop {
            let mut incoming = self.connections().filter(|c| c.dest == current);
            let Some(first) = incoming.next() else { break };
            if incoming.next().is_some() {
                return Err(GraphError::NotLinear(format!("{current} has several inputs")));
            }
            if order.contains(&first.source) {
                return Err(GraphError::NotLinear(format!("cycle through {}", first.source)));
            }
            order.push(first.source);
            current = first.source;
        }
        order.reverse();

        if order.len() != self.nodes.len() || self.connections().count() + 1 != order.len() {
            return Err(GraphError::NotLinear(
                "every node must sit on the chain to the output".into(),
            ));
        }
        if let Some(cb) = self.input_callback() {
            if cb.dest != order[0] {
                return Err(GraphError::NotLinear(format!(
                    "input callback feeds {} but the chain starts at {}",
                    cb.dest, order[0]
                )));
            }
        }
        Ok(order)
    }

    // Lifecycle

    pub fn open(&mut self) -> Result<(), GraphError> {
        self.check_usable()?;
        if self.state != GraphState::Closed {
            return Ok(());
        }
        for i in 0..self.nodes.len() {
            if let Err(err) = self.nodes[i].node.open() {
                for entry in &mut self.nodes[..i] {
                    entry.node.close();
                }
                return Err(err);
            }
        }
        self.state = GraphState::Open;
        debug!("graph open");
        Ok(())
    }

    /// Tear everything down. Also clears the unusable mark left by a failed rollback.
    pub fn close(&mut self) -> Result<(), GraphError> {
        let mut result = Ok(());
        if self.state == GraphState::Running {
            if let Some(Err(err)) = self.output_mut().map(|o| o.stop()) {
                warn!(error = %err, "output did not stop cleanly while closing");
                result = Err(err);
            }
        }
        if self.is_initialized() {
            for entry in &mut self.nodes {
                entry.node.uninitialize();
            }
        }
        if self.is_open() {
            for entry in &mut self.nodes {
                entry.node.close();
            }
        }
        self.state = GraphState::Closed;
        self.unusable = false;
        debug!("graph closed");
        result
    }

    pub fn initialize(&mut self) -> Result<(), GraphError> {
        self.check_usable()?;
        match self.state {
            GraphState::Closed => {
                return Err(GraphError::InvalidState {
                    actual: self.state,
                    required: "open",
                });
            }
            GraphState::Initialized | GraphState::Running => return Ok(()),
            GraphState::Open => {}
        }
        if self.format.is_none() {
            return Err(GraphError::NoFormat);
        }
        self.chain_order()?;

        let max_frames = self.max_frames;
        for i in 0..self.nodes.len() {
            if let Err(err) = self.nodes[i].node.initialize(max_frames) {
                for entry in &mut self.nodes[..i] {
                    entry.node.uninitialize();
                }
                return Err(err);
            }
        }
        self.state = GraphState::Initialized;
        debug!("graph initialized");
        Ok(())
    }

    pub fn uninitialize(&mut self) -> Result<(), GraphError> {
        self.check_usable()?;
        match self.state {
            GraphState::Running => self.stop()?,
            GraphState::Initialized => {}
            GraphState::Closed | GraphState::Open => return Ok(()),
        }
        for entry in &mut self.nodes {
            entry.node.uninitialize();
        }
        self.state = GraphState::Open;
        debug!("graph uninitialized");
        Ok(())
    }

    /// Build the render chain and hand it to the output.
    pub fn start(&mut self) -> Result<(), GraphError> {
        self.check_usable()?;
        match self.state {
            GraphState::Running => return Ok(()),
            GraphState::Initialized => {}
            actual => {
                return Err(GraphError::InvalidState {
                    actual,
                    required: "initialized",
                });
            }
        }
        let format = self.format.ok_or(GraphError::NoFormat)?;
        let order = self.chain_order()?;

        let mut stages = Vec::new();
        for id in &order {
            if let Some(stage) = self.entry(*id)?.node.create_stage() {
                stages.push(stage);
            }
        }
        let (callback, bus) = match self.input_callback() {
            Some(cb) => (Some(cb.callback.clone()), cb.dest_input),
            None => (None, 0),
        };
        let chain = RenderChain::new(callback, bus, stages, format, self.max_frames);

        self.output_mut().ok_or(GraphError::NoOutput)?.start(chain)?;
        self.state = GraphState::Running;
        info!(format = %format, nodes = order.len(), "graph running");
        Ok(())
    }

    /// Returns once the output has stopped pulling.
    pub fn stop(&mut self) -> Result<(), GraphError> {
        self.check_usable()?;
        if self.state != GraphState::Running {
            return Ok(());
        }
        self.output_mut().ok_or(GraphError::NoOutput)?.stop()?;
        self.state = GraphState::Initialized;
        info!("graph stopped");
        Ok(())
    }

    /// Step back to `Open`, returning `(was_initialized, was_running)`.
    fn suspend(&mut self) -> Result<(bool, bool), GraphError> {
        let snapshot = (self.is_initialized(), self.is_running());
        if snapshot.1 {
            self.stop()?;
        }
        if snapshot.0 {
            self.uninitialize()?;
        }
        Ok(snapshot)
    }

    fn resume(&mut self, was_initialized: bool, was_running: bool) -> Result<(), GraphError> {
        if was_initialized {
            self.initialize()?;
        }
        if was_running {
            self.start()?;
        }
        Ok(())
    }

    /// Run `edit` with the graph stepped back to `Open`, then restore the run state.
    fn reconfigure<T>(
        &mut self,
        edit: impl FnOnce(&mut Self) -> Result<T, GraphError>,
    ) -> Result<T, GraphError> {
        self.check_usable()?;
        let (was_initialized, was_running) = self.suspend()?;
        let result = edit(self);
        let resumed = self.resume(was_initialized, was_running);
        match result {
            Ok(value) => resumed.map(|()| value),
            Err(err) => {
                if let Err(resume_err) = resumed {
                    warn!(error = %resume_err, "could not restore run state after failed edit");
                }
                Err(err)
            }
        }
    }

    // Format

    fn apply_node_format(node: &mut dyn AudioNode, format: &AudioFormat) -> Result<(), GraphError> {
        if node.as_output().is_some() {
            // The device side of an output stays as negotiated.
            return node.set_stream_format(Scope::Input, 0, format);
        }
        for scope in [Scope::Input, Scope::Output] {
            for element in 0..node.element_count(scope) {
                node.set_stream_format(scope, element, format)?;
            }
        }
        Ok(())
    }

    fn apply_format(&mut self, format: &AudioFormat) -> Result<(), GraphError> {
        for entry in &mut self.nodes {
            Self::apply_node_format(entry.node.as_mut(), format)?;
        }
        Ok(())
    }

    /// Change the stream format of every node, preserving topology and run state.
    ///
    /// On failure the previous format is re-applied and the graph is restored,
    /// and the original error is returned. If the previous format cannot be
    /// re-applied either, the result is [`GraphError::RollbackFailed`]: the graph
    /// is left open with no connections and refuses further use until closed.
    pub fn set_format(&mut self, format: AudioFormat) -> Result<(), GraphError> {
        self.check_usable()?;
        if self.state == GraphState::Closed {
            return Err(GraphError::InvalidState {
                actual: self.state,
                required: "open",
            });
        }

        let saved = self.interactions.clone();
        let (was_initialized, was_running) = self.suspend()?;
        self.interactions.clear();

        if let Err(err) = self.apply_format(&format) {
            warn!(format = %format, error = %err, "format change failed, rolling back");
            if let Some(previous) = self.format {
                if let Err(rollback) = self.apply_format(&previous) {
                    error!(error = %rollback, "format rollback failed, graph unusable");
                    self.unusable = true;
                    return Err(GraphError::RollbackFailed {
                        original: Box::new(err),
                        rollback: Box::new(rollback),
                    });
                }
            }
            self.interactions = saved;
            if let Err(resume_err) = self.resume(was_initialized, was_running) {
                warn!(error = %resume_err, "could not restore run state after rollback");
            }
            return Err(err);
        }

        self.format = Some(format);
        self.interactions = saved;
        self.resume(was_initialized, was_running)?;
        info!(format = %format, "graph format changed");
        Ok(())
    }

    /// Insert `node` between `before` and whatever currently feeds it.
    pub fn insert_node_before(
        &mut self,
        node: Box<dyn AudioNode>,
        before: NodeId,
    ) -> Result<NodeId, GraphError> {
        self.entry(before)?;
        self.reconfigure(|graph| {
            let saved = graph.interactions.clone();
            let id = graph.push_node(node)?;
            let spliced = graph.splice_before(id, before);
            if let Err(err) = spliced {
                graph.interactions = saved;
                graph.drop_node(id);
                return Err(err);
            }
            Ok(id)
        })
    }

    fn splice_before(&mut self, id: NodeId, before: NodeId) -> Result<(), GraphError> {
        if let Some(format) = self.format {
            let entry = self
                .nodes
                .iter_mut()
                .find(|e| e.id == id)
                .ok_or(GraphError::NodeNotFound(id))?;
            Self::apply_node_format(entry.node.as_mut(), &format)?;
        }
        for interaction in &mut self.interactions {
            if interaction.dest() == (before, 0) {
                interaction.retarget(id, 0);
            }
        }
        self.interactions.push(Interaction::Connection(Connection {
            source: id,
            source_output: 0,
            dest: before,
            dest_input: 0,
        }));
        Ok(())
    }

    /// Remove a node, joining whatever fed it to whatever it fed.
    pub fn remove_node(&mut self, id: NodeId) -> Result<Box<dyn AudioNode>, GraphError> {
        if self.entry(id)?.node.as_output().is_some() {
            return Err(GraphError::InvalidConnection(
                "the hardware output cannot be removed".into(),
            ));
        }
        self.reconfigure(|graph| {
            let downstream = graph
                .connections()
                .find(|c| c.source == id)
                .map(|c| (c.dest, c.dest_input));
            graph
                .interactions
                .retain(|i| !matches!(i, Interaction::Connection(c) if c.source == id));
            match downstream {
                Some((dest, dest_input)) => {
                    for interaction in &mut graph.interactions {
                        if interaction.dest().0 == id {
                            interaction.retarget(dest, dest_input);
                        }
                    }
                }
                None => graph.interactions.retain(|i| i.dest().0 != id),
            }
            let node = graph.drop_node(id).ok_or(GraphError::NodeNotFound(id))?;
            debug!(node = %id, "node removed");
            Ok(node)
        })
    }

    // Processing properties

    /// Sum of node latencies, in seconds.
    pub fn latency(&self) -> f64 {
        self.nodes.iter().map(|e| e.node.latency()).sum()
    }

    /// Sum of node tail times, in seconds.
    pub fn tail_time(&self) -> f64 {
        self.nodes.iter().map(|e| e.node.tail_time()).sum()
    }

    /// Clear internal processing state of every node.
    pub fn reset(&mut self) -> Result<(), GraphError> {
        self.check_usable()?;
        for entry in &mut self.nodes {
            entry.node.reset();
        }
        Ok(())
    }
}
