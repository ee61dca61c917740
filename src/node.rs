//! Nodes: the runnable units of a graph.
//!
//! A node owns its ports and a boxed piece of user logic; it knows nothing
//! about scheduling. The scheduler calls [`Node::run`] on a dedicated thread
//! and reads the result code back, and [`Node::abort`] from its own thread to
//! cancel a phase.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::channel::lock;
use crate::errors::{ChannelError, NodeError};
use crate::port::{InputPort, OutputPort};

pub type NodeId = String;

/// Terminal and non-terminal execution states of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeResult {
    NotStarted,
    Running,
    FinishedOk,
    /// Failed, but without forcing the phase down; siblings keep running.
    Error,
    /// Failed in a way that poisons the phase; the scheduler aborts siblings.
    FatalError,
    Aborted,
}

impl NodeResult {
    pub fn is_terminal(self) -> bool {
        !matches!(self, NodeResult::NotStarted | NodeResult::Running)
    }

    pub fn is_failure(self) -> bool {
        matches!(
            self,
            NodeResult::Error | NodeResult::FatalError | NodeResult::Aborted
        )
    }
}

impl std::fmt::Display for NodeResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NodeResult::NotStarted => "not-started",
            NodeResult::Running => "running",
            NodeResult::FinishedOk => "finished-ok",
            NodeResult::Error => "error",
            NodeResult::FatalError => "fatal-error",
            NodeResult::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Everything node logic may touch while executing: its ports and the
/// cooperative stop flag. Run loops must check [`NodeContext::should_run`]
/// between records.
pub struct NodeContext {
    inputs: BTreeMap<usize, InputPort>,
    outputs: BTreeMap<usize, OutputPort>,
    run_it: Arc<AtomicBool>,
}

impl NodeContext {
    /// Whether the node should keep processing. Cleared by the scheduler on
    /// abort.
    pub fn should_run(&self) -> bool {
        self.run_it.load(Ordering::Relaxed)
    }

    pub fn input(&self, index: usize) -> Result<&InputPort, NodeError> {
        self.inputs
            .get(&index)
            .ok_or_else(|| NodeError::Fatal(format!("No input port {index}")))
    }

    pub fn output(&self, index: usize) -> Result<&OutputPort, NodeError> {
        self.outputs
            .get(&index)
            .ok_or_else(|| NodeError::Fatal(format!("No output port {index}")))
    }

    pub fn inputs(&self) -> impl Iterator<Item = &InputPort> {
        self.inputs.values()
    }

    pub fn outputs(&self) -> impl Iterator<Item = &OutputPort> {
        self.outputs.values()
    }
}

/// User-supplied transformation logic, run once per phase on the node's
/// thread.
pub trait NodeLogic: Send {
    /// Per-run setup, called during phase init before any thread starts.
    fn init(&mut self) -> Result<(), NodeError> {
        Ok(())
    }

    /// The node's main loop. Return `Ok(())` on normal completion; end of
    /// stream is signalled on all output ports afterwards by the runtime.
    fn execute(&mut self, ctx: &mut NodeContext) -> Result<(), NodeError>;
}

/// A schedulable graph node.
pub struct Node {
    id: NodeId,
    name: String,
    phase: u32,
    logic: Mutex<Option<Box<dyn NodeLogic>>>,
    result: Mutex<(NodeResult, Option<String>)>,
    run_it: Arc<AtomicBool>,
    inputs: Mutex<BTreeMap<usize, InputPort>>,
    outputs: Mutex<BTreeMap<usize, OutputPort>>,
    /// Reader phase of each attached output edge, for phase-leaf detection.
    output_reader_phases: Mutex<Vec<u32>>,
}

impl Node {
    pub(crate) fn new(
        id: impl Into<NodeId>,
        name: impl Into<String>,
        phase: u32,
        logic: Box<dyn NodeLogic>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            phase,
            logic: Mutex::new(Some(logic)),
            result: Mutex::new((NodeResult::NotStarted, None)),
            run_it: Arc::new(AtomicBool::new(true)),
            inputs: Mutex::new(BTreeMap::new()),
            outputs: Mutex::new(BTreeMap::new()),
            output_reader_phases: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase(&self) -> u32 {
        self.phase
    }

    /// No upstream producer.
    pub fn is_root(&self) -> bool {
        lock(&self.inputs).is_empty()
    }

    /// No downstream consumer at all.
    pub fn is_leaf(&self) -> bool {
        lock(&self.outputs).is_empty()
    }

    /// No downstream consumer within this node's own phase; such nodes end
    /// the phase's work when they terminate.
    pub fn is_phase_leaf(&self) -> bool {
        lock(&self.output_reader_phases)
            .iter()
            .all(|&reader_phase| reader_phase > self.phase)
    }

    pub fn result_code(&self) -> NodeResult {
        lock(&self.result).0
    }

    pub fn result_msg(&self) -> Option<String> {
        lock(&self.result).1.clone()
    }

    /// Per-port record counts, for tracking snapshots.
    pub fn port_counts(&self) -> (Vec<u64>, Vec<u64>) {
        let read = lock(&self.inputs).values().map(InputPort::records_read).collect();
        let written = lock(&self.outputs)
            .values()
            .map(OutputPort::records_written)
            .collect();
        (read, written)
    }

    pub(crate) fn attach_input(&self, index: usize, port: InputPort) {
        lock(&self.inputs).insert(index, port);
    }

    pub(crate) fn attach_output(&self, index: usize, port: OutputPort, reader_phase: u32) {
        lock(&self.outputs).insert(index, port);
        lock(&self.output_reader_phases).push(reader_phase);
    }

    /// Run per-run setup on the node's logic. Called during phase init.
    pub(crate) fn init(&self) -> Result<(), NodeError> {
        self.run_it.store(true, Ordering::Relaxed);
        *lock(&self.result) = (NodeResult::NotStarted, None);
        if let Some(logic) = lock(&self.logic).as_mut() {
            logic.init()?;
        }
        Ok(())
    }

    /// Execute the node's logic to completion on the calling thread and
    /// record the mapped result code.
    pub(crate) fn run(&self) -> NodeResult {
        *lock(&self.result) = (NodeResult::Running, None);
        let mut ctx = NodeContext {
            inputs: lock(&self.inputs).clone(),
            outputs: lock(&self.outputs).clone(),
            run_it: Arc::clone(&self.run_it),
        };
        let logic = lock(&self.logic).take();
        let outcome = match logic {
            Some(mut logic) => {
                let outcome = logic.execute(&mut ctx);
                *lock(&self.logic) = Some(logic);
                outcome
            }
            None => Err(NodeError::Fatal("Node has no logic attached".into())),
        };
        let (code, msg) = match outcome {
            Ok(()) => {
                if self.run_it.load(Ordering::Relaxed) {
                    (NodeResult::FinishedOk, None)
                } else {
                    (NodeResult::Aborted, None)
                }
            }
            Err(NodeError::Channel(ChannelError::Interrupted)) => (NodeResult::Aborted, None),
            Err(NodeError::Channel(err)) => (NodeResult::FatalError, Some(err.to_string())),
            Err(NodeError::Fatal(msg)) => (NodeResult::FatalError, Some(msg)),
            Err(NodeError::Recoverable(msg)) => (NodeResult::Error, Some(msg)),
        };
        // Unblock downstream readers whatever the outcome; a failed or
        // aborted writer must not leave its consumers waiting forever.
        for port in ctx.outputs.values() {
            if let Err(err) = port.signal_eos() {
                debug!(node = %self.id, port = port.index(), %err, "EOS signal failed");
            }
        }
        if let Some(msg) = &msg {
            warn!(node = %self.id, result = %code, message = %msg, "Node finished abnormally");
        }
        *lock(&self.result) = (code, msg);
        code
    }

    /// Record `aborted` for a thread that did not stop within the abort
    /// timeout. The thread may still be running; its eventual result is
    /// discarded.
    pub(crate) fn force_aborted(&self) {
        *lock(&self.result) = (
            NodeResult::Aborted,
            Some("Did not stop within the abort timeout".into()),
        );
    }

    /// Cancel this node: clear the cooperative flag and interrupt any wait
    /// it may be blocked in on either side of its ports.
    pub(crate) fn abort(&self) {
        self.run_it.store(false, Ordering::Relaxed);
        for port in lock(&self.inputs).values() {
            port.channel().interrupt();
        }
        for port in lock(&self.outputs).values() {
            port.channel().interrupt();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelKind;
    use crate::config::EngineConfig;
    use crate::record::Record;

    struct Emit(u32);

    impl NodeLogic for Emit {
        fn execute(&mut self, ctx: &mut NodeContext) -> Result<(), NodeError> {
            let out = ctx.output(0)?;
            for n in 0..self.0 {
                if !ctx.should_run() {
                    return Ok(());
                }
                out.write(Record::from(n.to_le_bytes().to_vec()))?;
            }
            Ok(())
        }
    }

    struct Count(Arc<AtomicBool>);

    impl NodeLogic for Count {
        fn execute(&mut self, ctx: &mut NodeContext) -> Result<(), NodeError> {
            while ctx.input(0)?.read()?.is_some() {}
            self.0.store(true, Ordering::Relaxed);
            Ok(())
        }
    }

    struct Fail;

    impl NodeLogic for Fail {
        fn execute(&mut self, _ctx: &mut NodeContext) -> Result<(), NodeError> {
            Err(NodeError::Fatal("Bad transform".into()))
        }
    }

    fn wire(writer: &Node, reader: &Node) {
        let config = EngineConfig::default();
        let channel = ChannelKind::FastPropagate.create(&config);
        channel.init().unwrap();
        channel.open();
        writer.attach_output(0, OutputPort::new(0, Arc::clone(&channel)), reader.phase());
        reader.attach_input(0, InputPort::new(0, channel));
    }

    #[test]
    fn finished_logic_signals_eos_downstream() {
        let emit = Node::new("emit", "Emitter", 0, Box::new(Emit(5)));
        let done = Arc::new(AtomicBool::new(false));
        let count = Node::new("count", "Counter", 0, Box::new(Count(Arc::clone(&done))));
        wire(&emit, &count);
        assert_eq!(emit.run(), NodeResult::FinishedOk);
        assert_eq!(count.run(), NodeResult::FinishedOk);
        assert!(done.load(Ordering::Relaxed));
        let (read, _) = count.port_counts();
        assert_eq!(read, vec![5]);
    }

    #[test]
    fn fatal_logic_maps_to_fatal_error_with_message() {
        let node = Node::new("bad", "Bad", 0, Box::new(Fail));
        assert_eq!(node.run(), NodeResult::FatalError);
        assert_eq!(node.result_msg().as_deref(), Some("Bad transform"));
    }

    #[test]
    fn aborted_node_reports_aborted_not_ok() {
        let node = Node::new("emit", "Emitter", 0, Box::new(Emit(1_000_000)));
        let config = EngineConfig::default();
        let channel = ChannelKind::Buffered.create(&config);
        channel.init().unwrap();
        channel.open();
        node.attach_output(0, OutputPort::new(0, Arc::clone(&channel)), 0);
        node.abort();
        assert_eq!(node.run(), NodeResult::Aborted);
    }

    #[test]
    fn leaf_flavors() {
        let sink = Node::new("sink", "Sink", 0, Box::new(Fail));
        assert!(sink.is_leaf());
        assert!(sink.is_phase_leaf());

        let writer = Node::new("writer", "Writer", 0, Box::new(Fail));
        let later_reader = Node::new("reader", "Reader", 1, Box::new(Fail));
        wire(&writer, &later_reader);
        assert!(!writer.is_leaf());
        // All consumers are in a later phase, so within phase 0 it is a leaf.
        assert!(writer.is_phase_leaf());
    }
}
