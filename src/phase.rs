//! Phases: numbered groups of nodes and edges executed together.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use crate::config::EngineConfig;
use crate::errors::ChannelError;
use crate::graph::{Edge, Graph};
use crate::node::{Node, NodeId};
use crate::port::{InputPort, OutputPort};

/// Lifecycle of one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseStatus {
    Created,
    Initialized,
    Running,
    FinishedOk,
    Error,
    Freed,
}

/// One phase of the graph: the nodes declared with its number, the edges it
/// must materialize (those written within it), and the edges it may release
/// (those read within it).
pub struct Phase {
    number: u32,
    nodes: Vec<Arc<Node>>,
    /// Edges whose writer runs in this phase; their channels must exist
    /// before any node thread starts.
    init_edges: Vec<Arc<Edge>>,
    /// Edges whose reader runs in this phase; released at free. A cross-phase
    /// edge appears here in the reader's phase only, so it outlives its
    /// writer's phase.
    free_edges: Vec<Arc<Edge>>,
    /// Nodes with no consumer inside this phase; the phase is complete when
    /// all of them have terminated.
    leaves: HashSet<NodeId>,
    status: PhaseStatus,
}

impl Phase {
    pub(crate) fn new(
        number: u32,
        nodes: Vec<Arc<Node>>,
        init_edges: Vec<Arc<Edge>>,
        free_edges: Vec<Arc<Edge>>,
        leaves: HashSet<NodeId>,
    ) -> Self {
        Self {
            number,
            nodes,
            init_edges,
            free_edges,
            leaves,
            status: PhaseStatus::Created,
        }
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn status(&self) -> PhaseStatus {
        self.status
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub fn leaves(&self) -> &HashSet<NodeId> {
        &self.leaves
    }

    /// Materialize every edge written in this phase, wire ports on both
    /// endpoints, then run per-node setup. Any failure fails the whole
    /// phase; nothing is retried.
    pub(crate) fn init(
        &mut self,
        graph: &Graph,
        config: &EngineConfig,
    ) -> Result<(), ChannelError> {
        debug_assert_eq!(self.status, PhaseStatus::Created);
        for edge in &self.init_edges {
            let kind = edge.kind().ok_or_else(|| {
                ChannelError::Protocol(format!("Edge {} has no settled kind", edge.id()))
            })?;
            let channel = kind.create(config);
            channel.init()?;
            channel.open();
            let writer = graph.node(edge.writer_node()).ok_or_else(|| {
                ChannelError::Protocol(format!("Edge {} writer is unknown", edge.id()))
            })?;
            let reader = graph.node(edge.reader_node()).ok_or_else(|| {
                ChannelError::Protocol(format!("Edge {} reader is unknown", edge.id()))
            })?;
            writer.attach_output(
                edge.writer_port(),
                OutputPort::new(edge.writer_port(), Arc::clone(&channel)),
                reader.phase(),
            );
            reader.attach_input(
                edge.reader_port(),
                InputPort::new(edge.reader_port(), Arc::clone(&channel)),
            );
            edge.set_channel(channel);
            debug!(phase = self.number, edge = edge.id(), %kind, "Edge initialized");
        }
        for node in &self.nodes {
            node.init()
                .map_err(|err| ChannelError::Protocol(format!(
                    "Node {} failed to initialize: {err}",
                    node.id()
                )))?;
        }
        self.status = PhaseStatus::Initialized;
        Ok(())
    }

    pub(crate) fn set_running(&mut self) {
        debug_assert_eq!(self.status, PhaseStatus::Initialized);
        self.status = PhaseStatus::Running;
    }

    pub(crate) fn finish(&mut self, ok: bool) {
        self.status = if ok {
            PhaseStatus::FinishedOk
        } else {
            PhaseStatus::Error
        };
    }

    /// Release the channels of edges read in this phase. Cross-phase edges
    /// are listed here under the reader's phase, so both connected phases are
    /// done by the time this runs.
    pub(crate) fn free(&mut self) {
        for edge in &self.free_edges {
            if let Some(channel) = edge.channel() {
                channel.close();
            }
            edge.clear_channel();
        }
        self.status = PhaseStatus::Freed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelKind;
    use crate::errors::NodeError;
    use crate::graph::Graph;
    use crate::node::{NodeContext, NodeLogic};

    struct Noop;

    impl NodeLogic for Noop {
        fn execute(&mut self, _ctx: &mut NodeContext) -> Result<(), NodeError> {
            Ok(())
        }
    }

    #[test]
    fn init_materializes_channels_and_wires_ports() {
        let mut graph = Graph::new();
        graph.add_node("src", "Source", 0, Box::new(Noop)).unwrap();
        graph.add_node("dst", "Sink", 0, Box::new(Noop)).unwrap();
        graph
            .add_edge("e", "src", 0, "dst", 0, Some(ChannelKind::FastPropagate))
            .unwrap();
        let edge = Arc::clone(graph.edge("e").unwrap());
        edge.set_kind(ChannelKind::FastPropagate);

        let nodes: Vec<_> = graph.nodes().cloned().collect();
        let leaves: HashSet<_> = ["dst".to_string()].into();
        let mut phase = Phase::new(
            0,
            nodes,
            vec![Arc::clone(&edge)],
            vec![Arc::clone(&edge)],
            leaves,
        );
        phase.init(&graph, &EngineConfig::default()).unwrap();
        assert_eq!(phase.status(), PhaseStatus::Initialized);
        assert!(edge.channel().is_some());
        assert!(!graph.node("src").unwrap().is_leaf());

        phase.free();
        assert_eq!(phase.status(), PhaseStatus::Freed);
        assert!(edge.channel().is_none());
    }

    #[test]
    fn edge_without_settled_kind_fails_init() {
        let mut graph = Graph::new();
        graph.add_node("src", "Source", 0, Box::new(Noop)).unwrap();
        graph.add_node("dst", "Sink", 0, Box::new(Noop)).unwrap();
        graph.add_edge("e", "src", 0, "dst", 0, None).unwrap();
        let edge = Arc::clone(graph.edge("e").unwrap());

        let mut phase = Phase::new(
            0,
            graph.nodes().cloned().collect(),
            vec![edge],
            vec![],
            HashSet::new(),
        );
        let err = phase.init(&graph, &EngineConfig::default()).unwrap_err();
        assert!(matches!(err, ChannelError::Protocol(_)));
    }
}
