//! Graph registry: nodes, edges, and the construction API consumed by an
//! external graph-definition loader.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::channel::{lock, Channel, ChannelKind};
use crate::errors::GraphConfigError;
use crate::node::{Node, NodeId, NodeLogic};

pub type EdgeId = String;

/// A directed connection between one writer port and one reader port. The
/// endpoints are fixed for the edge's lifetime; the backing channel is
/// materialized at phase init from the kind topology analysis settled on.
pub struct Edge {
    id: EdgeId,
    writer: (NodeId, usize),
    reader: (NodeId, usize),
    declared_kind: Option<ChannelKind>,
    kind: Mutex<Option<ChannelKind>>,
    channel: Mutex<Option<Arc<dyn Channel>>>,
}

impl Edge {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn writer_node(&self) -> &str {
        &self.writer.0
    }

    pub fn writer_port(&self) -> usize {
        self.writer.1
    }

    pub fn reader_node(&self) -> &str {
        &self.reader.0
    }

    pub fn reader_port(&self) -> usize {
        self.reader.1
    }

    /// The kind requested at construction, if any.
    pub fn declared_kind(&self) -> Option<ChannelKind> {
        self.declared_kind
    }

    /// The kind settled by topology analysis. `None` before analysis.
    pub fn kind(&self) -> Option<ChannelKind> {
        *lock(&self.kind)
    }

    pub(crate) fn set_kind(&self, kind: ChannelKind) {
        *lock(&self.kind) = Some(kind);
    }

    pub(crate) fn channel(&self) -> Option<Arc<dyn Channel>> {
        lock(&self.channel).clone()
    }

    pub(crate) fn set_channel(&self, channel: Arc<dyn Channel>) {
        *lock(&self.channel) = Some(channel);
    }

    pub(crate) fn clear_channel(&self) {
        *lock(&self.channel) = None;
    }
}

/// The full node/edge registry for one transformation job. Built once by the
/// caller, validated exactly once by [`crate::graph::analyze`], then executed
/// by the scheduler.
pub struct Graph {
    nodes: BTreeMap<NodeId, Arc<Node>>,
    edges: BTreeMap<EdgeId, Arc<Edge>>,
    used_writer_ports: HashSet<(NodeId, usize)>,
    used_reader_ports: HashSet<(NodeId, usize)>,
    analyzed: bool,
}

impl Graph {
    pub fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
            edges: BTreeMap::new(),
            used_writer_ports: HashSet::new(),
            used_reader_ports: HashSet::new(),
            analyzed: false,
        }
    }

    /// Register a node under `id`, assigned to `phase`, with its logic.
    pub fn add_node(
        &mut self,
        id: impl Into<NodeId>,
        name: impl Into<String>,
        phase: u32,
        logic: Box<dyn NodeLogic>,
    ) -> Result<(), GraphConfigError> {
        if self.analyzed {
            return Err(GraphConfigError::AlreadyAnalyzed);
        }
        let id = id.into();
        if self.nodes.contains_key(&id) {
            return Err(GraphConfigError::DuplicateId {
                kind: "node",
                id,
            });
        }
        let node = Node::new(id.clone(), name, phase, logic);
        self.nodes.insert(id, Arc::new(node));
        Ok(())
    }

    /// Connect `writer`'s output port to `reader`'s input port. Each port
    /// carries at most one edge.
    pub fn add_edge(
        &mut self,
        id: impl Into<EdgeId>,
        writer: &str,
        writer_port: usize,
        reader: &str,
        reader_port: usize,
        kind: Option<ChannelKind>,
    ) -> Result<(), GraphConfigError> {
        if self.analyzed {
            return Err(GraphConfigError::AlreadyAnalyzed);
        }
        let id = id.into();
        if self.edges.contains_key(&id) {
            return Err(GraphConfigError::DuplicateId {
                kind: "edge",
                id,
            });
        }
        for endpoint in [writer, reader] {
            if !self.nodes.contains_key(endpoint) {
                return Err(GraphConfigError::UnknownNode(endpoint.to_string()));
            }
        }
        let writer_key = (writer.to_string(), writer_port);
        if !self.used_writer_ports.insert(writer_key) {
            return Err(GraphConfigError::PortAlreadyConnected {
                node: writer.to_string(),
                port: writer_port,
            });
        }
        let reader_key = (reader.to_string(), reader_port);
        if !self.used_reader_ports.insert(reader_key) {
            return Err(GraphConfigError::PortAlreadyConnected {
                node: reader.to_string(),
                port: reader_port,
            });
        }
        let edge = Edge {
            id: id.clone(),
            writer: (writer.to_string(), writer_port),
            reader: (reader.to_string(), reader_port),
            declared_kind: kind,
            kind: Mutex::new(None),
            channel: Mutex::new(None),
        };
        self.edges.insert(id, Arc::new(edge));
        Ok(())
    }

    pub fn node(&self, id: &str) -> Option<&Arc<Node>> {
        self.nodes.get(id)
    }

    pub fn edge(&self, id: &str) -> Option<&Arc<Edge>> {
        self.edges.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.nodes.values()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Arc<Edge>> {
        self.edges.values()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn is_analyzed(&self) -> bool {
        self.analyzed
    }

    pub(crate) fn mark_analyzed(&mut self) {
        self.analyzed = true;
    }

    /// Edges written by `node`.
    pub(crate) fn out_edges(&self, node: &str) -> Vec<Arc<Edge>> {
        self.edges
            .values()
            .filter(|e| e.writer_node() == node)
            .cloned()
            .collect()
    }

    /// Edges read by `node`.
    pub(crate) fn in_edges(&self, node: &str) -> Vec<Arc<Edge>> {
        self.edges
            .values()
            .filter(|e| e.reader_node() == node)
            .cloned()
            .collect()
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::NodeError;
    use crate::node::NodeContext;

    struct Noop;

    impl NodeLogic for Noop {
        fn execute(&mut self, _ctx: &mut NodeContext) -> Result<(), NodeError> {
            Ok(())
        }
    }

    fn two_node_graph() -> Graph {
        let mut graph = Graph::new();
        graph.add_node("a", "A", 0, Box::new(Noop)).unwrap();
        graph.add_node("b", "B", 0, Box::new(Noop)).unwrap();
        graph
    }

    #[test]
    fn duplicate_node_id_is_rejected() {
        let mut graph = two_node_graph();
        let err = graph.add_node("a", "A2", 0, Box::new(Noop)).unwrap_err();
        assert!(matches!(err, GraphConfigError::DuplicateId { kind: "node", .. }));
    }

    #[test]
    fn edge_endpoints_must_exist() {
        let mut graph = two_node_graph();
        let err = graph
            .add_edge("e", "a", 0, "missing", 0, None)
            .unwrap_err();
        assert!(matches!(err, GraphConfigError::UnknownNode(id) if id == "missing"));
    }

    #[test]
    fn a_port_carries_at_most_one_edge() {
        let mut graph = two_node_graph();
        graph.add_node("c", "C", 0, Box::new(Noop)).unwrap();
        graph.add_edge("e1", "a", 0, "b", 0, None).unwrap();
        let err = graph.add_edge("e2", "a", 0, "c", 0, None).unwrap_err();
        assert!(matches!(
            err,
            GraphConfigError::PortAlreadyConnected { node, port: 0 } if node == "a"
        ));
    }

    #[test]
    fn edge_lookup_by_direction() {
        let mut graph = two_node_graph();
        graph.add_edge("e1", "a", 0, "b", 0, None).unwrap();
        assert_eq!(graph.out_edges("a").len(), 1);
        assert_eq!(graph.in_edges("b").len(), 1);
        assert!(graph.out_edges("b").is_empty());
    }
}
