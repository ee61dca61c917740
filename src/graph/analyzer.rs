//! Topology analysis: validation, channel-kind resolution, and phase
//! assignment.
//!
//! Runs exactly once per graph, before any thread starts. Failures here are
//! configuration errors; no partial run is attempted.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info};

use crate::channel::ChannelKind;
use crate::errors::GraphConfigError;
use crate::graph::graph::{Edge, Graph};
use crate::node::{Node, NodeId};
use crate::phase::Phase;

/// Validate the graph, settle every edge's channel kind, and split nodes and
/// edges into phases in ascending phase-number order.
pub fn analyze(graph: &mut Graph) -> Result<Vec<Phase>, GraphConfigError> {
    if graph.is_analyzed() {
        return Err(GraphConfigError::AlreadyAnalyzed);
    }

    let mut successors: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    let mut predecessors: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    for edge in graph.edges() {
        successors
            .entry(edge.writer_node().to_string())
            .or_default()
            .push(edge.reader_node().to_string());
        predecessors
            .entry(edge.reader_node().to_string())
            .or_default()
            .push(edge.writer_node().to_string());
    }

    let roots: Vec<NodeId> = graph
        .nodes()
        .map(|n| n.id().to_string())
        .filter(|id| !predecessors.contains_key(id))
        .collect();
    if roots.is_empty() {
        return Err(GraphConfigError::NoRoot);
    }

    let order = enumerate_from_roots(graph, &roots, &successors)?;

    for edge in graph.edges() {
        let writer_phase = node_phase(graph, edge.writer_node());
        let reader_phase = node_phase(graph, edge.reader_node());
        if reader_phase < writer_phase {
            return Err(GraphConfigError::PhaseOrderViolation {
                edge: edge.id().to_string(),
                writer_phase,
                reader_phase,
            });
        }
    }

    let forced = multiple_feed_edges(graph, &predecessors);

    for edge in graph.edges() {
        let writer_phase = node_phase(graph, edge.writer_node());
        let reader_phase = node_phase(graph, edge.reader_node());
        // Cross-phase handoff needs the disk tape regardless of anything
        // declared; a multiple-feed hazard needs a writer that cannot block.
        let kind = if reader_phase > writer_phase {
            ChannelKind::PhaseTape
        } else if forced.contains(edge.id()) {
            ChannelKind::Buffered
        } else {
            edge.declared_kind().unwrap_or(ChannelKind::Direct)
        };
        edge.set_kind(kind);
        debug!(edge = edge.id(), %kind, "Edge kind settled");
    }

    let mut by_phase: BTreeMap<u32, Vec<Arc<Node>>> = BTreeMap::new();
    for id in &order {
        if let Some(node) = graph.node(id) {
            by_phase.entry(node.phase()).or_default().push(Arc::clone(node));
        }
    }

    let mut phases = Vec::with_capacity(by_phase.len());
    for (number, nodes) in by_phase {
        let init_edges: Vec<Arc<Edge>> = graph
            .edges()
            .filter(|e| node_phase(graph, e.writer_node()) == number)
            .cloned()
            .collect();
        let free_edges: Vec<Arc<Edge>> = graph
            .edges()
            .filter(|e| node_phase(graph, e.reader_node()) == number)
            .cloned()
            .collect();
        let leaves: HashSet<NodeId> = nodes
            .iter()
            .filter(|n| {
                graph
                    .out_edges(n.id())
                    .iter()
                    .all(|e| node_phase(graph, e.reader_node()) > number)
            })
            .map(|n| n.id().to_string())
            .collect();
        phases.push(Phase::new(number, nodes, init_edges, free_edges, leaves));
    }

    graph.mark_analyzed();
    info!(
        nodes = graph.node_count(),
        phases = phases.len(),
        "Topology analysis complete"
    );
    Ok(phases)
}

fn node_phase(graph: &Graph, id: &str) -> u32 {
    graph.node(id).map(|n| n.phase()).unwrap_or(0)
}

/// Depth-first enumeration from the roots in dependency order. Rejects a
/// cycle with its full path; nodes unreachable from any root sit on or behind
/// a cycle and are walked too so that cycle gets reported.
fn enumerate_from_roots(
    graph: &Graph,
    roots: &[NodeId],
    successors: &HashMap<NodeId, Vec<NodeId>>,
) -> Result<Vec<NodeId>, GraphConfigError> {
    let mut visited: HashSet<NodeId> = HashSet::new();
    let mut postorder: Vec<NodeId> = Vec::new();
    for root in roots {
        walk(root, successors, &mut visited, &mut Vec::new(), &mut postorder)?;
    }
    let unreached: Vec<NodeId> = graph
        .nodes()
        .map(|n| n.id().to_string())
        .filter(|id| !visited.contains(id))
        .collect();
    for id in unreached {
        if !visited.contains(&id) {
            walk(&id, successors, &mut visited, &mut Vec::new(), &mut postorder)?;
        }
    }
    postorder.reverse();
    Ok(postorder)
}

fn walk(
    id: &str,
    successors: &HashMap<NodeId, Vec<NodeId>>,
    visited: &mut HashSet<NodeId>,
    stack: &mut Vec<NodeId>,
    postorder: &mut Vec<NodeId>,
) -> Result<(), GraphConfigError> {
    if let Some(pos) = stack.iter().position(|s| s == id) {
        let mut path: Vec<NodeId> = stack[pos..].to_vec();
        path.push(id.to_string());
        return Err(GraphConfigError::CycleDetected { path });
    }
    if !visited.insert(id.to_string()) {
        return Ok(());
    }
    stack.push(id.to_string());
    for next in successors.get(id).into_iter().flatten() {
        walk(next, successors, visited, stack, postorder)?;
    }
    stack.pop();
    postorder.push(id.to_string());
    Ok(())
}

/// Input edges that must be forced to the non-blocking disk-spill variant.
///
/// A node with two or more inputs whose upstream paths reconverge on a common
/// ancestor can deadlock: the ancestor blocks draining one branch while the
/// converging node blocks waiting on the other. Detected by a reverse walk
/// from each multi-input node; revisiting an upstream id marks the hazard,
/// and then all of that node's input edges are forced.
fn multiple_feed_edges(
    graph: &Graph,
    predecessors: &HashMap<NodeId, Vec<NodeId>>,
) -> HashSet<String> {
    let mut forced: HashSet<String> = HashSet::new();
    for node in graph.nodes() {
        let in_edges = graph.in_edges(node.id());
        if in_edges.len() < 2 {
            continue;
        }
        let mut seen: HashSet<NodeId> = HashSet::new();
        seen.insert(node.id().to_string());
        let mut pending: Vec<NodeId> = vec![node.id().to_string()];
        let mut hazard = false;
        while let Some(current) = pending.pop() {
            for upstream in predecessors.get(&current).into_iter().flatten() {
                if seen.insert(upstream.clone()) {
                    pending.push(upstream.clone());
                } else {
                    hazard = true;
                }
            }
        }
        if hazard {
            debug!(node = node.id(), "Multiple-feed hazard; forcing input edges to buffered");
            forced.extend(in_edges.iter().map(|e| e.id().to_string()));
        }
    }
    forced
}
