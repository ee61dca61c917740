//! Periodic progress snapshots for external monitoring.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::node::{Node, NodeId, NodeResult};

/// Progress of one node at snapshot time.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    pub node: NodeId,
    pub status: NodeResult,
    /// Records read so far, per input port in index order.
    pub records_in: Vec<u64>,
    /// Records written so far, per output port in index order.
    pub records_out: Vec<u64>,
}

impl NodeSnapshot {
    pub(crate) fn of(node: &Node) -> Self {
        let (records_in, records_out) = node.port_counts();
        Self {
            node: node.id().to_string(),
            status: node.result_code(),
            records_in,
            records_out,
        }
    }
}

/// One tick of the supervisor's progress poll.
#[derive(Debug, Clone, Serialize)]
pub struct TrackingSnapshot {
    pub run_id: Uuid,
    pub phase: u32,
    pub taken_at: DateTime<Utc>,
    pub nodes: Vec<NodeSnapshot>,
}

/// Consumer of periodic snapshots. Implementations must not block: the
/// supervisor calls this on its polling thread between ticks.
pub trait TrackingSink: Send {
    fn on_snapshot(&mut self, snapshot: &TrackingSnapshot);
}

/// Default sink that reports progress through the log.
pub struct LogTrackingSink;

impl TrackingSink for LogTrackingSink {
    fn on_snapshot(&mut self, snapshot: &TrackingSnapshot) {
        for node in &snapshot.nodes {
            info!(
                run = %snapshot.run_id,
                phase = snapshot.phase,
                node = %node.node,
                status = %node.status,
                records_in = node.records_in.iter().sum::<u64>(),
                records_out = node.records_out.iter().sum::<u64>(),
                "Progress"
            );
        }
    }
}
