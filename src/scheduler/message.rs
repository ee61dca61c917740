//! Messages node threads send to the supervising thread.

use crate::node::{NodeId, NodeResult};

/// Posted by a node thread as its last action before exiting.
#[derive(Debug, Clone)]
pub(crate) enum NodeMessage {
    Finished { node: NodeId, result: NodeResult },
}
