//! Graph construction and topology analysis.

mod analyzer;
#[allow(clippy::module_inception)]
mod graph;

pub use analyzer::analyze;
pub use graph::{Edge, EdgeId, Graph};
