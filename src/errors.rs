//! Typed error hierarchy for the conveyor runtime.
//!
//! Four top-level enums cover the four subsystems:
//! - `GraphConfigError` — topology analysis failures, detected before any thread starts
//! - `ChannelError` — record channel failures, fatal to the owning phase
//! - `NodeError` — results reported by node transformation logic
//! - `RunError` — scheduler-level failures surfaced to the caller

use thiserror::Error;

/// Errors detected during topology analysis.
///
/// All of these are configuration errors: the run is rejected outright and no
/// node thread is ever started.
#[derive(Debug, Error)]
pub enum GraphConfigError {
    #[error("Duplicate {kind} id: {id}")]
    DuplicateId { kind: &'static str, id: String },

    #[error("Graph has no root node (every node has at least one input port)")]
    NoRoot,

    #[error("Cycle detected in graph: {}", path.join(" -> "))]
    CycleDetected { path: Vec<String> },

    #[error("Edge {edge} runs from phase {writer_phase} back to phase {reader_phase}: reader phase must not precede writer phase")]
    PhaseOrderViolation {
        edge: String,
        writer_phase: u32,
        reader_phase: u32,
    },

    #[error("Unknown node id: {0}")]
    UnknownNode(String),

    #[error("Port {port} of node {node} is already connected")]
    PortAlreadyConnected { node: String, port: usize },

    #[error("Graph was already analyzed; topology is validated exactly once")]
    AlreadyAnalyzed,
}

/// Errors from a single record channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Channel I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to allocate channel buffers: {0}")]
    AllocationFailed(String),

    #[error("Record written after end-of-stream was signaled")]
    WriteAfterEos,

    #[error("Channel protocol violation: {0}")]
    Protocol(String),

    #[error("Blocking channel operation was interrupted by abort")]
    Interrupted,
}

/// Errors returned by node transformation logic.
///
/// A `Recoverable` error marks the node as failed but lets its siblings run to
/// completion; a `Fatal` error makes the scheduler abort the whole phase.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("{0}")]
    Recoverable(String),

    #[error("{0}")]
    Fatal(String),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Errors from the scheduler itself.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] GraphConfigError),

    #[error("Phase {phase} initialization failed: {source}")]
    PhaseInit {
        phase: u32,
        #[source]
        source: ChannelError,
    },

    #[error("Run was already executed; a WatchDog drives exactly one run")]
    AlreadyRun,
}
