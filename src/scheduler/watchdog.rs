//! The supervising scheduler ("watchdog").
//!
//! Runs phases in ascending order, one OS thread per node per phase,
//! polling a message queue on a fixed tick. The watchdog itself performs no
//! record I/O: it only watches for terminations, emits progress snapshots,
//! and drives the abort path on fatal failures.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::errors::RunError;
use crate::graph::{analyze, Graph};
use crate::node::{Node, NodeId, NodeResult};
use crate::phase::Phase;
use crate::scheduler::message::NodeMessage;
use crate::scheduler::tracking::{LogTrackingSink, NodeSnapshot, TrackingSink, TrackingSnapshot};

/// Overall outcome of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    NotRun,
    Running,
    FinishedOk,
    Error,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunStatus::NotRun => "not-run",
            RunStatus::Running => "running",
            RunStatus::FinishedOk => "finished-ok",
            RunStatus::Error => "error",
        };
        f.write_str(name)
    }
}

/// Timing and backlog statistics for one executed phase.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseSummary {
    pub number: u32,
    pub ok: bool,
    pub duration: Duration,
    /// Highest number of records sitting unread in channels, sampled on the
    /// poll tick.
    pub peak_queued_records: u64,
    /// Highest payload byte count sitting unread in channels, sampled on the
    /// same ticks.
    pub peak_queued_bytes: u64,
}

/// Everything the caller learns about a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub status: RunStatus,
    /// First node whose failure decided the run's outcome.
    pub cause_node: Option<NodeId>,
    pub cause_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub phases: Vec<PhaseSummary>,
    /// Final state of every node that ran.
    pub nodes: Vec<NodeSnapshot>,
}

struct PhaseOutcome {
    ok: bool,
    cause: Option<(NodeId, String)>,
    summary: PhaseSummary,
}

/// Phase scheduler and run supervisor.
pub struct WatchDog {
    config: EngineConfig,
    graph: Graph,
    phases: Vec<Phase>,
    status: RunStatus,
    sink: Box<dyn TrackingSink>,
}

impl WatchDog {
    /// Analyze the graph and prepare its phases. Configuration errors
    /// surface here, before any thread starts.
    pub fn new(mut graph: Graph, config: EngineConfig) -> Result<Self, RunError> {
        let phases = analyze(&mut graph)?;
        Ok(Self {
            config,
            graph,
            phases,
            status: RunStatus::NotRun,
            sink: Box::new(LogTrackingSink),
        })
    }

    /// Replace the default log sink for progress snapshots.
    pub fn with_tracking_sink(mut self, sink: Box<dyn TrackingSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    /// Execute every phase in ascending order. Runtime failures are reported
    /// in the returned summary; `Err` is reserved for setup problems such as
    /// a phase that cannot materialize its channels. A watchdog runs at most
    /// once.
    pub fn run(&mut self) -> Result<RunSummary, RunError> {
        if self.status != RunStatus::NotRun {
            return Err(RunError::AlreadyRun);
        }
        self.status = RunStatus::Running;
        let started_at = Utc::now();
        info!(run = %self.config.run_id, phases = self.phases.len(), "Run starting");

        let mut summaries = Vec::with_capacity(self.phases.len());
        let mut cause: Option<(NodeId, String)> = None;
        for idx in 0..self.phases.len() {
            let number = self.phases[idx].number();
            info!(phase = number, "Phase starting");
            if let Err(source) = self.phases[idx].init(&self.graph, &self.config) {
                self.phases[idx].finish(false);
                self.phases[idx].free();
                self.status = RunStatus::Error;
                error!(phase = number, %source, "Phase initialization failed");
                return Err(RunError::PhaseInit {
                    phase: number,
                    source,
                });
            }
            let outcome = self.execute_phase(idx);
            self.phases[idx].finish(outcome.ok);
            self.phases[idx].free();
            summaries.push(outcome.summary);
            if !outcome.ok {
                cause = outcome.cause;
                self.status = RunStatus::Error;
                error!(phase = number, "Phase failed; no later phase starts");
                break;
            }
            info!(phase = number, "Phase finished");
        }

        if self.status == RunStatus::Running {
            self.status = RunStatus::FinishedOk;
        }
        let (cause_node, cause_message) = match cause {
            Some((node, message)) => (Some(node), Some(message)),
            None => (None, None),
        };
        let nodes = self.graph.nodes().map(|n| NodeSnapshot::of(n)).collect();
        info!(run = %self.config.run_id, status = %self.status, "Run complete");
        Ok(RunSummary {
            run_id: self.config.run_id,
            status: self.status,
            cause_node,
            cause_message,
            started_at,
            finished_at: Utc::now(),
            phases: summaries,
            nodes,
        })
    }

    fn execute_phase(&mut self, idx: usize) -> PhaseOutcome {
        let (number, nodes, mut leaves) = {
            let phase = &mut self.phases[idx];
            phase.set_running();
            (
                phase.number(),
                phase.nodes().to_vec(),
                phase.leaves().clone(),
            )
        };
        let started = Instant::now();
        let (tx, rx) = unbounded::<NodeMessage>();
        let mut handles: HashMap<NodeId, JoinHandle<()>> = HashMap::new();
        let mut watching: HashSet<NodeId> = HashSet::new();
        let mut cause: Option<(NodeId, String)> = None;
        let mut fatal = false;

        for node in &nodes {
            let id = node.id().to_string();
            let node = Arc::clone(node);
            let tx = tx.clone();
            let spawned = thread::Builder::new()
                .name(format!("node-{id}"))
                .spawn(move || {
                    let result = node.run();
                    let _ = tx.send(NodeMessage::Finished {
                        node: node.id().to_string(),
                        result,
                    });
                });
            match spawned {
                Ok(handle) => {
                    handles.insert(id.clone(), handle);
                    watching.insert(id);
                }
                Err(err) => {
                    error!(node = %id, %err, "Failed to spawn node thread");
                    cause = Some((id, format!("Failed to spawn node thread: {err}")));
                    fatal = true;
                    break;
                }
            }
        }
        drop(tx);

        let mut peak: u64 = 0;
        let mut peak_bytes: u64 = 0;
        if !fatal {
            while !leaves.is_empty() && !watching.is_empty() {
                match rx.recv_timeout(self.config.tracking_interval) {
                    Ok(NodeMessage::Finished { node, result }) => {
                        if let Some(handle) = handles.remove(&node) {
                            let _ = handle.join();
                        }
                        watching.remove(&node);
                        leaves.remove(&node);
                        match result {
                            NodeResult::FatalError => {
                                if cause.is_none() {
                                    cause = Some((node.clone(), result_message(&nodes, &node)));
                                }
                                fatal = true;
                            }
                            NodeResult::Error => {
                                // Recorded, but siblings keep running.
                                if cause.is_none() {
                                    cause = Some((node.clone(), result_message(&nodes, &node)));
                                }
                            }
                            _ => {}
                        }
                        if fatal {
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        let (records, bytes) = self.queued_backlog();
                        peak = peak.max(records);
                        peak_bytes = peak_bytes.max(bytes);
                        self.emit_snapshot(number, &nodes);
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        }

        if fatal {
            // Interrupt every survivor, then give the phase a bounded window
            // to wind down.
            warn!(phase = number, "Fatal node result; aborting phase");
            for node in &nodes {
                if watching.contains(node.id()) {
                    node.abort();
                }
            }
        }
        self.drain_stragglers(&nodes, &mut handles, &rx, &mut watching);
        let (records, bytes) = self.queued_backlog();
        peak = peak.max(records);
        peak_bytes = peak_bytes.max(bytes);

        let ok = cause.is_none();
        PhaseOutcome {
            ok,
            cause,
            summary: PhaseSummary {
                number,
                ok,
                duration: started.elapsed(),
                peak_queued_records: peak,
                peak_queued_bytes: peak_bytes,
            },
        }
    }

    /// Wait out still-running threads after the phase's outcome is already
    /// decided. Threads that outlive the abort timeout are interrupted,
    /// marked aborted, and detached.
    fn drain_stragglers(
        &mut self,
        nodes: &[Arc<Node>],
        handles: &mut HashMap<NodeId, JoinHandle<()>>,
        rx: &Receiver<NodeMessage>,
        watching: &mut HashSet<NodeId>,
    ) {
        let deadline = Instant::now() + self.config.abort_timeout;
        while !watching.is_empty() && Instant::now() < deadline {
            match rx.recv_timeout(self.config.abort_grace) {
                Ok(NodeMessage::Finished { node, .. }) => {
                    if let Some(handle) = handles.remove(&node) {
                        let _ = handle.join();
                    }
                    watching.remove(&node);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        if watching.is_empty() {
            return;
        }
        for node in nodes {
            if watching.remove(node.id()) {
                warn!(node = node.id(), "Node did not stop in time; force-escalating to aborted");
                node.abort();
                node.force_aborted();
                handles.remove(node.id());
            }
        }
    }

    /// Records and payload bytes currently written but unread across all
    /// live channels.
    fn queued_backlog(&self) -> (u64, u64) {
        self.graph
            .edges()
            .filter_map(|e| e.channel())
            .fold((0, 0), |(records, bytes), c| {
                let counters = c.counters();
                (records + counters.in_flight(), bytes + counters.queued_bytes())
            })
    }

    fn emit_snapshot(&mut self, phase: u32, nodes: &[Arc<Node>]) {
        let snapshot = TrackingSnapshot {
            run_id: self.config.run_id,
            phase,
            taken_at: Utc::now(),
            nodes: nodes.iter().map(|n| NodeSnapshot::of(n)).collect(),
        };
        self.sink.on_snapshot(&snapshot);
    }
}

fn result_message(nodes: &[Arc<Node>], id: &str) -> String {
    nodes
        .iter()
        .find(|n| n.id() == id)
        .and_then(|n| n.result_msg())
        .unwrap_or_else(|| "No message".to_string())
}
