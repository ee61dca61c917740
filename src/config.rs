//! Runtime configuration for a conveyor run.

use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Minimum number of slots in a record ring; below this the ring cannot hold
/// one record for each side.
pub const MIN_RING_SLOTS: usize = 2;

/// Configuration for the conveyor engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Unique id of this run, carried in tracking snapshots and log output.
    pub run_id: Uuid,
    /// Directory for per-channel spill files. Defaults to the system temp dir.
    pub scratch_dir: PathBuf,
    /// Poll tick of the scheduler; governs how quickly completion and failure
    /// are noticed and how often tracking snapshots are emitted.
    pub tracking_interval: Duration,
    /// How long the scheduler waits between checks for aborted nodes to yield.
    pub abort_grace: Duration,
    /// Total time the scheduler waits for an aborted phase to wind down before
    /// force-escalating stragglers.
    pub abort_timeout: Duration,
    /// Size in bytes of each of the two buffers of a direct channel.
    pub direct_buffer_size: usize,
    /// Number of record slots in ring-buffer channels (min 2).
    pub ring_slots: usize,
    /// In-memory byte cap of a buffered channel before records spill to disk.
    pub buffered_memory_cap: usize,
    /// Size in bytes of the staging buffer batching spill-log writes.
    pub spill_staging_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            scratch_dir: std::env::temp_dir(),
            tracking_interval: Duration::from_millis(500),
            abort_grace: Duration::from_millis(100),
            abort_timeout: Duration::from_secs(5),
            direct_buffer_size: 64 * 1024,
            ring_slots: 8,
            buffered_memory_cap: 1024 * 1024,
            spill_staging_size: 32 * 1024,
        }
    }
}

impl EngineConfig {
    /// Set the scratch directory for spill files.
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    /// Set the scheduler poll tick.
    pub fn with_tracking_interval(mut self, interval: Duration) -> Self {
        self.tracking_interval = interval;
        self
    }

    /// Set the abort grace period and total abort timeout.
    pub fn with_abort_timing(mut self, grace: Duration, timeout: Duration) -> Self {
        self.abort_grace = grace;
        self.abort_timeout = timeout;
        self
    }

    /// Set the direct channel buffer size.
    pub fn with_direct_buffer_size(mut self, bytes: usize) -> Self {
        self.direct_buffer_size = bytes;
        self
    }

    /// Set the number of ring-buffer slots (clamped to the minimum of 2).
    pub fn with_ring_slots(mut self, slots: usize) -> Self {
        self.ring_slots = slots.max(MIN_RING_SLOTS);
        self
    }

    /// Set the in-memory byte cap of buffered channels.
    pub fn with_buffered_memory_cap(mut self, bytes: usize) -> Self {
        self.buffered_memory_cap = bytes;
        self
    }
}
