//! Record channels connecting graph nodes.
//!
//! Every edge of the graph is backed by one channel with exactly one writer
//! thread and one reader thread. Variants trade latency against blocking
//! behavior: [`DirectChannel`] hands over whole batches, [`FastPropagateChannel`]
//! makes each record visible immediately, [`BufferedChannel`] and
//! [`HybridChannel`] never block the writer by spilling to disk, and
//! [`TapeChannel`] carries records across a phase boundary.

mod buffered;
mod direct;
mod fast_propagate;
mod hybrid;
mod ring;
mod spill;
mod tape;

pub use buffered::BufferedChannel;
pub use direct::DirectChannel;
pub use fast_propagate::FastPropagateChannel;
pub use hybrid::HybridChannel;
pub use tape::TapeChannel;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::EngineConfig;
use crate::errors::ChannelError;
use crate::record::Record;

/// Lock a mutex, recovering the guard if a peer thread panicked while holding
/// it. Channel state stays structurally valid across panics, and the runtime
/// aborts the run on node panic anyway.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Condvar wait with the same poison recovery as [`lock`].
pub(crate) fn wait<'a, T>(
    cond: &std::sync::Condvar,
    guard: MutexGuard<'a, T>,
) -> MutexGuard<'a, T> {
    cond.wait(guard).unwrap_or_else(PoisonError::into_inner)
}

/// The channel variant an edge is backed by.
///
/// Declared per edge by the caller or chosen by topology analysis; the
/// analyzer may upgrade a declared variant when the topology requires it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ChannelKind {
    /// Batch handoff through two swapped byte buffers; writer blocks when
    /// both are full.
    Direct,
    /// Bounded record ring with per-record visibility; writer blocks when the
    /// ring is full.
    FastPropagate,
    /// Never-blocking memory FIFO that spills to disk past its cap.
    Buffered,
    /// Per-record visibility at low load, spilling like `Buffered` under
    /// overrun. Required on edges where blocking could deadlock.
    BufferedFastPropagate,
    /// Cross-phase tape: the whole stream is written in one phase and read in
    /// a later one.
    PhaseTape,
}

impl ChannelKind {
    /// Construct an unallocated channel of this kind. Buffers are allocated
    /// by [`Channel::init`], so a misconfigured graph fails at phase init
    /// rather than during graph construction.
    pub fn create(self, config: &EngineConfig) -> Arc<dyn Channel> {
        match self {
            ChannelKind::Direct => Arc::new(DirectChannel::new(config)),
            ChannelKind::FastPropagate => Arc::new(FastPropagateChannel::new(config)),
            ChannelKind::Buffered => Arc::new(BufferedChannel::new(config)),
            ChannelKind::BufferedFastPropagate => Arc::new(HybridChannel::new(config)),
            ChannelKind::PhaseTape => Arc::new(TapeChannel::new(config)),
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ChannelKind::Direct => "direct",
            ChannelKind::FastPropagate => "fast-propagate",
            ChannelKind::Buffered => "buffered",
            ChannelKind::BufferedFastPropagate => "buffered-fast-propagate",
            ChannelKind::PhaseTape => "phase-tape",
        };
        f.write_str(name)
    }
}

/// Shared flow counters, updated by the owning channel and read by tracking.
#[derive(Debug, Default)]
pub struct ChannelCounters {
    records_written: AtomicU64,
    records_read: AtomicU64,
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
}

impl ChannelCounters {
    pub(crate) fn on_write(&self, bytes: usize) {
        self.records_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn on_read(&self, bytes: usize) {
        self.records_read.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn records_written(&self) -> u64 {
        self.records_written.load(Ordering::Relaxed)
    }

    pub fn records_read(&self) -> u64 {
        self.records_read.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    /// Records written but not yet read.
    pub fn in_flight(&self) -> u64 {
        self.records_written()
            .saturating_sub(self.records_read())
    }

    /// Payload bytes written but not yet read; the channel's memory estimate.
    pub fn queued_bytes(&self) -> u64 {
        self.bytes_written().saturating_sub(self.bytes_read())
    }
}

/// A single-writer, single-reader record stream between two nodes.
///
/// All methods take `&self`: a channel is shared as `Arc<dyn Channel>` between
/// its writer thread, its reader thread, and the supervisor.
pub trait Channel: Send + Sync {
    /// Allocate buffers and backing storage. Called once, at init of the
    /// phase in which the writer runs.
    fn init(&self) -> Result<(), ChannelError>;

    /// Reset stream state for the run. Called after `init`, before either
    /// endpoint thread starts.
    fn open(&self);

    /// Release buffers and backing storage. Called when the reader's phase
    /// completes.
    fn close(&self);

    /// Append one record. May block depending on the variant; blocked calls
    /// return [`ChannelError::Interrupted`] after [`Channel::interrupt`].
    fn write_record(&self, record: Record) -> Result<(), ChannelError>;

    /// Take the next record, blocking until one is available. `None` means
    /// end of stream; every call after that also returns `None`.
    fn read_record(&self) -> Result<Option<Record>, ChannelError>;

    /// Mark the stream complete. No `write_record` may follow.
    fn signal_eos(&self) -> Result<(), ChannelError>;

    /// Whether a `read_record` call would return without blocking.
    fn has_data(&self) -> bool;

    /// Whether end of stream was signalled and all records were consumed.
    fn is_eos(&self) -> bool;

    /// Block until the writer signals end of stream. Does not consume
    /// records.
    fn wait_for_eos(&self) -> Result<(), ChannelError>;

    /// Wake every blocked endpoint with [`ChannelError::Interrupted`]. Used
    /// when aborting a phase; the channel is unusable afterwards.
    fn interrupt(&self);

    /// Flow counters for tracking.
    fn counters(&self) -> &ChannelCounters;

    /// Append one record given as a byte slice.
    fn write_raw(&self, data: &[u8]) -> Result<(), ChannelError> {
        self.write_record(Record::copy_from_slice(data))
    }

    /// Take the next record as its byte payload.
    fn read_raw(&self) -> Result<Option<bytes::Bytes>, ChannelError> {
        Ok(self.read_record()?.map(Record::into_bytes))
    }
}
