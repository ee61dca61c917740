//! Bounded ring channel with per-record visibility.

use std::sync::{Condvar, Mutex};

use crate::channel::ring::RecordRing;
use crate::channel::{lock, wait, Channel, ChannelCounters};
use crate::config::EngineConfig;
use crate::errors::ChannelError;
use crate::record::Record;

struct FastState {
    ring: Option<RecordRing>,
    eos_written: bool,
    interrupted: bool,
}

/// Low-latency channel: each written record is visible to the reader as soon
/// as the write returns. The writer blocks while the ring is full, so this
/// variant is the right feed for nodes that propagate records onward quickly,
/// and the wrong one for edges where the reader may stall behind another
/// input.
pub struct FastPropagateChannel {
    state: Mutex<FastState>,
    cond: Condvar,
    ring_slots: usize,
    counters: ChannelCounters,
}

impl FastPropagateChannel {
    pub(crate) fn new(config: &EngineConfig) -> Self {
        Self {
            state: Mutex::new(FastState {
                ring: None,
                eos_written: false,
                interrupted: false,
            }),
            cond: Condvar::new(),
            ring_slots: config.ring_slots,
            counters: ChannelCounters::default(),
        }
    }
}

impl Channel for FastPropagateChannel {
    fn init(&self) -> Result<(), ChannelError> {
        let mut state = lock(&self.state);
        state.ring = Some(RecordRing::new(self.ring_slots));
        Ok(())
    }

    fn open(&self) {
        let mut state = lock(&self.state);
        if let Some(ring) = state.ring.as_mut() {
            ring.clear();
        }
        state.eos_written = false;
        state.interrupted = false;
    }

    fn close(&self) {
        lock(&self.state).ring = None;
    }

    fn write_record(&self, rec: Record) -> Result<(), ChannelError> {
        let mut state = lock(&self.state);
        if state.interrupted {
            return Err(ChannelError::Interrupted);
        }
        if state.eos_written {
            return Err(ChannelError::WriteAfterEos);
        }
        let mut rec = rec;
        let len = rec.len();
        loop {
            let ring = state
                .ring
                .as_mut()
                .ok_or_else(|| ChannelError::Protocol("write on uninitialized channel".into()))?;
            match ring.push(rec) {
                Ok(()) => {
                    self.counters.on_write(len);
                    self.cond.notify_all();
                    return Ok(());
                }
                Err(rejected) => {
                    rec = rejected;
                    state = wait(&self.cond, state);
                    if state.interrupted {
                        return Err(ChannelError::Interrupted);
                    }
                }
            }
        }
    }

    fn read_record(&self) -> Result<Option<Record>, ChannelError> {
        let mut state = lock(&self.state);
        loop {
            let ring = state
                .ring
                .as_mut()
                .ok_or_else(|| ChannelError::Protocol("read on uninitialized channel".into()))?;
            if let Some(rec) = ring.pop() {
                self.counters.on_read(rec.len());
                self.cond.notify_all();
                return Ok(Some(rec));
            }
            if state.eos_written {
                return Ok(None);
            }
            if state.interrupted {
                return Err(ChannelError::Interrupted);
            }
            state = wait(&self.cond, state);
        }
    }

    fn signal_eos(&self) -> Result<(), ChannelError> {
        let mut state = lock(&self.state);
        if state.interrupted {
            return Err(ChannelError::Interrupted);
        }
        state.eos_written = true;
        self.cond.notify_all();
        Ok(())
    }

    fn has_data(&self) -> bool {
        let state = lock(&self.state);
        state.ring.as_ref().is_some_and(|r| !r.is_empty())
    }

    fn is_eos(&self) -> bool {
        let state = lock(&self.state);
        state.eos_written && state.ring.as_ref().is_none_or(|r| r.is_empty())
    }

    fn wait_for_eos(&self) -> Result<(), ChannelError> {
        let mut state = lock(&self.state);
        while !state.eos_written {
            if state.interrupted {
                return Err(ChannelError::Interrupted);
            }
            state = wait(&self.cond, state);
        }
        Ok(())
    }

    fn interrupt(&self) {
        let mut state = lock(&self.state);
        state.interrupted = true;
        self.cond.notify_all();
    }

    fn counters(&self) -> &ChannelCounters {
        &self.counters
    }
}
