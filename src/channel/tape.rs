//! Cross-phase tape channel.
//!
//! Connects a writer in one phase to a reader in a later phase, so the whole
//! stream is on disk before the first read. The two endpoints are never live
//! at the same time by contract; interleaving is reported as a protocol error
//! instead of being left undefined.

use std::path::PathBuf;
use std::sync::{Condvar, Mutex};

use crate::channel::spill::SpillLog;
use crate::channel::{lock, wait, Channel, ChannelCounters};
use crate::config::EngineConfig;
use crate::errors::ChannelError;
use crate::record::Record;

struct TapeState {
    log: Option<SpillLog>,
    reading_started: bool,
    eos_written: bool,
    interrupted: bool,
}

/// Write-then-read record tape backed by a disk log. The writer never
/// blocks; the reader never blocks either, since end of stream is already
/// known when its phase starts.
pub struct TapeChannel {
    state: Mutex<TapeState>,
    cond: Condvar,
    scratch_dir: PathBuf,
    staging_size: usize,
    counters: ChannelCounters,
}

impl TapeChannel {
    pub(crate) fn new(config: &EngineConfig) -> Self {
        Self {
            state: Mutex::new(TapeState {
                log: None,
                reading_started: false,
                eos_written: false,
                interrupted: false,
            }),
            cond: Condvar::new(),
            scratch_dir: config.scratch_dir.clone(),
            staging_size: config.spill_staging_size,
            counters: ChannelCounters::default(),
        }
    }
}

impl Channel for TapeChannel {
    fn init(&self) -> Result<(), ChannelError> {
        let mut state = lock(&self.state);
        state.log = Some(SpillLog::create(&self.scratch_dir, self.staging_size)?);
        Ok(())
    }

    fn open(&self) {
        let mut state = lock(&self.state);
        state.reading_started = false;
        state.eos_written = false;
        state.interrupted = false;
    }

    fn close(&self) {
        lock(&self.state).log = None;
    }

    fn write_record(&self, rec: Record) -> Result<(), ChannelError> {
        let mut state = lock(&self.state);
        if state.interrupted {
            return Err(ChannelError::Interrupted);
        }
        if state.reading_started {
            return Err(ChannelError::Protocol(
                "write on a phase tape already being read".into(),
            ));
        }
        if state.eos_written {
            return Err(ChannelError::WriteAfterEos);
        }
        let len = rec.len();
        state
            .log
            .as_mut()
            .ok_or_else(|| ChannelError::Protocol("write on uninitialized channel".into()))?
            .append(&rec)?;
        self.counters.on_write(len);
        Ok(())
    }

    fn read_record(&self) -> Result<Option<Record>, ChannelError> {
        let mut state = lock(&self.state);
        if state.interrupted {
            return Err(ChannelError::Interrupted);
        }
        if !state.reading_started {
            if !state.eos_written {
                return Err(ChannelError::Protocol(
                    "read on a phase tape before its stream is complete".into(),
                ));
            }
            // The stream is complete; position the tape at its beginning.
            state.reading_started = true;
            if let Some(log) = state.log.as_mut() {
                log.rewind()?;
            }
        }
        let rec = state
            .log
            .as_mut()
            .ok_or_else(|| ChannelError::Protocol("read on uninitialized channel".into()))?
            .read_next()?;
        if let Some(r) = &rec {
            self.counters.on_read(r.len());
        }
        Ok(rec)
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
        state.eos_written && state.log.as_ref().is_some_and(|l| !l.is_empty())
    }

    fn is_eos(&self) -> bool {
        let state = lock(&self.state);
        state.eos_written && state.log.as_ref().is_none_or(|l| l.is_empty())
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
