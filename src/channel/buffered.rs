//! Never-blocking channel backed by a memory FIFO with disk spill.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Condvar, Mutex};

use crate::channel::spill::SpillLog;
use crate::channel::{lock, wait, Channel, ChannelCounters};
use crate::config::EngineConfig;
use crate::errors::ChannelError;
use crate::record::Record;

struct BufferedState {
    queue: VecDeque<Record>,
    queue_bytes: usize,
    log: Option<SpillLog>,
    eos_written: bool,
    interrupted: bool,
}

/// Unbounded-capacity channel: writes never block. Records queue in memory up
/// to a byte cap, then overflow to a disk log. Ordering is FIFO across the
/// memory/disk boundary: once the log holds a backlog, every new record goes
/// to the log, and the reader drains memory before touching disk. When both
/// are empty the channel reverts to the memory path.
pub struct BufferedChannel {
    state: Mutex<BufferedState>,
    cond: Condvar,
    memory_cap: usize,
    scratch_dir: PathBuf,
    staging_size: usize,
    counters: ChannelCounters,
}

impl BufferedChannel {
    pub(crate) fn new(config: &EngineConfig) -> Self {
        Self {
            state: Mutex::new(BufferedState {
                queue: VecDeque::new(),
                queue_bytes: 0,
                log: None,
                eos_written: false,
                interrupted: false,
            }),
            cond: Condvar::new(),
            memory_cap: config.buffered_memory_cap,
            scratch_dir: config.scratch_dir.clone(),
            staging_size: config.spill_staging_size,
            counters: ChannelCounters::default(),
        }
    }
}

impl Channel for BufferedChannel {
    fn init(&self) -> Result<(), ChannelError> {
        let mut state = lock(&self.state);
        state.log = Some(SpillLog::create(&self.scratch_dir, self.staging_size)?);
        Ok(())
    }

    fn open(&self) {
        let mut state = lock(&self.state);
        state.queue.clear();
        state.queue_bytes = 0;
        state.eos_written = false;
        state.interrupted = false;
    }

    fn close(&self) {
        let mut state = lock(&self.state);
        state.queue = VecDeque::new();
        state.queue_bytes = 0;
        state.log = None;
    }

    fn write_record(&self, rec: Record) -> Result<(), ChannelError> {
        let mut state = lock(&self.state);
        if state.interrupted {
            return Err(ChannelError::Interrupted);
        }
        if state.eos_written {
            return Err(ChannelError::WriteAfterEos);
        }
        let len = rec.len();
        let framed = rec.framed_len();
        let backlog = !state
            .log
            .as_ref()
            .ok_or_else(|| ChannelError::Protocol("write on uninitialized channel".into()))?
            .is_empty();
        let overflow = state.queue_bytes + framed > self.memory_cap && !state.queue.is_empty();
        // Once a backlog exists on disk, all writes follow it to keep FIFO
        // order across the boundary.
        if backlog || overflow {
            if let Some(log) = state.log.as_mut() {
                log.append(&rec)?;
            }
        } else {
            state.queue.push_back(rec);
            state.queue_bytes += framed;
        }
        self.counters.on_write(len);
        self.cond.notify_all();
        Ok(())
    }

    fn read_record(&self) -> Result<Option<Record>, ChannelError> {
        let mut state = lock(&self.state);
        loop {
            if let Some(rec) = state.queue.pop_front() {
                state.queue_bytes -= rec.framed_len();
                self.counters.on_read(rec.len());
                return Ok(Some(rec));
            }
            let log = state
                .log
                .as_mut()
                .ok_or_else(|| ChannelError::Protocol("read on uninitialized channel".into()))?;
            if let Some(rec) = log.read_next()? {
                self.counters.on_read(rec.len());
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
        !state.queue.is_empty() || state.log.as_ref().is_some_and(|l| !l.is_empty())
    }

    fn is_eos(&self) -> bool {
        let state = lock(&self.state);
        state.eos_written
            && state.queue.is_empty()
            && state.log.as_ref().is_none_or(|l| l.is_empty())
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn channel(memory_cap: usize) -> Arc<BufferedChannel> {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::default()
            .with_scratch_dir(dir.keep())
            .with_buffered_memory_cap(memory_cap);
        let ch = Arc::new(BufferedChannel::new(&config));
        ch.init().unwrap();
        ch.open();
        ch
    }

    fn rec(n: u32) -> Record {
        Record::from(n.to_le_bytes().to_vec())
    }

    #[test]
    fn writer_never_blocks_past_the_memory_cap() {
        let ch = channel(64);
        // Far more than fits in 64 bytes; no reader is running.
        for n in 0..1000u32 {
            ch.write_record(rec(n)).unwrap();
        }
        ch.signal_eos().unwrap();
        for n in 0..1000u32 {
            assert_eq!(ch.read_record().unwrap(), Some(rec(n)));
        }
        assert_eq!(ch.read_record().unwrap(), None);
    }

    #[test]
    fn order_holds_across_spill_and_revert() {
        let ch = channel(24);
        for n in 0..10u32 {
            ch.write_record(rec(n)).unwrap();
        }
        for n in 0..10u32 {
            assert_eq!(ch.read_record().unwrap(), Some(rec(n)));
        }
        // Fully drained: back on the memory path.
        ch.write_record(rec(100)).unwrap();
        assert_eq!(ch.read_record().unwrap(), Some(rec(100)));
    }

    #[test]
    fn reader_blocks_until_data_or_eos() {
        let ch = channel(64);
        let reader = {
            let ch = Arc::clone(&ch);
            thread::spawn(move || ch.read_record())
        };
        thread::sleep(std::time::Duration::from_millis(50));
        ch.write_record(rec(9)).unwrap();
        assert_eq!(reader.join().unwrap().unwrap(), Some(rec(9)));
    }

    #[test]
    fn write_after_eos_is_rejected() {
        let ch = channel(64);
        ch.signal_eos().unwrap();
        assert!(matches!(
            ch.write_record(rec(1)),
            Err(ChannelError::WriteAfterEos)
        ));
    }

    #[test]
    fn interrupt_wakes_a_blocked_reader() {
        let ch = channel(64);
        let reader = {
            let ch = Arc::clone(&ch);
            thread::spawn(move || ch.read_record())
        };
        thread::sleep(std::time::Duration::from_millis(50));
        ch.interrupt();
        assert!(matches!(
            reader.join().unwrap(),
            Err(ChannelError::Interrupted)
        ));
    }
}
