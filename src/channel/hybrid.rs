//! Fast-propagate channel with a never-blocking writer.
//!
//! While the reader keeps pace, both endpoints share one ring for minimal
//! latency. When the writer outruns the reader it switches to the second
//! ring; if that fills too before the reader catches up, its content is
//! spilled to a disk log and the channel runs disk-backed until the backlog
//! drains, then reverts to the shared ring.

use std::path::PathBuf;
use std::sync::{Condvar, Mutex};

use crate::channel::ring::RecordRing;
use crate::channel::spill::SpillLog;
use crate::channel::{lock, wait, Channel, ChannelCounters};
use crate::config::EngineConfig;
use crate::errors::ChannelError;
use crate::record::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HybridMode {
    /// Reader and writer share one ring.
    Shared,
    /// Writer fills the second ring while the reader drains the first.
    Split,
    /// Both rings gave out; the backlog lives on disk and all writes append
    /// to the log.
    Spilling,
}

struct HybridState {
    rings: Option<[RecordRing; 2]>,
    reader_ring: usize,
    writer_ring: usize,
    mode: HybridMode,
    log: Option<SpillLog>,
    eos_written: bool,
    interrupted: bool,
}

/// Switch the writer to the idle ring, leaving the reader to drain the shared
/// one. The caller holds the state lock and must notify the condvar after the
/// switch so a reader blocked on the abandoned ring wakes and re-polls the
/// full state instead of sleeping on a ring the writer no longer fills.
///
/// Invariant on entry: mode is `Shared` and the idle ring is empty.
fn switch_to_split(state: &mut HybridState) {
    debug_assert_eq!(state.mode, HybridMode::Shared);
    state.writer_ring = 1 - state.reader_ring;
    debug_assert!(state
        .rings
        .as_ref()
        .is_some_and(|r| r[state.writer_ring].is_empty()));
    state.mode = HybridMode::Split;
}

/// Move the writer ring's entire content to the disk log in FIFO order and
/// enter disk-backed mode.
fn spill_writer_ring(state: &mut HybridState) -> Result<(), ChannelError> {
    debug_assert_eq!(state.mode, HybridMode::Split);
    let (rings, log) = match (state.rings.as_mut(), state.log.as_mut()) {
        (Some(rings), Some(log)) => (rings, log),
        _ => {
            return Err(ChannelError::Protocol(
                "spill on uninitialized channel".into(),
            ))
        }
    };
    while let Some(rec) = rings[state.writer_ring].pop() {
        log.append(&rec)?;
    }
    state.mode = HybridMode::Spilling;
    Ok(())
}

/// Two-ring channel that propagates records immediately but never blocks the
/// writer. This is the variant topology analysis forces onto edges where a
/// blocking writer could close a circular wait.
pub struct HybridChannel {
    state: Mutex<HybridState>,
    cond: Condvar,
    ring_slots: usize,
    scratch_dir: PathBuf,
    staging_size: usize,
    counters: ChannelCounters,
}

impl HybridChannel {
    pub(crate) fn new(config: &EngineConfig) -> Self {
        Self {
            state: Mutex::new(HybridState {
                rings: None,
                reader_ring: 0,
                writer_ring: 0,
                mode: HybridMode::Shared,
                log: None,
                eos_written: false,
                interrupted: false,
            }),
            cond: Condvar::new(),
            ring_slots: config.ring_slots,
            scratch_dir: config.scratch_dir.clone(),
            staging_size: config.spill_staging_size,
            counters: ChannelCounters::default(),
        }
    }
}

impl Channel for HybridChannel {
    fn init(&self) -> Result<(), ChannelError> {
        let mut state = lock(&self.state);
        state.rings = Some([
            RecordRing::new(self.ring_slots),
            RecordRing::new(self.ring_slots),
        ]);
        state.log = Some(SpillLog::create(&self.scratch_dir, self.staging_size)?);
        Ok(())
    }

    fn open(&self) {
        let mut state = lock(&self.state);
        if let Some(rings) = state.rings.as_mut() {
            rings[0].clear();
            rings[1].clear();
        }
        state.reader_ring = 0;
        state.writer_ring = 0;
        state.mode = HybridMode::Shared;
        state.eos_written = false;
        state.interrupted = false;
    }

    fn close(&self) {
        let mut state = lock(&self.state);
        state.rings = None;
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
        let st = &mut *state;
        match st.mode {
            HybridMode::Shared | HybridMode::Split => {
                let rings = st.rings.as_mut().ok_or_else(|| {
                    ChannelError::Protocol("write on uninitialized channel".into())
                })?;
                if !rings[st.writer_ring].is_full() {
                    let _ = rings[st.writer_ring].push(rec);
                } else if st.mode == HybridMode::Shared {
                    // Shared ring full: leave it to the reader and start
                    // filling the idle ring.
                    switch_to_split(st);
                    if let Some(rings) = st.rings.as_mut() {
                        // The idle ring is empty by invariant.
                        let _ = rings[st.writer_ring].push(rec);
                    }
                } else {
                    // Second ring full too: the reader is far behind.
                    spill_writer_ring(st)?;
                    if let Some(log) = st.log.as_mut() {
                        log.append(&rec)?;
                    }
                }
            }
            HybridMode::Spilling => {
                let drained = st.log.as_ref().is_some_and(|l| l.is_empty())
                    && st
                        .rings
                        .as_ref()
                        .is_some_and(|r| r[0].is_empty() && r[1].is_empty());
                if drained {
                    // Backlog gone; rejoin the reader on one shared ring.
                    st.mode = HybridMode::Shared;
                    st.reader_ring = st.writer_ring;
                    if let Some(rings) = st.rings.as_mut() {
                        let _ = rings[st.writer_ring].push(rec);
                    }
                } else {
                    st.log
                        .as_mut()
                        .ok_or_else(|| {
                            ChannelError::Protocol("write on uninitialized channel".into())
                        })?
                        .append(&rec)?;
                }
            }
        }
        self.counters.on_write(len);
        self.cond.notify_all();
        Ok(())
    }

    fn read_record(&self) -> Result<Option<Record>, ChannelError> {
        let mut state = lock(&self.state);
        loop {
            let st = &mut *state;
            let rings = st
                .rings
                .as_mut()
                .ok_or_else(|| ChannelError::Protocol("read on uninitialized channel".into()))?;
            if let Some(rec) = rings[st.reader_ring].pop() {
                self.counters.on_read(rec.len());
                return Ok(Some(rec));
            }
            match st.mode {
                HybridMode::Split => {
                    // Caught up with the abandoned ring; rejoin the writer.
                    st.reader_ring = st.writer_ring;
                    st.mode = HybridMode::Shared;
                }
                HybridMode::Spilling => {
                    let log = st.log.as_mut().ok_or_else(|| {
                        ChannelError::Protocol("read on uninitialized channel".into())
                    })?;
                    if let Some(rec) = log.read_next()? {
                        self.counters.on_read(rec.len());
                        return Ok(Some(rec));
                    }
                    // Backlog drained; revert to the shared ring.
                    st.reader_ring = st.writer_ring;
                    st.mode = HybridMode::Shared;
                }
                HybridMode::Shared => {
                    if st.eos_written {
                        return Ok(None);
                    }
                    if st.interrupted {
                        return Err(ChannelError::Interrupted);
                    }
                    state = wait(&self.cond, state);
                }
            }
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
        state
            .rings
            .as_ref()
            .is_some_and(|r| !r[0].is_empty() || !r[1].is_empty())
            || state.log.as_ref().is_some_and(|l| !l.is_empty())
    }

    fn is_eos(&self) -> bool {
        let state = lock(&self.state);
        state.eos_written
            && state
                .rings
                .as_ref()
                .is_none_or(|r| r[0].is_empty() && r[1].is_empty())
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
    use std::time::Duration;

    fn channel(slots: usize) -> Arc<HybridChannel> {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::default()
            .with_scratch_dir(dir.keep())
            .with_ring_slots(slots);
        let ch = Arc::new(HybridChannel::new(&config));
        ch.init().unwrap();
        ch.open();
        ch
    }

    fn rec(n: u32) -> Record {
        Record::from(n.to_le_bytes().to_vec())
    }

    fn mode_of(ch: &HybridChannel) -> HybridMode {
        lock(&ch.state).mode
    }

    #[test]
    fn stays_shared_while_reader_keeps_pace() {
        let ch = channel(4);
        for n in 0..100u32 {
            ch.write_record(rec(n)).unwrap();
            assert_eq!(ch.read_record().unwrap(), Some(rec(n)));
        }
        assert_eq!(mode_of(&ch), HybridMode::Shared);
    }

    #[test]
    fn switch_moves_writer_to_the_idle_ring() {
        let mut state = HybridState {
            rings: Some([RecordRing::new(2), RecordRing::new(2)]),
            reader_ring: 0,
            writer_ring: 0,
            mode: HybridMode::Shared,
            log: None,
            eos_written: false,
            interrupted: false,
        };
        switch_to_split(&mut state);
        assert_eq!(state.mode, HybridMode::Split);
        assert_eq!(state.writer_ring, 1);
        assert_eq!(state.reader_ring, 0);
    }

    #[test]
    fn spill_moves_writer_ring_to_log_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut rings = [RecordRing::new(4), RecordRing::new(4)];
        for n in 0..4u32 {
            rings[1].push(rec(n)).unwrap();
        }
        let mut state = HybridState {
            rings: Some(rings),
            reader_ring: 0,
            writer_ring: 1,
            mode: HybridMode::Split,
            log: Some(SpillLog::create(dir.path(), 64).unwrap()),
            eos_written: false,
            interrupted: false,
        };
        spill_writer_ring(&mut state).unwrap();
        assert_eq!(state.mode, HybridMode::Spilling);
        assert!(state.rings.as_ref().unwrap()[1].is_empty());
        let log = state.log.as_mut().unwrap();
        for n in 0..4u32 {
            assert_eq!(log.read_next().unwrap(), Some(rec(n)));
        }
    }

    #[test]
    fn overrun_spills_without_loss_or_reorder() {
        let ch = channel(4);
        // No reader running: must pass through Split into Spilling without
        // ever blocking.
        for n in 0..1000u32 {
            ch.write_record(rec(n)).unwrap();
        }
        assert_eq!(mode_of(&ch), HybridMode::Spilling);
        ch.signal_eos().unwrap();
        for n in 0..1000u32 {
            assert_eq!(ch.read_record().unwrap(), Some(rec(n)));
        }
        assert_eq!(ch.read_record().unwrap(), None);
        assert!(ch.is_eos());
    }

    #[test]
    fn reverts_to_shared_after_backlog_drains() {
        let ch = channel(2);
        for n in 0..10u32 {
            ch.write_record(rec(n)).unwrap();
        }
        for n in 0..10u32 {
            assert_eq!(ch.read_record().unwrap(), Some(rec(n)));
        }
        ch.write_record(rec(99)).unwrap();
        assert_eq!(ch.read_record().unwrap(), Some(rec(99)));
        assert_eq!(mode_of(&ch), HybridMode::Shared);
    }

    #[test]
    fn concurrent_burst_preserves_count_and_order() {
        let ch = channel(4);
        let writer = {
            let ch = Arc::clone(&ch);
            thread::spawn(move || {
                for n in 0..1000u32 {
                    ch.write_record(rec(n)).unwrap();
                }
                ch.signal_eos().unwrap();
            })
        };
        let mut next = 0u32;
        while let Some(r) = ch.read_record().unwrap() {
            assert_eq!(r, rec(next));
            next += 1;
        }
        assert_eq!(next, 1000);
        writer.join().unwrap();
        assert_eq!(ch.counters().records_written(), 1000);
        assert_eq!(ch.counters().records_read(), 1000);
    }

    #[test]
    fn interrupt_wakes_a_blocked_reader() {
        let ch = channel(4);
        let reader = {
            let ch = Arc::clone(&ch);
            thread::spawn(move || ch.read_record())
        };
        thread::sleep(Duration::from_millis(50));
        ch.interrupt();
        assert!(matches!(
            reader.join().unwrap(),
            Err(ChannelError::Interrupted)
        ));
    }
}
